//! Host relay: moves finished records from the packet region to the network.
//!
//! The relay polls the three channels, copies out whatever is ready and sends each record
//! as one datagram. It is the only consumer of the region. Error records are always
//! drained so their slot stays usable, but they are only sent when
//! [`RelayConfig::forward_errors`](crate::config::RelayConfig) is on.
//!
//! The relay runs on the async runtime; the sampling loops run on dedicated threads and
//! never wait for it.

use crate::data::layout::{COUNTER_CHANNEL, ERROR_CHANNEL, IRIG_CHANNEL};
use crate::data::packets::{ErrorCode, Packet};
use crate::data::{Consumer, SharedRegion, ShutdownFlag, TakenRecord};
use crate::error::AppResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Where relayed datagrams go.
#[async_trait]
pub trait DatagramSink: Send {
    /// Send one datagram.
    async fn send(&mut self, datagram: Bytes) -> AppResult<()>;
}

/// Collects datagrams in memory.
#[async_trait]
impl DatagramSink for Vec<Bytes> {
    async fn send(&mut self, datagram: Bytes) -> AppResult<()> {
        self.push(datagram);
        Ok(())
    }
}

/// UDP socket with a fixed destination.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl UdpSink {
    /// Bind a socket at `bind` that sends to `destination`.
    pub async fn bind(bind: SocketAddr, destination: SocketAddr) -> AppResult<Self> {
        let socket = UdpSocket::bind(bind).await?;
        info!(local = %socket.local_addr()?, %destination, "Relay socket bound");
        Ok(Self {
            socket,
            destination,
        })
    }

    /// Address datagrams are sent to.
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

#[async_trait]
impl DatagramSink for UdpSink {
    async fn send(&mut self, datagram: Bytes) -> AppResult<()> {
        self.socket.send_to(&datagram, self.destination).await?;
        Ok(())
    }
}

/// Relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Counter packets sent.
    pub counter_packets: u64,
    /// IRIG frames sent.
    pub irig_frames: u64,
    /// Error records sent.
    pub error_records: u64,
    /// Error records drained but not sent.
    pub errors_suppressed: u64,
    /// Sends that failed.
    pub send_failures: u64,
    /// Copies discarded because the producer reclaimed the slot mid-copy.
    pub torn: u64,
}

/// Consumer of all three channels.
#[derive(Debug)]
pub struct HostRelay {
    counters: Consumer,
    frames: Consumer,
    errors: Consumer,
    shutdown: ShutdownFlag,
    forward_errors: bool,
    stats: RelayStats,
}

impl HostRelay {
    /// Relay attached to `region`.
    pub fn new(region: Arc<SharedRegion>, forward_errors: bool) -> Self {
        Self {
            counters: Consumer::new(Arc::clone(&region), COUNTER_CHANNEL),
            frames: Consumer::new(Arc::clone(&region), IRIG_CHANNEL),
            errors: Consumer::new(Arc::clone(&region), ERROR_CHANNEL),
            shutdown: ShutdownFlag::new(region),
            forward_errors,
            stats: RelayStats::default(),
        }
    }

    /// Take every ready record and return the datagrams to send.
    pub fn collect(&mut self) -> Vec<Bytes> {
        let mut out = Vec::with_capacity(3);
        if let Some(record) = self.counters.take() {
            self.stats.counter_packets += 1;
            out.push(record.to_bytes());
        }
        if let Some(record) = self.frames.take() {
            self.stats.irig_frames += 1;
            out.push(record.to_bytes());
        }
        if let Some(record) = self.errors.take() {
            self.on_error_record(&record);
            if self.forward_errors {
                self.stats.error_records += 1;
                out.push(record.to_bytes());
            } else {
                self.stats.errors_suppressed += 1;
            }
        }
        self.stats.torn = self.counters.torn() + self.frames.torn() + self.errors.torn();
        out
    }

    fn on_error_record(&self, record: &TakenRecord) {
        match Packet::from_words(&record.words) {
            Ok(Packet::Error(state)) if state.code == ErrorCode::Desync => {
                warn!("IRIG decoder lost synchronisation");
            }
            Ok(Packet::Error(state)) => debug!(code = state.code.raw(), "Error record"),
            Ok(other) => warn!(header = other.header(), "Unexpected record on error channel"),
            Err(e) => warn!(error = %e, "Malformed error record"),
        }
    }

    /// Whether the decoder has ended the session.
    pub fn is_done(&self) -> bool {
        self.shutdown.is_set()
    }

    /// Relay until the session ends and no record is pending.
    ///
    /// Polls without pausing while records keep arriving and sleeps `idle` after an empty
    /// poll. A failed send is logged and counted; the relay keeps going.
    pub async fn run<S: DatagramSink + ?Sized>(
        &mut self,
        sink: &mut S,
        idle: Duration,
    ) -> RelayStats {
        loop {
            // Read the flag before polling so a record published just before shutdown is
            // still collected on this pass.
            let done = self.is_done();
            let batch = self.collect();
            if batch.is_empty() {
                if done {
                    break;
                }
                tokio::time::sleep(idle).await;
                continue;
            }
            self.send_all(sink, batch).await;
        }
        debug!(stats = ?self.stats, "Relay loop finished");
        self.stats
    }

    /// Send whatever is still pending, once.
    pub async fn drain<S: DatagramSink + ?Sized>(&mut self, sink: &mut S) -> RelayStats {
        let batch = self.collect();
        self.send_all(sink, batch).await;
        self.stats
    }

    async fn send_all<S: DatagramSink + ?Sized>(&mut self, sink: &mut S, batch: Vec<Bytes>) {
        for datagram in batch {
            if let Err(e) = sink.send(datagram).await {
                self.stats.send_failures += 1;
                warn!(error = %e, "Failed to send datagram");
            }
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> RelayStats {
        self.stats
    }
}
