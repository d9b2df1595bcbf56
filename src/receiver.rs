//! Monitoring-host receiver and CSV recorder.
//!
//! Listens for relayed datagrams, sorts them by header and appends them to two CSV files in
//! the output directory:
//!
//! ```text
//! Encoder_Data_<run>.csv              IRIG_Data_<run>.csv
//!   quad a, quad b, quad c              seconds of day, rising edge clock
//!   edge index, clock       x150        k, sync pulse clock               x10
//! ```
//!
//! Clocks are the 64-bit logical values. Rows of different widths share one file, so the
//! writers are flexible. Recording stops after a number of IRIG seconds (measured from the
//! first decoded frame, wrapping at midnight) or a number of counter packets.

use crate::data::packets::{CounterPacket, IrigFrame, Packet};
use crate::error::AppResult;
use crate::irig::timecode::{elapsed_seconds, Timecode};
use csv::{Writer, WriterBuilder};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Large enough for every record kind.
const RECV_BUFFER: usize = 8196;

/// Appends decoded records to the two CSV files of a run.
pub struct CsvRecorder {
    encoder: Writer<File>,
    irig: Writer<File>,
    encoder_path: PathBuf,
    irig_path: PathBuf,
}

impl std::fmt::Debug for CsvRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvRecorder")
            .field("encoder_path", &self.encoder_path)
            .field("irig_path", &self.irig_path)
            .finish()
    }
}

impl CsvRecorder {
    /// Create (or truncate) the files for `run_name` in `dir` and write their header rows.
    pub fn create(dir: &Path, run_name: &str) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        let encoder_path = dir.join(format!("Encoder_Data_{run_name}.csv"));
        let irig_path = dir.join(format!("IRIG_Data_{run_name}.csv"));

        let mut encoder = WriterBuilder::new().flexible(true).from_path(&encoder_path)?;
        encoder.write_record(["quadrature a/b/c", "edge index", "clock"])?;
        let mut irig = WriterBuilder::new().flexible(true).from_path(&irig_path)?;
        irig.write_record(["seconds of day", "rising edge clock", "sync pulse clocks"])?;

        info!(encoder = ?encoder_path, irig = ?irig_path, "Recording run {run_name}");
        Ok(Self {
            encoder,
            irig,
            encoder_path,
            irig_path,
        })
    }

    /// Append one counter packet.
    pub fn record_counter(&mut self, packet: &CounterPacket) -> AppResult<()> {
        let q = packet.quadrature;
        self.encoder.write_record(&[
            q.phase_a.to_string(),
            q.phase_b.to_string(),
            q.phase_c.to_string(),
        ])?;
        for edge in &packet.edges {
            self.encoder.write_record(&[
                edge.edge_index.to_string(),
                edge.clock.logical().to_string(),
            ])?;
        }
        Ok(())
    }

    /// Append one IRIG frame stamped with its decoded time of day.
    pub fn record_irig(&mut self, seconds_of_day: u32, frame: &IrigFrame) -> AppResult<()> {
        self.irig.write_record(&[
            seconds_of_day.to_string(),
            frame.rising_edge.logical().to_string(),
        ])?;
        for (k, pulse) in frame.sync_pulses.iter().enumerate() {
            self.irig
                .write_record(&[k.to_string(), pulse.logical().to_string()])?;
        }
        Ok(())
    }

    /// Flush both files.
    pub fn flush(&mut self) -> AppResult<()> {
        self.encoder.flush()?;
        self.irig.flush()?;
        Ok(())
    }

    /// Path of the encoder file.
    pub fn encoder_path(&self) -> &Path {
        &self.encoder_path
    }

    /// Path of the IRIG file.
    pub fn irig_path(&self) -> &Path {
        &self.irig_path
    }
}

/// When the receiver stops recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// After this many IRIG seconds from the first decoded frame.
    Seconds(u32),
    /// After this many counter packets.
    Packets(u64),
}

/// Receiver counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Counter packets recorded.
    pub counter_packets: u64,
    /// IRIG frames recorded.
    pub irig_frames: u64,
    /// Error packets seen.
    pub error_packets: u64,
    /// Datagrams that matched no record layout.
    pub malformed: u64,
    /// IRIG frames whose time fields did not decode.
    pub invalid_timecodes: u64,
}

/// Datagram handler and recording loop.
#[derive(Debug)]
pub struct Receiver {
    recorder: CsvRecorder,
    stop: StopCondition,
    latest: Option<Timecode>,
    /// IRIG seconds since the first frame, accumulated frame to frame across midnight.
    run_seconds: u64,
    stats: ReceiverStats,
}

impl Receiver {
    /// Receiver writing through `recorder` until `stop`.
    pub fn new(recorder: CsvRecorder, stop: StopCondition) -> Self {
        Self {
            recorder,
            stop,
            latest: None,
            run_seconds: 0,
            stats: ReceiverStats::default(),
        }
    }

    /// Decode and record one datagram.
    ///
    /// Malformed datagrams and undecodable timecodes are logged and counted; only recorder
    /// failures are returned as errors.
    pub fn handle(&mut self, datagram: &[u8]) -> AppResult<()> {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(error = %e, len = datagram.len(), "Bad datagram");
                return Ok(());
            }
        };

        match packet {
            Packet::Counter(counter) => {
                self.recorder.record_counter(&counter)?;
                self.stats.counter_packets += 1;
            }
            Packet::Irig(frame) => self.on_frame(&frame)?,
            Packet::Error(state) => {
                self.stats.error_packets += 1;
                warn!(code = state.code.raw(), "Packet error reported by the acquisition side");
            }
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: &IrigFrame) -> AppResult<()> {
        let timecode = match Timecode::decode(&frame.info) {
            Ok(tc) => tc,
            Err(e) => {
                self.stats.invalid_timecodes += 1;
                warn!(error = %e, "IRIG frame with invalid time fields");
                return Ok(());
            }
        };
        if let Some(previous) = self.latest {
            self.run_seconds += u64::from(elapsed_seconds(
                previous.seconds_of_day(),
                timecode.seconds_of_day(),
            ));
        }
        let run = self.run_seconds;
        info!(
            current = %timecode.time().format("%H:%M:%S"),
            run_time = %format!("{}:{:02}:{:02}", run / 3600, run / 60 % 60, run % 60),
            clock = frame.rising_edge.logical(),
            "IRIG frame"
        );
        self.recorder
            .record_irig(timecode.seconds_of_day(), frame)?;
        self.latest = Some(timecode);
        self.stats.irig_frames += 1;
        Ok(())
    }

    /// Whether the stop condition has been reached.
    pub fn is_complete(&self) -> bool {
        match self.stop {
            StopCondition::Packets(n) => self.stats.counter_packets >= n,
            StopCondition::Seconds(n) => {
                self.latest.is_some() && self.run_seconds >= u64::from(n)
            }
        }
    }

    /// Receive from `socket` until the stop condition is reached.
    ///
    /// Logs a waiting notice every `idle_notice` without traffic.
    pub async fn run(
        &mut self,
        socket: &UdpSocket,
        idle_notice: Duration,
    ) -> AppResult<ReceiverStats> {
        let mut buf = vec![0u8; RECV_BUFFER];
        info!(local = %socket.local_addr()?, "Receiver started");
        while !self.is_complete() {
            match tokio::time::timeout(idle_notice, socket.recv_from(&mut buf)).await {
                Err(_) => info!("Waiting for data"),
                Ok(Ok((len, from))) => {
                    debug!(len, %from, "Datagram received");
                    self.handle(&buf[..len])?;
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        self.recorder.flush()?;
        info!(stats = ?self.stats, "Recording complete");
        Ok(self.stats)
    }

    /// Flush the CSV files.
    pub fn flush(&mut self) -> AppResult<()> {
        self.recorder.flush()
    }

    /// Counters so far.
    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// The recorder.
    pub fn recorder(&self) -> &CsvRecorder {
        &self.recorder
    }
}
