//! Acquisition session orchestration.
//!
//! A session owns the packet region and wires the three participants together:
//!
//! - the edge sampler on a dedicated thread (`encoder-sampler`)
//! - the IRIG decoder on a dedicated thread (`irig-decoder`)
//! - the host relay on the async runtime
//!
//! ## Lifecycle
//!
//! 1. [`Session::prepare`] validates the configuration, maps the region and initialises it.
//! 2. [`Session::run`] runs the optional pin setup command (a failure aborts the session),
//!    opens the hardware and the relay socket, then calls [`Session::run_with`].
//! 3. `run_with` starts both loops, relays until the decoder raises the shutdown flag,
//!    joins the loops and relays anything they published on the way out.
//!
//! The operator stop handle asks the decoder to finish early; the decoder then raises the
//! shutdown flag exactly as it does at the end of a full session.

use crate::config::{Backend, DaqConfig, SimClockMode};
use crate::data::{SharedRegion, ShutdownFlag};
use crate::error::{AppResult, DaqError};
use crate::hardware::mmio::{IepTimer, MmioPort, RegisterBlock, REGISTER_WINDOW};
use crate::hardware::mock::{
    ClockMode, Combined, IrigSignal, QuadratureEncoder, SimClock, SimPort, SimTimer,
};
use crate::hardware::{SignalPort, TickCounter};
use crate::irig::{DecoderStats, IrigDecoder};
use crate::relay::{DatagramSink, HostRelay, RelayStats, UdpSink};
use crate::sampler::{EdgeSampler, SamplerStats};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use tracing::{info, warn};

/// Inputs and timers for both sampling loops.
pub struct Hardware {
    /// Input register read by the sampler.
    pub sampler_port: Box<dyn SignalPort>,
    /// Tick counter read by the sampler.
    pub sampler_timer: Box<dyn TickCounter>,
    /// Input register read by the decoder.
    pub decoder_port: Box<dyn SignalPort>,
    /// Tick counter read (and acknowledged) by the decoder.
    pub decoder_timer: Box<dyn TickCounter>,
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware").finish_non_exhaustive()
    }
}

impl Hardware {
    /// Open the backend selected in `config`.
    pub fn from_config(config: &DaqConfig) -> AppResult<Self> {
        match config.hardware.backend {
            Backend::Simulated => Self::simulated(config),
            Backend::Mmio => Self::mmio(config),
        }
    }

    /// Synthetic encoder and IRIG-B waveforms on one shared virtual clock.
    ///
    /// Both ports see the whole register. In stepped mode the decoder's port drives the
    /// clock and the sampler only observes it.
    pub fn simulated(config: &DaqConfig) -> AppResult<Self> {
        let sim = &config.hardware.simulated;
        let tps = config.clock.ticks_per_second;
        let mode = match sim.clock_mode {
            SimClockMode::Realtime => ClockMode::Realtime {
                ticks_per_second: tps,
            },
            SimClockMode::Stepped => ClockMode::Stepped {
                ticks_per_sample: sim.ticks_per_sample,
            },
        };
        let clock = SimClock::with_mode(mode, sim.start_tick);

        let encoder = QuadratureEncoder::new(
            config.pins.encoder_masks(),
            sim.start_tick,
            sim.encoder_half_period_ticks,
        )
        .with_direction(sim.direction);
        let irig = IrigSignal::new(
            config.pins.irig_mask(),
            sim.start_tick + sim.irig_origin_ticks,
            tps,
            sim.start_timecode()?,
        );

        info!(?mode, start = %sim.start_timecode()?, "Using simulated hardware");
        Ok(Self {
            sampler_port: Box::new(SimPort::following(
                Arc::clone(&clock),
                Combined(encoder.clone(), irig.clone()),
            )),
            sampler_timer: Box::new(SimTimer::new(Arc::clone(&clock))),
            decoder_port: Box::new(SimPort::driving(
                Arc::clone(&clock),
                Combined(encoder, irig),
            )),
            decoder_timer: Box::new(SimTimer::new(clock)),
        })
    }

    /// Memory-mapped GPIO input register and IEP timer.
    pub fn mmio(config: &DaqConfig) -> AppResult<Self> {
        let mmio = &config.hardware.mmio;
        let gpio = RegisterBlock::map(&mmio.device, mmio.gpio_base, REGISTER_WINDOW)?;
        let iep = RegisterBlock::map(&mmio.device, mmio.iep_base, REGISTER_WINDOW)?;
        let timer = IepTimer::new(iep);
        timer.start();

        Ok(Self {
            sampler_port: Box::new(MmioPort::new(
                Arc::clone(&gpio),
                mmio.datain_offset,
                mmio.dataout_offset,
            )),
            sampler_timer: Box::new(timer.clone()),
            decoder_port: Box::new(MmioPort::new(gpio, mmio.datain_offset, mmio.dataout_offset)),
            decoder_timer: Box::new(timer),
        })
    }
}

/// Counters from every participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Edge sampler.
    pub sampler: SamplerStats,
    /// IRIG decoder.
    pub decoder: DecoderStats,
    /// Host relay.
    pub relay: RelayStats,
}

/// One acquisition run.
#[derive(Debug)]
pub struct Session {
    config: DaqConfig,
    region: Arc<SharedRegion>,
    stop: Arc<AtomicBool>,
}

impl Session {
    /// Validate `config`, map the region and reset it.
    pub fn prepare(config: DaqConfig) -> AppResult<Self> {
        config.validate().map_err(DaqError::Configuration)?;
        let region = match &config.region.path {
            Some(path) => SharedRegion::create(path)?,
            None => SharedRegion::anonymous()?,
        };
        region.initialise_session();
        Ok(Self {
            config,
            region,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The packet region.
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Setting this to `true` ends the session after the current decoder iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run with the configured hardware, relaying over UDP.
    pub async fn run(&self) -> AppResult<SessionSummary> {
        if let Some(command) = &self.config.hardware.pin_setup_command {
            run_pin_setup(command).await?;
        }
        let hardware = Hardware::from_config(&self.config)?;
        let bind: SocketAddr = self
            .config
            .relay
            .bind
            .parse()
            .map_err(|e| DaqError::Configuration(format!("Invalid relay.bind: {e}")))?;
        let destination = self.config.destination().map_err(DaqError::Configuration)?;
        let mut sink = UdpSink::bind(bind, destination).await?;
        self.run_with(hardware, &mut sink).await
    }

    /// Run both loops on `hardware` and relay into `sink` until the session ends.
    pub async fn run_with<S: DatagramSink + ?Sized>(
        &self,
        hardware: Hardware,
        sink: &mut S,
    ) -> AppResult<SessionSummary> {
        let Hardware {
            sampler_port,
            sampler_timer,
            decoder_port,
            decoder_timer,
        } = hardware;

        let sampler = EdgeSampler::new(
            sampler_port,
            sampler_timer,
            self.config.pins.encoder_masks(),
            Arc::clone(&self.region),
        );
        let decoder = IrigDecoder::new(
            decoder_port,
            decoder_timer,
            self.config.pins.irig_mask(),
            self.config.clock.thresholds(),
            Arc::clone(&self.region),
        )
        .with_frame_limit(self.config.session.frame_limit())
        .with_stop_request(self.stop_handle());

        info!(
            frames = self.config.session.frame_limit(),
            "Starting acquisition"
        );
        let shutdown = ShutdownFlag::new(Arc::clone(&self.region));
        let guard = shutdown.clone();
        let decoder_handle = spawn_loop(
            Builder::new().name("irig-decoder".into()),
            &self.stop,
            &shutdown,
            move || {
                // Also ends the session if the decoder unwinds.
                let _guard = ShutdownOnDrop(guard);
                decoder.run()
            },
        )?;
        let sampler_handle = spawn_loop(
            Builder::new().name("encoder-sampler".into()),
            &self.stop,
            &shutdown,
            move || sampler.run(),
        )?;

        let mut relay = HostRelay::new(Arc::clone(&self.region), self.config.relay.forward_errors);
        relay.run(sink, self.config.relay.idle_poll).await;

        let decoder_stats = join_producer(decoder_handle, "IRIG decoder").await;
        let sampler_stats = join_producer(sampler_handle, "Edge sampler").await;
        let relay_stats = relay.drain(sink).await;

        let summary = SessionSummary {
            sampler: sampler_stats?,
            decoder: decoder_stats?,
            relay: relay_stats,
        };
        log_summary(&summary);
        Ok(summary)
    }
}

/// Start a sampling loop on its own thread.
///
/// If the thread cannot be created the session is ended, so a loop that is already
/// running stops instead of spinning with nobody to relay for it.
fn spawn_loop<T, F>(
    builder: Builder,
    stop: &AtomicBool,
    shutdown: &ShutdownFlag,
    body: F,
) -> AppResult<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    builder.spawn(body).map_err(|e| {
        warn!(error = %e, "Cannot start sampling thread, ending session");
        stop.store(true, Ordering::Release);
        shutdown.set();
        DaqError::Io(e)
    })
}

struct ShutdownOnDrop(ShutdownFlag);

impl Drop for ShutdownOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

async fn join_producer<T: Send + 'static>(
    handle: JoinHandle<T>,
    name: &'static str,
) -> AppResult<T> {
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .map_err(|_| DaqError::ProducerPanicked(name))?
        .map_err(|_| DaqError::ProducerPanicked(name))
}

async fn run_pin_setup(command: &str) -> AppResult<()> {
    info!(command, "Configuring pins");
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .await
        .map_err(|e| DaqError::PinSetup(format!("cannot run `{command}`: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(DaqError::PinSetup(format!("`{command}` exited with {status}")))
    }
}

fn log_summary(summary: &SessionSummary) {
    let SessionSummary {
        sampler,
        decoder,
        relay,
    } = summary;
    info!(
        edges = sampler.edges,
        packets = sampler.packets_published,
        frames = decoder.frames_published,
        sent_packets = relay.counter_packets,
        sent_frames = relay.irig_frames,
        "Session complete"
    );
    if sampler.overruns > 0 || decoder.overruns > 0 || relay.torn > 0 {
        warn!(
            packet_overruns = sampler.overruns,
            frame_overruns = decoder.overruns,
            torn = relay.torn,
            "Relay fell behind; records were dropped"
        );
    }
    if decoder.desyncs > 0 {
        warn!(
            desyncs = decoder.desyncs,
            syncs = decoder.syncs_acquired,
            "IRIG synchronisation was lost during the session"
        );
    }
    if relay.send_failures > 0 {
        warn!(failures = relay.send_failures, "Some datagrams could not be sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_pin_setup_aborts() {
        let err = run_pin_setup("exit 3").await.unwrap_err();
        assert!(matches!(err, DaqError::PinSetup(_)), "{err}");
        assert!(run_pin_setup("true").await.is_ok());
    }

    #[test]
    fn test_prepare_rejects_invalid_config() {
        let mut config = DaqConfig::default();
        config.session.frame_pairs = 0;
        assert!(matches!(
            Session::prepare(config),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_prepare_initialises_region() {
        let session = Session::prepare(DaqConfig::default()).unwrap();
        let header = session
            .region()
            .word(crate::data::layout::COUNTER_SLOTS)
            .load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(header, crate::data::layout::COUNTER_HEADER);
    }

    #[tokio::test]
    async fn test_pin_setup_failure_stops_run_before_sampling() {
        let mut config = DaqConfig::default();
        config.hardware.pin_setup_command = Some("false".to_string());
        let session = Session::prepare(config).unwrap();
        let err = session.run().await.unwrap_err();
        assert!(matches!(err, DaqError::PinSetup(_)));
        assert!(!ShutdownFlag::new(Arc::clone(session.region())).is_set());
    }

    #[test]
    fn test_failed_thread_start_ends_session() {
        let region = SharedRegion::anonymous().unwrap();
        let shutdown = ShutdownFlag::new(Arc::clone(&region));
        let stop = AtomicBool::new(false);

        // No address space can hold this stack.
        let builder = Builder::new().name("oversized".into()).stack_size(1 << 62);
        let err = spawn_loop(builder, &stop, &shutdown, || ()).unwrap_err();

        assert!(matches!(err, DaqError::Io(_)), "{err}");
        assert!(stop.load(Ordering::Acquire));
        assert!(shutdown.is_set());
    }

    #[test]
    fn test_started_loop_leaves_session_running() {
        let region = SharedRegion::anonymous().unwrap();
        let shutdown = ShutdownFlag::new(Arc::clone(&region));
        let stop = AtomicBool::new(false);

        let handle = spawn_loop(Builder::new(), &stop, &shutdown, || 7).unwrap();
        assert_eq!(handle.join().unwrap(), 7);
        assert!(!stop.load(Ordering::Acquire));
        assert!(!shutdown.is_set());
    }
}
