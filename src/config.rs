//! Configuration using Figment
//!
//! Strongly-typed configuration for the acquisition session, the relay and the receiver.
//! Configuration is loaded from:
//! 1. `config/encoder_daq.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `ENCODER_DAQ_`, nested keys separated by `__`
//!    (for example `ENCODER_DAQ_RELAY__DESTINATION=127.0.0.1:9000`)
//!
//! Every field has a default, so an empty file yields a runnable simulated session.
//!
//! # Example
//! ```no_run
//! use encoder_daq::config::DaqConfig;
//!
//! let config = DaqConfig::load()?;
//! config.validate().map_err(encoder_daq::error::DaqError::Configuration)?;
//! println!("Sending to {}", config.relay.destination);
//! # Ok::<(), encoder_daq::error::DaqError>(())
//! ```

use crate::error::AppResult;
use crate::hardware::mock::Direction;
use crate::irig::classify::PulseThresholds;
use crate::irig::timecode::Timecode;
use crate::irig::DEFAULT_FRAME_PAIRS;
use crate::sampler::EncoderMasks;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tick rate of the IEP counter.
pub const DEFAULT_TICKS_PER_SECOND: u64 = 200_000_000;

/// Highest accepted tick rate. A 64-bit logical clock at this rate lasts about 5.8 years.
pub const MAX_TICKS_PER_SECOND: u64 = 100_000_000_000;

/// Configuration file read by [`DaqConfig::load`].
pub const DEFAULT_CONFIG_PATH: &str = "config/encoder_daq.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "ENCODER_DAQ_";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Tick counter settings
    pub clock: ClockConfig,
    /// Input register bit assignments
    pub pins: PinConfig,
    /// Session length
    pub session: SessionConfig,
    /// Packet region placement
    pub region: RegionConfig,
    /// Host relay settings
    pub relay: RelayConfig,
    /// Monitoring receiver settings
    pub receiver: ReceiverConfig,
    /// Hardware backend selection
    pub hardware: HardwareConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Tick counter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Counter increments per second. IRIG pulse thresholds scale with it.
    #[serde(default = "default_ticks_per_second")]
    pub ticks_per_second: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: default_ticks_per_second(),
        }
    }
}

impl ClockConfig {
    /// IRIG pulse classification thresholds for this tick rate.
    pub fn thresholds(&self) -> PulseThresholds {
        PulseThresholds::for_tick_rate(self.ticks_per_second)
    }
}

/// Bit numbers within the 32-bit input register
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinConfig {
    /// Encoder edge line
    #[serde(default = "default_encoder_pin")]
    pub encoder: u8,
    /// Quadrature phase a
    #[serde(default = "default_phase_a_pin")]
    pub phase_a: u8,
    /// Quadrature phase b
    #[serde(default = "default_phase_b_pin")]
    pub phase_b: u8,
    /// Quadrature phase c
    #[serde(default = "default_phase_c_pin")]
    pub phase_c: u8,
    /// IRIG-B line
    #[serde(default = "default_irig_pin")]
    pub irig: u8,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            encoder: default_encoder_pin(),
            phase_a: default_phase_a_pin(),
            phase_b: default_phase_b_pin(),
            phase_c: default_phase_c_pin(),
            irig: default_irig_pin(),
        }
    }
}

impl PinConfig {
    fn all(&self) -> [(&'static str, u8); 5] {
        [
            ("encoder", self.encoder),
            ("phase_a", self.phase_a),
            ("phase_b", self.phase_b),
            ("phase_c", self.phase_c),
            ("irig", self.irig),
        ]
    }

    /// Sampler masks. Pins must already be validated.
    pub fn encoder_masks(&self) -> EncoderMasks {
        EncoderMasks {
            edge: bit(self.encoder),
            phases: [bit(self.phase_a), bit(self.phase_b), bit(self.phase_c)],
        }
    }

    /// Decoder line mask.
    pub fn irig_mask(&self) -> u32 {
        bit(self.irig)
    }
}

fn bit(pin: u8) -> u32 {
    1u32.checked_shl(u32::from(pin)).unwrap_or(0)
}

/// Session length
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Decoder iterations; each completes two IRIG frames.
    #[serde(default = "default_frame_pairs")]
    pub frame_pairs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_pairs: default_frame_pairs(),
        }
    }
}

impl SessionConfig {
    /// Frames the decoder completes before shutting the session down.
    pub fn frame_limit(&self) -> u64 {
        self.frame_pairs.saturating_mul(2)
    }
}

/// Packet region placement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionConfig {
    /// File to map (for example under `/dev/shm`); anonymous memory when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Host relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Monitoring host address
    #[serde(default = "default_destination")]
    pub destination: String,
    /// Local address of the sending socket
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Also send error records (counted and dropped otherwise)
    #[serde(default)]
    pub forward_errors: bool,
    /// Pause between polls that found nothing
    #[serde(default = "default_idle_poll", with = "humantime_serde")]
    pub idle_poll: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            bind: default_bind(),
            forward_errors: false,
            idle_poll: default_idle_poll(),
        }
    }
}

/// Monitoring receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Address to receive datagrams on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for the CSV files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Silence after which a waiting notice is logged
    #[serde(default = "default_idle_notice", with = "humantime_serde")]
    pub idle_notice: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            output_dir: default_output_dir(),
            idle_notice: default_idle_notice(),
        }
    }
}

/// Where the sampling loops read their inputs from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Synthetic encoder and IRIG waveforms on a virtual clock
    #[default]
    Simulated,
    /// Memory-mapped GPIO and IEP timer
    Mmio,
}

/// Hardware configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Input backend
    #[serde(default)]
    pub backend: Backend,
    /// Shell command run once before sampling starts; failure aborts the session
    #[serde(default)]
    pub pin_setup_command: Option<String>,
    /// Memory-mapped register locations
    #[serde(default)]
    pub mmio: MmioConfig,
    /// Simulated signal parameters
    #[serde(default)]
    pub simulated: SimulatedConfig,
}

/// Memory-mapped register locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmioConfig {
    /// Physical memory device
    #[serde(default = "default_device")]
    pub device: PathBuf,
    /// Physical base of the GPIO bank
    #[serde(default = "default_gpio_base")]
    pub gpio_base: u64,
    /// Input register offset within the bank
    #[serde(default = "default_datain_offset")]
    pub datain_offset: usize,
    /// Output register offset for the completion signal
    #[serde(default = "default_dataout_offset")]
    pub dataout_offset: Option<usize>,
    /// Physical base of the IEP timer
    #[serde(default = "default_iep_base")]
    pub iep_base: u64,
}

impl Default for MmioConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            gpio_base: default_gpio_base(),
            datain_offset: default_datain_offset(),
            dataout_offset: default_dataout_offset(),
            iep_base: default_iep_base(),
        }
    }
}

/// How the simulated clock advances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimClockMode {
    /// Follows the host clock
    #[default]
    Realtime,
    /// Advances by `ticks_per_sample` on every decoder sample
    Stepped,
}

/// Simulated signal parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedConfig {
    /// Clock advancement
    #[serde(default)]
    pub clock_mode: SimClockMode,
    /// Ticks per decoder sample in stepped mode
    #[serde(default = "default_ticks_per_sample")]
    pub ticks_per_sample: u64,
    /// Initial counter value
    #[serde(default)]
    pub start_tick: u64,
    /// Ticks between encoder edges
    #[serde(default = "default_encoder_half_period")]
    pub encoder_half_period_ticks: u64,
    /// Encoder rotation direction
    #[serde(default)]
    pub direction: Direction,
    /// Time carried by the first IRIG frame, `HH:MM:SS`
    #[serde(default = "default_irig_start")]
    pub irig_start: String,
    /// Day of year carried by the first IRIG frame
    #[serde(default = "default_irig_day")]
    pub irig_day: u16,
    /// Ticks after `start_tick` at which the first IRIG frame begins
    #[serde(default = "default_irig_origin")]
    pub irig_origin_ticks: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            clock_mode: SimClockMode::default(),
            ticks_per_sample: default_ticks_per_sample(),
            start_tick: 0,
            encoder_half_period_ticks: default_encoder_half_period(),
            direction: Direction::default(),
            irig_start: default_irig_start(),
            irig_day: default_irig_day(),
            irig_origin_ticks: default_irig_origin(),
        }
    }
}

impl SimulatedConfig {
    /// Timecode of the first simulated frame.
    pub fn start_timecode(&self) -> AppResult<Timecode> {
        Timecode::parse(self.irig_day, &self.irig_start)
    }
}

// Default value functions
fn default_name() -> String {
    "encoder-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_ticks_per_second() -> u64 {
    DEFAULT_TICKS_PER_SECOND
}

fn default_encoder_pin() -> u8 {
    10
}

fn default_phase_a_pin() -> u8 {
    8
}

fn default_phase_b_pin() -> u8 {
    9
}

fn default_phase_c_pin() -> u8 {
    11
}

fn default_irig_pin() -> u8 {
    14
}

fn default_frame_pairs() -> u64 {
    DEFAULT_FRAME_PAIRS
}

fn default_destination() -> String {
    "192.168.2.54:8080".to_string()
}

fn default_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_idle_poll() -> Duration {
    Duration::from_micros(100)
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_idle_notice() -> Duration {
    Duration::from_secs(2)
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/mem")
}

fn default_gpio_base() -> u64 {
    0x4804_C000
}

fn default_datain_offset() -> usize {
    0x138
}

fn default_dataout_offset() -> Option<usize> {
    Some(0x13C)
}

fn default_iep_base() -> u64 {
    0x4A32_E000
}

fn default_ticks_per_sample() -> u64 {
    2_000
}

fn default_encoder_half_period() -> u64 {
    100_000
}

fn default_irig_start() -> String {
    "12:00:00".to_string()
}

fn default_irig_day() -> u16 {
    1
}

fn default_irig_origin() -> u64 {
    1_000_000
}

impl DaqConfig {
    /// Load configuration from `config/encoder_daq.toml` and environment variables
    ///
    /// Environment variables override the file, e.g. `ENCODER_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        // Validate log settings
        if !VALID_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            ));
        }
        if !VALID_FORMATS.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                VALID_FORMATS.join(", ")
            ));
        }

        // Thresholds need at least 1 tick per 12.288 ms band edge
        if !(1_000..=MAX_TICKS_PER_SECOND).contains(&self.clock.ticks_per_second) {
            return Err(format!(
                "Invalid ticks_per_second {}. Must be between 1000 and {MAX_TICKS_PER_SECOND}",
                self.clock.ticks_per_second
            ));
        }

        // Pins are bits of a 32-bit register and must not overlap
        let mut seen = std::collections::HashMap::new();
        for (name, pin) in self.pins.all() {
            if pin > 31 {
                return Err(format!("Pin {name} = {pin} is outside the 32-bit register"));
            }
            if let Some(other) = seen.insert(pin, name) {
                return Err(format!("Pins {other} and {name} both use bit {pin}"));
            }
        }

        if self.session.frame_pairs == 0 {
            return Err("session.frame_pairs must be at least 1".to_string());
        }

        for (name, addr) in [
            ("relay.destination", &self.relay.destination),
            ("relay.bind", &self.relay.bind),
            ("receiver.listen", &self.receiver.listen),
        ] {
            addr.parse::<SocketAddr>()
                .map_err(|e| format!("Invalid {name} '{addr}': {e}"))?;
        }

        let sim = &self.hardware.simulated;
        if self.hardware.backend == Backend::Simulated {
            if sim.clock_mode == SimClockMode::Stepped && sim.ticks_per_sample == 0 {
                return Err("hardware.simulated.ticks_per_sample must be non-zero".to_string());
            }
            if sim.encoder_half_period_ticks < 2 {
                return Err(format!(
                    "hardware.simulated.encoder_half_period_ticks {} is too short",
                    sim.encoder_half_period_ticks
                ));
            }
            sim.start_timecode().map_err(|e| e.to_string())?;
        }

        Ok(())
    }

    /// Relay destination as a socket address.
    pub fn destination(&self) -> Result<SocketAddr, String> {
        self.relay
            .destination
            .parse()
            .map_err(|e| format!("Invalid relay.destination: {e}"))
    }
}
