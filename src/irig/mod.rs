//! IRIG-B timecode handling.
//!
//! - [`classify`]: pulse width to symbol
//! - [`decoder`]: the framing state machine that publishes frames
//! - [`timecode`]: BCD time-of-year fields of a decoded frame

pub mod classify;
pub mod decoder;
pub mod timecode;

pub use classify::{PulseThresholds, Symbol};
pub use decoder::{DecoderStats, IrigDecoder, SyncState, DEFAULT_FRAME_PAIRS};
pub use timecode::Timecode;
