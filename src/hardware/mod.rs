//! Hardware access for the sampling loops.
//!
//! - [`capabilities`]: the `SignalPort` / `TickCounter` traits the loops are generic over
//! - [`mmio`]: memory-mapped GPIO and IEP timer
//! - [`mock`]: virtual clock and synthetic waveforms for tests and simulation

pub mod capabilities;
pub mod mmio;
pub mod mock;

pub use capabilities::{SignalPort, TickCounter, COMPLETION_SIGNAL};
