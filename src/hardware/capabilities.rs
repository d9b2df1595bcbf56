//! Hardware Capabilities
//!
//! The sampling loops touch hardware through two small capability traits instead of raw
//! register addresses:
//!
//! - [`SignalPort`]: read the input register, raise an output value
//! - [`TickCounter`]: the free-running 32-bit tick counter and its overflow status bit
//!
//! Production code binds them to memory-mapped registers
//! ([`mmio`](super::mmio)); tests and the simulator bind them to a virtual clock and
//! synthetic waveforms ([`mock`](super::mock)).
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is synchronous. The loops busy-poll and never suspend.
//! - Is `Send`, so a component can be moved onto its own thread.
//! - Is infallible. A register read cannot fail once the mapping exists.
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust
//! use encoder_daq::hardware::{SignalPort, TickCounter};
//!
//! fn wait_for_edge<P: SignalPort, T: TickCounter>(port: &mut P, timer: &T, mask: u32) -> u32 {
//!     let start = port.sample() & mask;
//!     while port.sample() & mask == start {}
//!     timer.ticks()
//! }
//! ```

/// Output value raised by a producer when it stops sampling.
pub const COMPLETION_SIGNAL: u32 = 40;

/// A digital input register plus an output used for signalling.
pub trait SignalPort: Send {
    /// Read all input bits at once.
    fn sample(&mut self) -> u32;

    /// Raise an output value.
    fn signal(&mut self, value: u32);
}

/// The shared free-running tick counter.
///
/// Several components hold a handle to the same counter; only the IRIG decoder clears the
/// overflow bit.
pub trait TickCounter: Send {
    /// Current low 32 bits of the counter.
    fn ticks(&self) -> u32;

    /// Whether the counter wrapped since the bit was last cleared.
    fn overflow_pending(&self) -> bool;

    /// Acknowledge the pending overflow.
    fn clear_overflow(&self);
}

impl<P: SignalPort + ?Sized> SignalPort for Box<P> {
    fn sample(&mut self) -> u32 {
        (**self).sample()
    }

    fn signal(&mut self, value: u32) {
        (**self).signal(value)
    }
}

impl<T: TickCounter + ?Sized> TickCounter for Box<T> {
    fn ticks(&self) -> u32 {
        (**self).ticks()
    }

    fn overflow_pending(&self) -> bool {
        (**self).overflow_pending()
    }

    fn clear_overflow(&self) {
        (**self).clear_overflow()
    }
}
