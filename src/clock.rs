//! Reconstruction of 64-bit logical time from the 32-bit tick counter.
//!
//! The tick counter wraps at 2^32. Overflows are counted in software by the IRIG decoder
//! (the [`WraparoundCounter`]), and a hardware status bit stays set from the moment the
//! counter wraps until the decoder acknowledges it. A reader that samples the counter just
//! after a wrap, before the decoder has caught up, must decide whether the pending overflow
//! belongs to its sample:
//!
//! ```text
//! credit = tick < 0x5FFF_FFFF && overflow_pending
//! ```
//!
//! A small tick with the status bit set means the wrap happened just before the sample. A
//! large tick with the bit set means the sample was taken before the wrap and the bit was
//! raised afterwards. Every producer applies the same rule so that timestamps from the
//! sampler and the decoder stay comparable across a wrap.

use crate::data::WraparoundCounter;
use crate::hardware::TickCounter;

/// Tick values at or above this are never credited with a pending overflow (~75% of range).
pub const OVERFLOW_CREDIT_LIMIT: u32 = 0x5FFF_FFFF;

/// Combine a raw tick and an overflow count into a logical clock value.
#[inline]
pub const fn reconstruct(hw_tick: u32, overflow_count: u32) -> u64 {
    hw_tick as u64 + ((overflow_count as u64) << 32)
}

/// Overflow count to record for a sample taken at `hw_tick`.
#[inline]
pub const fn overflow_at_capture(hw_tick: u32, overflow_count: u32, overflow_pending: bool) -> u32 {
    if hw_tick < OVERFLOW_CREDIT_LIMIT && overflow_pending {
        overflow_count.wrapping_add(1)
    } else {
        overflow_count
    }
}

/// A captured instant: the raw tick and the overflow count credited to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    /// Low 32 bits as read from the counter.
    pub tick: u32,
    /// Overflows credited to this sample.
    pub overflows: u32,
}

impl Timestamp {
    /// Build a timestamp from its stored words.
    pub const fn new(tick: u32, overflows: u32) -> Self {
        Self { tick, overflows }
    }

    /// The 64-bit logical clock value.
    #[inline]
    pub const fn logical(self) -> u64 {
        reconstruct(self.tick, self.overflows)
    }
}

/// Read the counter and credit overflows according to the shared policy.
///
/// The tick is read first, then the software count, then the status bit. The three reads
/// are repeated if the decoder acknowledged an overflow while they were in flight, since a
/// mixed read would credit the same wrap twice or not at all.
#[inline]
pub fn capture<T: TickCounter + ?Sized>(timer: &T, wraps: &WraparoundCounter) -> Timestamp {
    wraps.read_consistent(|_| {
        let tick = timer.ticks();
        let counted = wraps.load();
        let pending = timer.overflow_pending();
        Timestamp::new(tick, overflow_at_capture(tick, counted, pending))
    })
}
