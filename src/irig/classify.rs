//! Pulse-width classification of IRIG-B symbols.
//!
//! IRIG-B sends 100 pulses per second, each starting on a 10 ms boundary. The pulse width
//! carries the symbol: 2 ms for a binary 0, 5 ms for a binary 1 and 8 ms for a marker
//! (position identifier or frame reference). The decision points sit between the nominal
//! widths and are expressed in seconds so the thresholds follow the tick rate:
//!
//! | width                     | symbol       | at 200 MHz              |
//! |---------------------------|--------------|-------------------------|
//! | `< 3.5 ms`                | ZERO         | `< 700_000`             |
//! | `3.5 ms ..< 6.5 ms`       | ONE          | `700_000 ..< 1_300_000` |
//! | `6.5 ms ..= 12.288 ms`    | SYNC-PULSE   | `..= 2_457_600`         |
//! | `> 12.288 ms`             | INVALID      |                         |

/// Decoded meaning of one pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    /// Binary zero.
    Zero,
    /// Binary one.
    One,
    /// Position identifier or frame reference marker.
    SyncPulse,
    /// Too long to be any IRIG-B symbol.
    Invalid,
}

/// Width thresholds in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseThresholds {
    /// Widths below this are ZERO.
    pub zero_below: u64,
    /// Widths below this (and not ZERO) are ONE.
    pub one_below: u64,
    /// Widths up to and including this (and not ONE) are SYNC-PULSE.
    pub sync_max: u64,
}

impl PulseThresholds {
    /// Thresholds for a counter running at `ticks_per_second`.
    ///
    /// Products are formed in 128 bits. Every band edge is a fraction of a second, so the
    /// results fit in `u64` for any rate.
    pub const fn for_tick_rate(ticks_per_second: u64) -> Self {
        const fn fraction(ticks_per_second: u64, num: u128, den: u128) -> u64 {
            (ticks_per_second as u128 * num / den) as u64
        }
        Self {
            zero_below: fraction(ticks_per_second, 35, 10_000),
            one_below: fraction(ticks_per_second, 65, 10_000),
            sync_max: fraction(ticks_per_second, 12_288, 1_000_000),
        }
    }

    /// Symbol for a pulse of `width` ticks.
    #[inline]
    pub const fn classify(&self, width: u64) -> Symbol {
        if width < self.zero_below {
            Symbol::Zero
        } else if width < self.one_below {
            Symbol::One
        } else if width <= self.sync_max {
            Symbol::SyncPulse
        } else {
            Symbol::Invalid
        }
    }
}

impl Default for PulseThresholds {
    fn default() -> Self {
        Self::for_tick_rate(crate::config::DEFAULT_TICKS_PER_SECOND)
    }
}
