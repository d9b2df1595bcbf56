//! Simulated Hardware
//!
//! Provides a virtual tick counter and synthetic input waveforms so the whole pipeline can
//! run without the acquisition board.
//!
//! # Available Mocks
//!
//! - [`SimClock`] - shared virtual time, either stepped by a driving port or following the
//!   host's monotonic clock
//! - [`SimTimer`] - [`TickCounter`] over a `SimClock`, including the overflow status bit
//! - [`SimPort`] - [`SignalPort`] that evaluates a [`Waveform`] at the current time
//! - [`EdgeList`], [`QuadratureEncoder`], [`IrigSignal`] - waveforms
//!
//! # Stepped vs. real time
//!
//! In stepped mode exactly one port is the *driver*: every `sample()` on it advances the
//! clock by a fixed number of ticks before reading. Other ports only observe. Pulse widths
//! seen by the driving component are then exact to one step, which makes decoder tests
//! deterministic. In real-time mode the clock follows `Instant`, so every component sees
//! the same time no matter how the threads are scheduled.

use crate::hardware::capabilities::{SignalPort, TickCounter};
use crate::irig::classify::Symbol;
use crate::irig::timecode::Timecode;
use crate::sampler::EncoderMasks;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// =============================================================================
// SimClock - Virtual Time
// =============================================================================

/// How a [`SimClock`] advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Advances only when a driving port samples.
    Stepped {
        /// Ticks added per driving sample.
        ticks_per_sample: u64,
    },
    /// Follows the host's monotonic clock.
    Realtime {
        /// Virtual counter rate.
        ticks_per_second: u64,
    },
}

/// Shared 64-bit virtual time; the simulated counter exposes its low 32 bits.
#[derive(Debug)]
pub struct SimClock {
    mode: ClockMode,
    start: u64,
    now: AtomicU64,
    epoch: Instant,
    acked_wraps: AtomicU64,
}

impl SimClock {
    /// A stepped clock starting at `start_tick`.
    pub fn stepped(start_tick: u64, ticks_per_sample: u64) -> Arc<Self> {
        Self::with_mode(ClockMode::Stepped { ticks_per_sample }, start_tick)
    }

    /// A real-time clock starting at `start_tick`.
    pub fn realtime(start_tick: u64, ticks_per_second: u64) -> Arc<Self> {
        Self::with_mode(ClockMode::Realtime { ticks_per_second }, start_tick)
    }

    /// A clock in the given mode.
    pub fn with_mode(mode: ClockMode, start_tick: u64) -> Arc<Self> {
        Arc::new(Self {
            mode,
            start: start_tick,
            now: AtomicU64::new(start_tick),
            epoch: Instant::now(),
            acked_wraps: AtomicU64::new(start_tick >> 32),
        })
    }

    /// Current virtual time.
    #[inline]
    pub fn now(&self) -> u64 {
        match self.mode {
            ClockMode::Stepped { .. } => self.now.load(Ordering::Acquire),
            ClockMode::Realtime { ticks_per_second } => {
                let nanos = self.epoch.elapsed().as_nanos();
                self.start + (nanos * u128::from(ticks_per_second) / 1_000_000_000) as u64
            }
        }
    }

    /// Advance by one driving step. No effect in real-time mode.
    #[inline]
    pub fn step(&self) {
        if let ClockMode::Stepped { ticks_per_sample } = self.mode {
            self.now.fetch_add(ticks_per_sample, Ordering::AcqRel);
        }
    }

    /// Move a stepped clock forward to `tick`. No effect in real-time mode.
    pub fn advance_to(&self, tick: u64) {
        if let ClockMode::Stepped { .. } = self.mode {
            self.now.fetch_max(tick, Ordering::AcqRel);
        }
    }

    /// Advancement mode.
    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    fn overflow_pending(&self) -> bool {
        (self.now() >> 32) > self.acked_wraps.load(Ordering::Acquire)
    }

    fn clear_overflow(&self) {
        self.acked_wraps.store(self.now() >> 32, Ordering::Release);
    }
}

// =============================================================================
// SimTimer - Tick Counter
// =============================================================================

/// Simulated 32-bit tick counter with a sticky overflow bit.
///
/// The bit is set whenever the virtual time has crossed a 2^32 boundary that has not been
/// acknowledged. Several wraps without an acknowledgement still read as one pending bit,
/// like the real status register.
#[derive(Debug, Clone)]
pub struct SimTimer {
    clock: Arc<SimClock>,
}

impl SimTimer {
    /// Counter view of `clock`.
    pub fn new(clock: Arc<SimClock>) -> Self {
        Self { clock }
    }
}

impl TickCounter for SimTimer {
    fn ticks(&self) -> u32 {
        self.clock.now() as u32
    }

    fn overflow_pending(&self) -> bool {
        self.clock.overflow_pending()
    }

    fn clear_overflow(&self) {
        self.clock.clear_overflow();
    }
}

// =============================================================================
// Waveforms
// =============================================================================

/// An input register value as a function of virtual time.
pub trait Waveform: Send {
    /// Register bits at `tick`.
    fn level_at(&self, tick: u64) -> u32;
}

/// Explicit register values that take effect at given ticks.
#[derive(Debug, Clone, Default)]
pub struct EdgeList {
    initial: u32,
    changes: Vec<(u64, u32)>,
}

impl EdgeList {
    /// Register value before the first change.
    pub fn new(initial: u32) -> Self {
        Self {
            initial,
            changes: Vec::new(),
        }
    }

    /// Set the whole register to `value` from `tick` on. Ticks must be increasing.
    pub fn push(&mut self, tick: u64, value: u32) -> &mut Self {
        debug_assert!(self.changes.last().map_or(true, |&(t, _)| t < tick));
        self.changes.push((tick, value));
        self
    }

    /// Add a pulse on `mask`: high at `rising`, low at `rising + width`.
    pub fn pulse(&mut self, mask: u32, rising: u64, width: u64) -> &mut Self {
        let base = self.last_value() & !mask;
        self.push(rising, base | mask);
        self.push(rising + width, base)
    }

    /// Tick of the last change, or zero.
    pub fn end(&self) -> u64 {
        self.changes.last().map_or(0, |&(t, _)| t)
    }

    fn last_value(&self) -> u32 {
        self.changes.last().map_or(self.initial, |&(_, v)| v)
    }
}

impl Waveform for EdgeList {
    fn level_at(&self, tick: u64) -> u32 {
        let idx = self.changes.partition_point(|&(t, _)| t <= tick);
        if idx == 0 {
            self.initial
        } else {
            self.changes[idx - 1].1
        }
    }
}

/// Rotation direction of a simulated encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Phase A leads the edge line.
    #[default]
    Forward,
    /// Phase A lags the edge line.
    Reverse,
}

/// Square-wave encoder.
///
/// - edge line: toggles every `half_period` ticks from `start`
/// - phase a: the quadrature channel, a quarter period ahead (forward) or behind (reverse)
/// - phase b: direction level, high when turning forward
/// - phase c: index, high for the first half period of each revolution
#[derive(Debug, Clone)]
pub struct QuadratureEncoder {
    masks: EncoderMasks,
    start: u64,
    half_period: u64,
    direction: Direction,
    edges_per_revolution: u64,
    extra: u32,
}

impl QuadratureEncoder {
    /// Encoder whose first edge occurs at `start + half_period`.
    pub fn new(masks: EncoderMasks, start: u64, half_period: u64) -> Self {
        Self {
            masks,
            start,
            half_period: half_period.max(2),
            direction: Direction::Forward,
            edges_per_revolution: 1140,
            extra: 0,
        }
    }

    /// Set the rotation direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Set the edge count of one revolution.
    pub fn with_edges_per_revolution(mut self, edges: u64) -> Self {
        self.edges_per_revolution = edges.max(1);
        self
    }

    /// Merge another waveform's bits (for example an IRIG line on the same register).
    pub fn with_static_bits(mut self, bits: u32) -> Self {
        self.extra = bits;
        self
    }
}

impl Waveform for QuadratureEncoder {
    fn level_at(&self, tick: u64) -> u32 {
        if tick < self.start {
            return self.extra;
        }
        let t = tick - self.start;
        let half = self.half_period;
        let quarter = half / 2;
        let mut bits = self.extra;

        let half_periods = t / half;
        if half_periods % 2 == 1 {
            bits |= self.masks.edge;
        }

        let shifted = match self.direction {
            Direction::Forward => t + quarter,
            Direction::Reverse => t + 3 * quarter,
        };
        if (shifted / half) % 2 == 1 {
            bits |= self.masks.phases[0];
        }
        if self.direction == Direction::Forward {
            bits |= self.masks.phases[1];
        }
        if half_periods % self.edges_per_revolution == 0 {
            bits |= self.masks.phases[2];
        }
        bits
    }
}

/// IRIG-B (100 pps, unmodulated) generator.
///
/// Frame `k` starts at `origin + k * ticks_per_second` and carries `start + k` seconds.
#[derive(Debug, Clone)]
pub struct IrigSignal {
    mask: u32,
    origin: u64,
    ticks_per_second: u64,
    start: Timecode,
}

impl IrigSignal {
    /// Generator on `mask` whose first frame reference rises at `origin`.
    pub fn new(mask: u32, origin: u64, ticks_per_second: u64, start: Timecode) -> Self {
        Self {
            mask,
            origin,
            ticks_per_second,
            start,
        }
    }

    /// Nominal width of `symbol` in ticks.
    pub fn width_of(&self, symbol: Symbol) -> u64 {
        let ms = match symbol {
            Symbol::Zero => 2,
            Symbol::One => 5,
            Symbol::SyncPulse => 8,
            Symbol::Invalid => 10,
        };
        self.ticks_per_second * ms / 1000
    }

    /// Rising edge tick of position `position` in frame `frame`.
    pub fn position_start(&self, frame: u64, position: u64) -> u64 {
        self.origin + frame * self.ticks_per_second + position * (self.ticks_per_second / 100)
    }
}

impl Waveform for IrigSignal {
    fn level_at(&self, tick: u64) -> u32 {
        if tick < self.origin {
            return 0;
        }
        let elapsed = tick - self.origin;
        let frame = elapsed / self.ticks_per_second;
        let within = elapsed % self.ticks_per_second;
        let slot = self.ticks_per_second / 100;
        let position = (within / slot) as usize;
        let offset = within % slot;
        let symbol = self.start.advanced_by(frame).symbol_at(position.min(99));
        if offset < self.width_of(symbol) {
            self.mask
        } else {
            0
        }
    }
}

/// Two waveforms on disjoint bits of the same register.
pub struct Combined<A, B>(pub A, pub B);

impl<A: Waveform, B: Waveform> Waveform for Combined<A, B> {
    fn level_at(&self, tick: u64) -> u32 {
        self.0.level_at(tick) | self.1.level_at(tick)
    }
}

// =============================================================================
// SimPort - Signal Port
// =============================================================================

/// Simulated input register driven by a [`Waveform`].
pub struct SimPort {
    clock: Arc<SimClock>,
    waveform: Box<dyn Waveform>,
    driving: bool,
    samples: u64,
    signals: Arc<Mutex<Vec<u32>>>,
}

impl SimPort {
    /// Port that advances a stepped clock on every sample.
    pub fn driving(clock: Arc<SimClock>, waveform: impl Waveform + 'static) -> Self {
        Self::build(clock, Box::new(waveform), true)
    }

    /// Port that only observes the clock.
    pub fn following(clock: Arc<SimClock>, waveform: impl Waveform + 'static) -> Self {
        Self::build(clock, Box::new(waveform), false)
    }

    fn build(clock: Arc<SimClock>, waveform: Box<dyn Waveform>, driving: bool) -> Self {
        Self {
            clock,
            waveform,
            driving,
            samples: 0,
            signals: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared log of every value passed to `signal`.
    pub fn signal_log(&self) -> Arc<Mutex<Vec<u32>>> {
        Arc::clone(&self.signals)
    }

    /// Number of samples taken.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

impl std::fmt::Debug for SimPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimPort")
            .field("driving", &self.driving)
            .field("samples", &self.samples)
            .finish()
    }
}

impl SignalPort for SimPort {
    #[inline]
    fn sample(&mut self) -> u32 {
        if self.driving {
            self.clock.step();
        }
        self.samples += 1;
        self.waveform.level_at(self.clock.now())
    }

    fn signal(&mut self, value: u32) {
        self.signals.lock().push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASKS: EncoderMasks = EncoderMasks {
        edge: 1 << 10,
        phases: [1 << 8, 1 << 9, 1 << 11],
    };

    #[test]
    fn test_stepped_clock_only_moves_with_driver() {
        let clock = SimClock::stepped(100, 10);
        let mut driver = SimPort::driving(Arc::clone(&clock), EdgeList::new(0));
        let mut follower = SimPort::following(Arc::clone(&clock), EdgeList::new(0));

        follower.sample();
        assert_eq!(clock.now(), 100);
        driver.sample();
        driver.sample();
        assert_eq!(clock.now(), 120);
        assert_eq!(follower.samples(), 1);
    }

    #[test]
    fn test_timer_overflow_bit_is_sticky_until_cleared() {
        let clock = SimClock::stepped(0xFFFF_FFF0, 0x20);
        let timer = SimTimer::new(Arc::clone(&clock));
        assert!(!timer.overflow_pending());

        clock.step();
        assert_eq!(timer.ticks(), 0x10);
        assert!(timer.overflow_pending());
        clock.step();
        assert!(timer.overflow_pending());

        timer.clear_overflow();
        assert!(!timer.overflow_pending());
    }

    #[test]
    fn test_edge_list_pulses() {
        let mut edges = EdgeList::new(0);
        edges.pulse(1 << 14, 1_000, 400).pulse(1 << 14, 3_000, 50);
        assert_eq!(edges.level_at(999), 0);
        assert_eq!(edges.level_at(1_000), 1 << 14);
        assert_eq!(edges.level_at(1_399), 1 << 14);
        assert_eq!(edges.level_at(1_400), 0);
        assert_eq!(edges.level_at(3_010), 1 << 14);
        assert_eq!(edges.end(), 3_050);
    }

    #[test]
    fn test_encoder_forward_phase_high_on_rising_edge() {
        let enc = QuadratureEncoder::new(MASKS, 0, 100);
        // first rising edge at 100
        let at_rise = enc.level_at(100);
        assert_ne!(at_rise & MASKS.edge, 0);
        assert_ne!(at_rise & MASKS.phases[0], 0);
        assert_ne!(at_rise & MASKS.phases[1], 0);
        assert_eq!(enc.level_at(99) & MASKS.edge, 0);
        assert_eq!(enc.level_at(200) & MASKS.edge, 0);
    }

    #[test]
    fn test_encoder_reverse_phase_low_on_rising_edge() {
        let enc = QuadratureEncoder::new(MASKS, 0, 100).with_direction(Direction::Reverse);
        let at_rise = enc.level_at(100);
        assert_ne!(at_rise & MASKS.edge, 0);
        assert_eq!(at_rise & MASKS.phases[0], 0);
        assert_eq!(at_rise & MASKS.phases[1], 0);
    }

    #[test]
    fn test_irig_signal_widths() {
        let tps = 200_000_000;
        let start = Timecode::new(1, 0, 0, 1).unwrap();
        let irig = IrigSignal::new(1 << 14, 1_000, tps, start);

        assert_eq!(irig.level_at(999), 0);
        // Frame reference marker: 8 ms
        assert_eq!(irig.level_at(1_000), 1 << 14);
        assert_eq!(irig.level_at(1_000 + 1_599_999), 1 << 14);
        assert_eq!(irig.level_at(1_000 + 1_600_000), 0);
        // Position 1 carries seconds units bit 0 = 1: 5 ms
        let p1 = irig.position_start(0, 1);
        assert_eq!(irig.level_at(p1 + 999_999), 1 << 14);
        assert_eq!(irig.level_at(p1 + 1_000_000), 0);
        // Position 2 is a zero: 2 ms
        let p2 = irig.position_start(0, 2);
        assert_eq!(irig.level_at(p2 + 399_999), 1 << 14);
        assert_eq!(irig.level_at(p2 + 400_000), 0);
    }

    #[test]
    fn test_signal_log() {
        let clock = SimClock::stepped(0, 1);
        let mut port = SimPort::following(clock, EdgeList::new(0));
        let log = port.signal_log();
        port.signal(40);
        assert_eq!(*log.lock(), vec![40]);
    }
}
