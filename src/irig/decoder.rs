//! IRIG-B frame decoder.
//!
//! Samples one input line, measures every pulse from its rising to its falling edge and
//! runs the framing state machine on the classified symbol:
//!
//! ```text
//!                 SYNC, SYNC
//!   Unsynchronized ─────────▶ Synchronized { position: 1 }
//!         ▲                        │
//!         │  position % 10 == 9    │ position == 100: publish, flip,
//!         └──── and not SYNC ──────┘ seed next frame, position = 1
//! ```
//!
//! Frame fields are only written while synchronized. The decoder is also the single writer
//! of the wraparound counter: every iteration starts by acknowledging a pending counter
//! overflow. It stops after a fixed number of completed frames, or earlier when asked to,
//! and then raises the shared shutdown flag that also stops the sampler.

use crate::clock::{capture, Timestamp};
use crate::data::layout::{self, irig, IRIG_CHANNEL, IRIG_DECADES};
use crate::data::packets::ErrorCode;
use crate::data::{Publisher, SharedRegion, ShutdownFlag, WraparoundCounter};
use crate::hardware::{SignalPort, TickCounter, COMPLETION_SIGNAL};
use crate::irig::classify::{PulseThresholds, Symbol};
use crate::sampler::Progress;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Frame pairs in a default session.
pub const DEFAULT_FRAME_PAIRS: u64 = 305;

/// Positions in one frame.
const FRAME_POSITIONS: u32 = 100;

/// Framing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Looking for two markers in a row.
    Unsynchronized,
    /// Locked; `position` is the index of the next expected pulse.
    Synchronized {
        /// 1..=100.
        position: u32,
    },
}

/// Counters reported when the decoder stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Pulses measured.
    pub pulses: u64,
    /// Pulses too long to be any symbol.
    pub invalid_pulses: u64,
    /// Times synchronisation was acquired.
    pub syncs_acquired: u64,
    /// Times synchronisation was lost.
    pub desyncs: u64,
    /// Complete frames published.
    pub frames_published: u64,
    /// Frames reclaimed before the relay took them.
    pub overruns: u64,
    /// Counter overflows acknowledged.
    pub wraps_counted: u64,
}

/// IRIG-B decoding loop.
pub struct IrigDecoder<P, T> {
    port: P,
    timer: T,
    line_mask: u32,
    thresholds: PulseThresholds,
    wraps: WraparoundCounter,
    shutdown: ShutdownFlag,
    frames: Publisher,
    errors: Publisher,
    frame_limit: u64,
    stop: Option<Arc<AtomicBool>>,

    previous_level: u32,
    rising: Timestamp,
    previous_symbol: Symbol,
    state: SyncState,
    info: [u32; IRIG_DECADES],
    active: usize,
    finished: bool,
    stats: DecoderStats,
}

impl<P: SignalPort, T: TickCounter> IrigDecoder<P, T> {
    /// Decoder for the line `line_mask`, publishing into `region`.
    ///
    /// Runs for [`DEFAULT_FRAME_PAIRS`] frame pairs unless changed with
    /// [`with_frame_limit`](Self::with_frame_limit).
    pub fn new(
        port: P,
        timer: T,
        line_mask: u32,
        thresholds: PulseThresholds,
        region: Arc<SharedRegion>,
    ) -> Self {
        Self {
            port,
            timer,
            line_mask,
            thresholds,
            wraps: WraparoundCounter::new(Arc::clone(&region)),
            shutdown: ShutdownFlag::new(Arc::clone(&region)),
            frames: Publisher::new(Arc::clone(&region), IRIG_CHANNEL),
            errors: Publisher::new(region, layout::ERROR_CHANNEL),
            frame_limit: DEFAULT_FRAME_PAIRS * 2,
            stop: None,
            previous_level: 0,
            rising: Timestamp::default(),
            previous_symbol: Symbol::Invalid,
            state: SyncState::Unsynchronized,
            info: [0; IRIG_DECADES],
            active: 0,
            finished: false,
            stats: DecoderStats::default(),
        }
    }

    /// Stop after `frames` complete frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = frames;
        self
    }

    /// Also stop, after the current iteration, once `stop` becomes true.
    pub fn with_stop_request(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// One loop iteration.
    #[inline]
    pub fn poll(&mut self) -> Progress {
        if self.finished {
            return Progress::Finished;
        }
        if self.stats.frames_published >= self.frame_limit || self.stop_requested() {
            self.finish();
            return Progress::Finished;
        }

        if self.timer.overflow_pending() {
            let timer = &self.timer;
            self.wraps.acknowledge(|| timer.clear_overflow());
            self.stats.wraps_counted += 1;
        }

        let level = self.port.sample() & self.line_mask;
        if level == self.previous_level {
            return Progress::Running;
        }
        self.previous_level = level;

        let now = capture(&self.timer, &self.wraps);
        if level != 0 {
            self.rising = now;
        } else {
            let width = now.logical().saturating_sub(self.rising.logical());
            let symbol = self.thresholds.classify(width);
            self.on_symbol(symbol);
        }
        Progress::Running
    }

    /// Poll until the frame limit or a stop request, then return the counters.
    pub fn run(mut self) -> DecoderStats {
        while self.poll() == Progress::Running {}
        self.stats()
    }

    #[inline]
    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|stop| stop.load(Ordering::Relaxed))
    }

    fn on_symbol(&mut self, symbol: Symbol) {
        self.stats.pulses += 1;
        if symbol == Symbol::Invalid {
            self.stats.invalid_pulses += 1;
        }

        match self.state {
            SyncState::Unsynchronized => {
                if symbol == Symbol::SyncPulse && self.previous_symbol == Symbol::SyncPulse {
                    self.begin_frame();
                    self.state = SyncState::Synchronized { position: 1 };
                    self.stats.syncs_acquired += 1;
                    debug!(tick = self.rising.tick, "IRIG sync acquired");
                }
            }
            SyncState::Synchronized { position } => self.on_position(position, symbol),
        }
        self.previous_symbol = symbol;
    }

    fn on_position(&mut self, position: u32, symbol: Symbol) {
        if position == FRAME_POSITIONS {
            self.frames.publish(self.active);
            self.stats.frames_published += 1;
            self.active ^= 1;
            self.begin_frame();
            self.state = SyncState::Synchronized { position: 1 };
            return;
        }

        let decade = (position / 10) as usize;
        let bit = position % 10;
        if bit == 9 {
            if symbol != Symbol::SyncPulse {
                self.desync(position, symbol);
                return;
            }
            let slot = self.active;
            self.frames
                .write(slot, irig::SYNC_TIME + decade, self.rising.tick);
            self.frames
                .write(slot, irig::SYNC_OVERFLOW + decade, self.rising.overflows);
        } else {
            if symbol == Symbol::One {
                self.info[decade] |= 1 << bit;
            }
            self.frames
                .write(self.active, irig::INFO + decade, self.info[decade]);
        }
        self.state = SyncState::Synchronized {
            position: position + 1,
        };
    }

    /// Start filling the active slot with the frame whose reference marker just ended.
    fn begin_frame(&mut self) {
        self.info = [0; IRIG_DECADES];
        let slot = self.active;
        self.frames.write(slot, irig::RISING_EDGE, self.rising.tick);
        self.frames
            .write(slot, irig::INIT_OVERFLOW, self.rising.overflows);
    }

    fn desync(&mut self, position: u32, symbol: Symbol) {
        self.state = SyncState::Unsynchronized;
        self.stats.desyncs += 1;
        self.frames.retract();
        self.errors
            .write(0, layout::error::CODE, ErrorCode::Desync.raw());
        self.errors.publish(0);
        debug!(position, ?symbol, "IRIG sync lost");
    }

    fn finish(&mut self) {
        self.shutdown.set();
        self.port.signal(COMPLETION_SIGNAL);
        self.finished = true;
        debug!(frames = self.stats.frames_published, "IRIG decoder finished");
    }

    /// Current framing state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Next expected position while synchronized.
    pub fn position(&self) -> Option<u32> {
        match self.state {
            SyncState::Synchronized { position } => Some(position),
            SyncState::Unsynchronized => None,
        }
    }

    /// Slot the current frame is written to.
    pub fn active_slot(&self) -> usize {
        self.active
    }

    /// Counters so far.
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            overruns: self.frames.overruns(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::packets::{ErrorState, Packet};
    use crate::data::Consumer;
    use crate::hardware::mock::{EdgeList, IrigSignal, SimClock, SimPort, SimTimer};
    use crate::irig::timecode::Timecode;

    const LINE: u32 = 1 << 14;
    const TPS: u64 = 1_000_000;
    const STEP: u64 = 10;
    const SLOT: u64 = TPS / 100;

    fn region() -> Arc<SharedRegion> {
        let region = SharedRegion::anonymous().unwrap();
        region.initialise_session();
        region
    }

    fn width(symbol: Symbol) -> u64 {
        match symbol {
            Symbol::Zero => 2_000,
            Symbol::One => 5_000,
            Symbol::SyncPulse => 8_000,
            Symbol::Invalid => 20_000,
        }
    }

    /// One pulse per 10 ms slot starting at `first`; an over-long pulse pushes the rest back.
    fn train(first: u64, symbols: &[Symbol]) -> EdgeList {
        let mut list = EdgeList::new(0);
        let mut rise = first;
        for &s in symbols {
            list.pulse(LINE, rise, width(s));
            rise += SLOT.max(width(s) + 2_000);
        }
        list
    }

    fn decoder_for(
        waveform: impl crate::hardware::mock::Waveform + 'static,
        start: u64,
        region: &Arc<SharedRegion>,
    ) -> IrigDecoder<SimPort, SimTimer> {
        let clock = SimClock::stepped(start, STEP);
        let port = SimPort::driving(Arc::clone(&clock), waveform);
        IrigDecoder::new(
            port,
            SimTimer::new(clock),
            LINE,
            PulseThresholds::for_tick_rate(TPS),
            Arc::clone(region),
        )
    }

    fn run_until(decoder: &mut IrigDecoder<SimPort, SimTimer>, tick_span: u64) {
        for _ in 0..tick_span / STEP {
            decoder.poll();
        }
    }

    fn take_frame(region: &Arc<SharedRegion>) -> Option<crate::data::IrigFrame> {
        let mut consumer = Consumer::new(Arc::clone(region), IRIG_CHANNEL);
        let record = consumer.take()?;
        match Packet::from_words(&record.words).unwrap() {
            Packet::Irig(frame) => Some(frame),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_two_markers_acquire_sync() {
        use Symbol::*;
        let region = region();
        let mut decoder = decoder_for(train(1_000, &[Zero, SyncPulse, SyncPulse]), 0, &region);
        run_until(&mut decoder, 1_000 + 2 * SLOT + 9_000);

        assert_eq!(decoder.state(), SyncState::Synchronized { position: 1 });
        assert_eq!(decoder.stats().syncs_acquired, 1);
        // Frame start is the rising edge of the second marker.
        let word = IRIG_CHANNEL.word_offset(0, irig::RISING_EDGE);
        assert_eq!(
            region.word(word).load(Ordering::Relaxed),
            (1_000 + 2 * SLOT) as u32
        );
    }

    #[test]
    fn test_isolated_marker_does_not_sync() {
        use Symbol::*;
        let region = region();
        let pulses = train(1_000, &[SyncPulse, One, SyncPulse, Zero, Invalid, SyncPulse]);
        let end = pulses.end();
        let mut decoder = decoder_for(pulses, 0, &region);
        run_until(&mut decoder, end + STEP);
        assert_eq!(decoder.state(), SyncState::Unsynchronized);
        assert_eq!(decoder.stats().pulses, 6);
        assert_eq!(decoder.stats().invalid_pulses, 1);
    }

    #[test]
    fn test_marker_after_invalid_pulse_does_not_sync() {
        use Symbol::*;
        let region = region();
        let pulses = train(1_000, &[Invalid, SyncPulse]);
        let end = pulses.end();
        let mut decoder = decoder_for(pulses, 0, &region);
        run_until(&mut decoder, end + STEP);
        assert_eq!(decoder.stats().pulses, 2);
        assert_eq!(decoder.state(), SyncState::Unsynchronized);
    }

    #[test]
    fn test_missing_reference_marker_desyncs() {
        use Symbol::*;
        let region = region();
        let mut symbols = vec![SyncPulse, SyncPulse];
        symbols.extend([One; 8]); // positions 1..=8
        symbols.push(Zero); // position 9 should be a marker
        let mut decoder = decoder_for(train(1_000, &symbols), 0, &region);

        run_until(&mut decoder, 1_000 + 10 * SLOT);
        assert_eq!(decoder.position(), Some(9));
        run_until(&mut decoder, SLOT);

        assert_eq!(decoder.state(), SyncState::Unsynchronized);
        assert_eq!(decoder.stats().desyncs, 1);
        assert_eq!(
            region.word(layout::ERROR_READY).load(Ordering::Acquire),
            1
        );
        let mut errors = Consumer::new(Arc::clone(&region), layout::ERROR_CHANNEL);
        let record = errors.take().unwrap();
        assert_eq!(
            Packet::from_words(&record.words).unwrap(),
            Packet::Error(ErrorState {
                code: ErrorCode::Desync
            })
        );
        assert!(take_frame(&region).is_none());
    }

    #[test]
    fn test_desync_retracts_pending_frame() {
        let region = region();
        let start = Timecode::new(10, 1, 2, 3).unwrap();
        let signal = IrigSignal::new(LINE, 1_000, TPS, start);
        // Two good frames then garbage: the second frame is published, then position 9 of
        // the next frame is replaced with a data pulse.
        let mut list = EdgeList::new(0);
        for frame in 0..3u64 {
            let tc = start.advanced_by(frame);
            for position in 0..100u64 {
                let rise = signal.position_start(frame, position);
                let mut symbol = tc.symbol_at(position as usize);
                if frame == 2 && position == 9 {
                    symbol = Symbol::One;
                }
                list.pulse(LINE, rise, signal.width_of(symbol));
            }
        }
        let mut decoder = decoder_for(list, 0, &region);

        run_until(&mut decoder, signal.position_start(2, 0) + 9_000);
        assert_eq!(decoder.stats().frames_published, 1);
        assert_eq!(region.word(layout::IRIG_READY).load(Ordering::Acquire), 1);

        run_until(&mut decoder, 9 * SLOT);
        assert_eq!(decoder.stats().desyncs, 1);
        assert_eq!(region.word(layout::IRIG_READY).load(Ordering::Acquire), 0);
        assert!(take_frame(&region).is_none());
    }

    #[test]
    fn test_frame_completion_publishes_and_seeds_next_frame() {
        let region = region();
        let start = Timecode::new(200, 13, 37, 42).unwrap();
        let signal = IrigSignal::new(LINE, 1_000, TPS, start);
        let mut decoder = decoder_for(signal.clone(), 0, &region);

        // Sync on the reference marker of frame 1, complete it on the marker of frame 2.
        run_until(&mut decoder, signal.position_start(2, 0) + 9_000);
        assert_eq!(decoder.stats().frames_published, 1);
        assert_eq!(decoder.active_slot(), 1);
        assert_eq!(decoder.position(), Some(1));

        let frame = take_frame(&region).unwrap();
        assert_eq!(frame.info, start.advanced_by(1).encode());
        assert_eq!(
            frame.rising_edge.logical(),
            signal.position_start(1, 0)
        );
        for (d, pulse) in frame.sync_pulses.iter().enumerate() {
            assert_eq!(
                pulse.logical(),
                signal.position_start(1, 10 * d as u64 + 9)
            );
        }
        assert_eq!(Timecode::decode(&frame.info).unwrap(), start.advanced_by(1));

        // Next frame is pre-seeded in slot 1 from the edge that completed frame 1.
        let seeded = IRIG_CHANNEL.word_offset(1, irig::RISING_EDGE);
        assert_eq!(
            region.word(seeded).load(Ordering::Relaxed),
            signal.position_start(2, 0) as u32
        );
    }

    #[test]
    fn test_consecutive_frames_alternate_slots() {
        let region = region();
        let start = Timecode::new(1, 0, 0, 0).unwrap();
        let signal = IrigSignal::new(LINE, 1_000, TPS, start);
        let mut decoder = decoder_for(signal.clone(), 0, &region);
        let mut consumer = Consumer::new(Arc::clone(&region), IRIG_CHANNEL);

        run_until(&mut decoder, signal.position_start(2, 0) + 9_000);
        let mut slots = Vec::new();
        for frame in 1..=4 {
            let record = consumer.take().unwrap();
            slots.push(record.slot);
            let Packet::Irig(decoded) = Packet::from_words(&record.words).unwrap() else {
                panic!("expected IRIG frame");
            };
            assert_eq!(
                Timecode::decode(&decoded.info).unwrap(),
                start.advanced_by(frame)
            );
            run_until(&mut decoder, TPS);
        }
        assert_eq!(slots, vec![0, 1, 0, 1]);
        assert_eq!(decoder.stats().overruns, 0);
    }

    #[test]
    fn test_frame_limit_raises_shutdown_and_completion_signal() {
        let region = region();
        let signal = IrigSignal::new(LINE, 1_000, TPS, Timecode::new(1, 0, 0, 0).unwrap());
        let clock = SimClock::stepped(0, STEP);
        let port = SimPort::driving(Arc::clone(&clock), signal);
        let log = port.signal_log();
        let decoder = IrigDecoder::new(
            port,
            SimTimer::new(clock),
            LINE,
            PulseThresholds::for_tick_rate(TPS),
            Arc::clone(&region),
        )
        .with_frame_limit(2);

        let stats = decoder.run();
        assert_eq!(stats.frames_published, 2);
        assert!(ShutdownFlag::new(Arc::clone(&region)).is_set());
        assert_eq!(*log.lock(), vec![COMPLETION_SIGNAL]);
    }

    #[test]
    fn test_stop_request_finishes_early() {
        let region = region();
        let stop = Arc::new(AtomicBool::new(false));
        let mut decoder = decoder_for(EdgeList::new(0), 0, &region)
            .with_stop_request(Arc::clone(&stop));
        assert_eq!(decoder.poll(), Progress::Running);
        stop.store(true, Ordering::Relaxed);
        assert_eq!(decoder.poll(), Progress::Finished);
        assert!(ShutdownFlag::new(region).is_set());
    }

    #[test]
    fn test_counter_overflow_acknowledged_once_per_wrap() {
        let region = region();
        let start_tick = (1u64 << 32) - 25_000;
        let tc = Timecode::new(5, 6, 7, 8).unwrap();
        let signal = IrigSignal::new(LINE, start_tick + 1_000, TPS, tc);
        let mut decoder = decoder_for(signal.clone(), start_tick, &region);

        run_until(&mut decoder, 2 * TPS + 20_000);
        assert_eq!(decoder.stats().wraps_counted, 1);
        assert_eq!(WraparoundCounter::new(Arc::clone(&region)).load(), 1);
        assert_eq!(
            region.word(layout::WRAP_SEQUENCE).load(Ordering::Relaxed),
            2
        );

        let frame = take_frame(&region).unwrap();
        assert_eq!(frame.rising_edge.overflows, 1);
        assert_eq!(frame.rising_edge.logical(), signal.position_start(1, 0));
    }
}
