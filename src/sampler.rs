//! Encoder edge sampler.
//!
//! Busy-polls the input register and timestamps every transition of the encoder line. The
//! first rising edge of each packet also latches the three quadrature pins. After
//! [`EDGES_PER_PACKET`] edges the packet is published and the other slot starts filling.
//!
//! The sampler reads the wraparound counter but never writes it, and it stops only when
//! the IRIG decoder raises the shutdown flag. A packet that is partly filled at that point
//! is not published.
//!
//! # Example
//! ```
//! use encoder_daq::data::{layout::COUNTER_CHANNEL, Consumer, SharedRegion};
//! use encoder_daq::hardware::mock::{EdgeList, SimClock, SimPort, SimTimer};
//! use encoder_daq::sampler::{EdgeSampler, EncoderMasks};
//! use std::sync::Arc;
//!
//! let region = SharedRegion::anonymous().unwrap();
//! region.initialise_session();
//! let clock = SimClock::stepped(0, 1);
//! let mut edges = EdgeList::new(0);
//! for n in 0..150u64 {
//!     edges.push(10 + n * 10, if n % 2 == 0 { 1 << 10 } else { 0 });
//! }
//! let port = SimPort::driving(Arc::clone(&clock), edges);
//! let mut sampler = EdgeSampler::new(
//!     port,
//!     SimTimer::new(clock),
//!     EncoderMasks::default(),
//!     Arc::clone(&region),
//! );
//! while sampler.stats().packets_published == 0 {
//!     sampler.poll();
//! }
//! let mut consumer = Consumer::new(region, COUNTER_CHANNEL);
//! assert!(consumer.take().is_some());
//! ```

use crate::clock::{capture, Timestamp};
use crate::data::layout::{counter, COUNTER_CHANNEL, EDGES_PER_PACKET};
use crate::data::{Publisher, SharedRegion, ShutdownFlag, WraparoundCounter};
use crate::hardware::{SignalPort, TickCounter, COMPLETION_SIGNAL};
use std::sync::Arc;

/// Bit masks of the encoder lines inside the input register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderMasks {
    /// Line whose transitions are timestamped.
    pub edge: u32,
    /// Quadrature phases a, b, c.
    pub phases: [u32; 3],
}

impl Default for EncoderMasks {
    fn default() -> Self {
        Self {
            edge: 1 << 10,
            phases: [1 << 8, 1 << 9, 1 << 11],
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Keep polling.
    Running,
    /// The loop has signalled completion.
    Finished,
}

/// Counters reported when the sampler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    /// Edges timestamped.
    pub edges: u64,
    /// Packets handed to the relay.
    pub packets_published: u64,
    /// Packets reclaimed before the relay took them.
    pub overruns: u64,
    /// Edges in the unpublished packet at shutdown.
    pub discarded_edges: u64,
}

/// Edge/quadrature sampling loop.
pub struct EdgeSampler<P, T> {
    port: P,
    timer: T,
    masks: EncoderMasks,
    wraps: WraparoundCounter,
    shutdown: ShutdownFlag,
    packets: Publisher,

    previous_edge: u32,
    edge_count: u32,
    active: usize,
    fill: usize,
    quadrature_captured: bool,
    finished: bool,
    stats: SamplerStats,
}

impl<P: SignalPort, T: TickCounter> EdgeSampler<P, T> {
    /// Sampler publishing into `region`'s counter channel.
    pub fn new(port: P, timer: T, masks: EncoderMasks, region: Arc<SharedRegion>) -> Self {
        Self {
            port,
            timer,
            masks,
            wraps: WraparoundCounter::new(Arc::clone(&region)),
            shutdown: ShutdownFlag::new(Arc::clone(&region)),
            packets: Publisher::new(region, COUNTER_CHANNEL),
            previous_edge: 0,
            edge_count: 0,
            active: 0,
            fill: 0,
            quadrature_captured: false,
            finished: false,
            stats: SamplerStats::default(),
        }
    }

    /// One loop iteration: check for shutdown, sample, record an edge if there was one.
    #[inline]
    pub fn poll(&mut self) -> Progress {
        if self.finished {
            return Progress::Finished;
        }
        if self.shutdown.is_set() {
            self.finish();
            return Progress::Finished;
        }

        let sample = self.port.sample();
        let edge = sample & self.masks.edge;
        if edge == self.previous_edge {
            return Progress::Running;
        }

        self.edge_count = self.edge_count.wrapping_add(1);
        if edge != 0 && !self.quadrature_captured {
            self.latch_quadrature(sample);
        }
        let stamp = capture(&self.timer, &self.wraps);
        self.record(stamp);
        self.previous_edge = edge;

        if self.fill == EDGES_PER_PACKET {
            self.flip();
        }
        Progress::Running
    }

    /// Poll until the shutdown flag is observed, then return the counters.
    pub fn run(mut self) -> SamplerStats {
        while self.poll() == Progress::Running {}
        self.stats
    }

    fn latch_quadrature(&mut self, sample: u32) {
        for (i, &mask) in self.masks.phases.iter().enumerate() {
            let bit = u32::from(sample & mask != 0);
            self.packets
                .write(self.active, counter::QUADRATURE + i, bit);
        }
        self.quadrature_captured = true;
    }

    #[inline]
    fn record(&mut self, stamp: Timestamp) {
        let slot = self.active;
        let i = self.fill;
        self.packets.write(slot, counter::CLOCK + i, stamp.tick);
        self.packets.write(slot, counter::OVERFLOW + i, stamp.overflows);
        self.packets
            .write(slot, counter::EDGE_INDEX + i, self.edge_count);
        self.fill += 1;
        self.stats.edges += 1;
    }

    fn flip(&mut self) {
        self.packets.publish(self.active);
        self.stats.packets_published += 1;
        self.active ^= 1;
        self.fill = 0;
        self.quadrature_captured = false;
    }

    fn finish(&mut self) {
        self.stats.discarded_edges = self.fill as u64;
        self.stats.overruns = self.packets.overruns();
        self.port.signal(COMPLETION_SIGNAL);
        self.finished = true;
    }

    /// Slot currently being filled.
    pub fn active_slot(&self) -> usize {
        self.active
    }

    /// Records in the active slot.
    pub fn fill(&self) -> usize {
        self.fill
    }

    /// Whether the active packet already holds its quadrature state.
    pub fn quadrature_captured(&self) -> bool {
        self.quadrature_captured
    }

    /// Counters so far.
    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            overruns: self.packets.overruns(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::layout::{self, COUNTER_CHANNEL};
    use crate::data::{Consumer, Packet};
    use crate::hardware::mock::{EdgeList, SimClock, SimPort, SimTimer};
    use std::sync::atomic::Ordering;

    const EDGE: u32 = 1 << 10;
    const QA: u32 = 1 << 8;
    const QC: u32 = 1 << 11;

    fn region() -> Arc<SharedRegion> {
        let region = SharedRegion::anonymous().unwrap();
        region.initialise_session();
        region
    }

    /// Square wave on the edge line: `n` edges, one every `period` ticks from `first`.
    fn square(first: u64, period: u64, n: u64, extra_on_rise: u32) -> EdgeList {
        let mut list = EdgeList::new(0);
        for k in 0..n {
            let value = if k % 2 == 0 { EDGE | extra_on_rise } else { 0 };
            list.push(first + k * period, value);
        }
        list
    }

    fn sampler_for(
        edges: EdgeList,
        start: u64,
        region: &Arc<SharedRegion>,
    ) -> EdgeSampler<SimPort, SimTimer> {
        let clock = SimClock::stepped(start, 1);
        let port = SimPort::driving(Arc::clone(&clock), edges);
        EdgeSampler::new(
            port,
            SimTimer::new(clock),
            EncoderMasks::default(),
            Arc::clone(region),
        )
    }

    fn poll_ticks<P: SignalPort, T: TickCounter>(s: &mut EdgeSampler<P, T>, n: u64) {
        for _ in 0..n {
            s.poll();
        }
    }

    #[test]
    fn test_packet_published_after_150_edges() {
        let region = region();
        let mut sampler = sampler_for(square(10, 10, 151, QA), 0, &region);

        // 149 edges: nothing published yet
        poll_ticks(&mut sampler, 10 + 148 * 10);
        assert_eq!(sampler.fill(), 149);
        assert_eq!(
            region.word(COUNTER_CHANNEL.ready).load(Ordering::Acquire),
            0
        );

        // 150th edge publishes slot 0 and flips
        poll_ticks(&mut sampler, 10);
        assert_eq!(
            region.word(COUNTER_CHANNEL.ready).load(Ordering::Acquire),
            1
        );
        assert_eq!(sampler.active_slot(), 1);
        assert_eq!(sampler.fill(), 0);
        assert!(!sampler.quadrature_captured());

        // 151st edge (a rising edge) goes into slot 1 and latches quadrature there
        poll_ticks(&mut sampler, 10);
        assert_eq!(sampler.fill(), 1);
        assert!(sampler.quadrature_captured());
    }

    #[test]
    fn test_packet_contents() {
        let region = region();
        let mut sampler = sampler_for(square(10, 10, 150, QA | QC), 0, &region);
        poll_ticks(&mut sampler, 10 + 149 * 10);

        let mut consumer = Consumer::new(Arc::clone(&region), COUNTER_CHANNEL);
        let record = consumer.take().unwrap();
        let Packet::Counter(packet) = Packet::from_words(&record.words).unwrap() else {
            panic!("expected counter packet");
        };
        assert_eq!(packet.edges.len(), 150);
        for (k, edge) in packet.edges.iter().enumerate() {
            assert_eq!(edge.edge_index, k as u32 + 1);
            assert_eq!(edge.clock.logical(), 10 + 10 * k as u64);
        }
        assert_eq!(packet.quadrature.phase_a, 1);
        assert_eq!(packet.quadrature.phase_b, 0);
        assert_eq!(packet.quadrature.phase_c, 1);
    }

    #[test]
    fn test_quadrature_latched_on_first_rising_edge_only() {
        let region = region();
        let mut list = EdgeList::new(0);
        list.push(5, EDGE); // rise with phase a low
        list.push(10, QA); // fall with phase a high
        list.push(15, EDGE | QA); // rise with phase a high
        let mut sampler = sampler_for(list, 0, &region);
        poll_ticks(&mut sampler, 5);
        assert!(sampler.quadrature_captured());
        poll_ticks(&mut sampler, 10);
        assert_eq!(sampler.fill(), 3);

        let word = COUNTER_CHANNEL.word_offset(0, counter::QUADRATURE);
        assert_eq!(region.word(word).load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_overflow_credit_across_wrap() {
        let region = region();
        // Clock starts 100 ticks before a wrap; edges every 40 ticks.
        let start = 0xFFFF_FFFF - 99;
        let edges = square(start + 40, 40, 150, 0);
        let mut sampler = sampler_for(edges, start, &region);
        poll_ticks(&mut sampler, 40 * 150);

        let mut consumer = Consumer::new(Arc::clone(&region), COUNTER_CHANNEL);
        let Packet::Counter(packet) =
            Packet::from_words(&consumer.take().unwrap().words).unwrap()
        else {
            panic!("expected counter packet");
        };
        let clocks: Vec<u64> = packet.edges.iter().map(|e| e.clock.logical()).collect();
        assert!(clocks.windows(2).all(|w| w[1] - w[0] == 40), "{clocks:x?}");
        assert_eq!(clocks[0], start + 40);
        // The decoder never ran, so every post-wrap edge relied on the pending bit.
        assert_eq!(packet.edges[5].clock.overflows, 1);
        assert_eq!(
            region.word(layout::WRAPAROUND).load(Ordering::Acquire),
            0
        );
    }

    #[test]
    fn test_shutdown_signals_completion_and_drops_partial_packet() {
        let region = region();
        let clock = SimClock::stepped(0, 1);
        let port = SimPort::driving(Arc::clone(&clock), square(10, 10, 20, 0));
        let log = port.signal_log();
        let mut sampler = EdgeSampler::new(
            port,
            SimTimer::new(clock),
            EncoderMasks::default(),
            Arc::clone(&region),
        );
        poll_ticks(&mut sampler, 300);
        ShutdownFlag::new(Arc::clone(&region)).set();

        let stats = sampler.run();
        assert_eq!(stats.edges, 20);
        assert_eq!(stats.packets_published, 0);
        assert_eq!(stats.discarded_edges, 20);
        assert_eq!(*log.lock(), vec![COMPLETION_SIGNAL]);
        assert_eq!(
            region.word(COUNTER_CHANNEL.ready).load(Ordering::Acquire),
            0
        );
    }
}
