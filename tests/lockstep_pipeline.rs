//! Sampler, decoder and relay driven in lock-step on one thread.
//!
//! The decoder's port advances a stepped clock, the sampler observes the same clock and
//! the relay collects after every step, so the whole pipeline is deterministic.

use bytes::Bytes;
use encoder_daq::data::{Packet, SharedRegion};
use encoder_daq::hardware::mock::{
    Combined, IrigSignal, QuadratureEncoder, SimClock, SimPort, SimTimer,
};
use encoder_daq::irig::{IrigDecoder, PulseThresholds, Timecode};
use encoder_daq::receiver::{CsvRecorder, Receiver, StopCondition};
use encoder_daq::relay::HostRelay;
use encoder_daq::sampler::{EdgeSampler, EncoderMasks, Progress};
use std::sync::Arc;

const TPS: u64 = 200_000_000;
const STEP: u64 = 2_000;
const IRIG_LINE: u32 = 1 << 14;
const HALF_PERIOD: u64 = 100_000;
const IRIG_ORIGIN: u64 = 1_000_000;

struct Pipeline {
    sampler: EdgeSampler<SimPort, SimTimer>,
    decoder: IrigDecoder<SimPort, SimTimer>,
    relay: HostRelay,
    sent: Vec<Bytes>,
    start: Timecode,
}

fn pipeline(frame_limit: u64) -> Pipeline {
    let region = SharedRegion::anonymous().unwrap();
    region.initialise_session();

    let start = Timecode::new(120, 8, 30, 0).unwrap();
    let clock = SimClock::stepped(0, STEP);
    let encoder = QuadratureEncoder::new(EncoderMasks::default(), 0, HALF_PERIOD);
    let irig = IrigSignal::new(IRIG_LINE, IRIG_ORIGIN, TPS, start);

    let sampler = EdgeSampler::new(
        SimPort::following(Arc::clone(&clock), Combined(encoder.clone(), irig.clone())),
        SimTimer::new(Arc::clone(&clock)),
        EncoderMasks::default(),
        Arc::clone(&region),
    );
    let decoder = IrigDecoder::new(
        SimPort::driving(Arc::clone(&clock), Combined(encoder, irig)),
        SimTimer::new(clock),
        IRIG_LINE,
        PulseThresholds::for_tick_rate(TPS),
        Arc::clone(&region),
    )
    .with_frame_limit(frame_limit);

    Pipeline {
        sampler,
        decoder,
        relay: HostRelay::new(region, false),
        sent: Vec::new(),
        start,
    }
}

impl Pipeline {
    fn run(&mut self) {
        loop {
            let decoder = self.decoder.poll();
            let sampler = self.sampler.poll();
            self.sent.extend(self.relay.collect());
            if decoder == Progress::Finished && sampler == Progress::Finished {
                break;
            }
        }
        self.sent.extend(self.relay.collect());
    }
}

#[test]
fn test_pipeline_publishes_every_record_in_order() {
    let mut p = pipeline(2);
    p.run();

    let decoder = p.decoder.stats();
    let sampler = p.sampler.stats();
    assert_eq!(decoder.frames_published, 2);
    assert_eq!(decoder.overruns, 0);
    assert_eq!(sampler.overruns, 0);
    assert!(p.relay.is_done());

    let packets: Vec<Packet> = p
        .sent
        .iter()
        .map(|d| Packet::decode(d).unwrap())
        .collect();
    let counters: Vec<_> = packets
        .iter()
        .filter_map(|p| match p {
            Packet::Counter(c) => Some(c),
            _ => None,
        })
        .collect();
    let frames: Vec<_> = packets
        .iter()
        .filter_map(|p| match p {
            Packet::Irig(f) => Some(f),
            _ => None,
        })
        .collect();

    assert_eq!(counters.len() as u64, sampler.packets_published);
    assert_eq!(frames.len(), 2);
    assert_eq!(
        Timecode::decode(&frames[0].info).unwrap(),
        p.start.advanced_by(1)
    );
    assert_eq!(
        Timecode::decode(&frames[1].info).unwrap(),
        p.start.advanced_by(2)
    );

    // Edges arrive exactly every half period with a gap-free running index.
    let edges: Vec<_> = counters.iter().flat_map(|c| c.edges.iter()).collect();
    assert_eq!(edges.len() as u64, sampler.packets_published * 150);
    for (i, edge) in edges.iter().enumerate() {
        assert_eq!(edge.edge_index, i as u32 + 1);
        assert_eq!(edge.clock.logical(), (i as u64 + 1) * HALF_PERIOD);
    }

    // Frames are stamped on the same clock as the encoder edges.
    let second = frames[1].rising_edge.logical();
    assert_eq!(second - frames[0].rising_edge.logical(), TPS);
    assert!(edges.iter().any(|e| e.clock.logical() > second));
}

#[test]
fn test_receiver_writes_csv_for_relayed_run() {
    let mut p = pipeline(4);
    p.run();

    let dir = tempfile::tempdir().unwrap();
    let recorder = CsvRecorder::create(dir.path(), "lockstep").unwrap();
    let mut receiver = Receiver::new(recorder, StopCondition::Seconds(3));
    for datagram in &p.sent {
        receiver.handle(datagram).unwrap();
    }
    receiver.flush().unwrap();
    assert!(receiver.is_complete());

    let stats = receiver.stats();
    assert_eq!(stats.irig_frames, 4);
    assert_eq!(stats.malformed, 0);
    assert_eq!(stats.counter_packets, p.sampler.stats().packets_published);

    let irig = std::fs::read_to_string(receiver.recorder().irig_path()).unwrap();
    assert_eq!(irig.lines().count(), 1 + 4 * 11);
    let first_row = irig.lines().nth(1).unwrap();
    let sod = p.start.advanced_by(1).seconds_of_day();
    assert!(first_row.starts_with(&format!("{sod},")), "{first_row}");

    let encoder = std::fs::read_to_string(receiver.recorder().encoder_path()).unwrap();
    assert_eq!(
        encoder.lines().count() as u64,
        1 + stats.counter_packets * 151
    );
}
