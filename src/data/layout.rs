//! Byte layout of the shared packet region.
//!
//! Every field is a little-endian 32-bit word. The offsets are fixed so that a relay
//! running in another process (or reading a file-backed region) can locate the flags and
//! records without any negotiation.
//!
//! # Memory Layout
//! ```text
//! 0x0000  counter ready flag       (0 = empty, 1 = slot 0, 2 = slot 1)
//! 0x0008  all-done flag            (set once by the IRIG decoder)
//! 0x0010  wraparound counter       (written by the IRIG decoder only)
//! 0x0014  wraparound sequence      (odd while an overflow is being acknowledged)
//! 0x0018  counter packet slots     2 x 1816 bytes
//! 0x1850  IRIG ready flag
//! 0x1858  IRIG frame slots         2 x 132 bytes
//! 0x3000  error ready flag
//! 0x3008  error record             1 x 8 bytes
//! 0x3010  slot owner tags          counter[2], irig[2], error[1]
//! ```
//!
//! Counter packet (454 words):
//! ```text
//! header (0x1EAF) | clock[150] | overflow[150] | edge_index[150] | quad a, b, c
//! ```
//!
//! IRIG frame (33 words):
//! ```text
//! header (0xCAFE) | rising_edge_time | init_overflow | info[10] | sync_time[10] | sync_overflow[10]
//! ```
//!
//! Error record (2 words):
//! ```text
//! header (0xE12A) | error_code
//! ```

/// Size of one region word in bytes.
pub const WORD: usize = 4;

/// Edge records carried by one counter packet.
pub const EDGES_PER_PACKET: usize = 150;

/// Data words and sync captures carried by one IRIG frame.
pub const IRIG_DECADES: usize = 10;

/// Header word of a counter packet.
pub const COUNTER_HEADER: u32 = 0x1EAF;
/// Header word of an IRIG frame.
pub const IRIG_HEADER: u32 = 0xCAFE;
/// Header word of an error record.
pub const ERROR_HEADER: u32 = 0xE12A;

/// Counter-packet ready flag.
pub const COUNTER_READY: usize = 0x0000;
/// Set to 1 by the decoder when the session is over.
pub const ALL_DONE: usize = 0x0008;
/// Number of tick counter overflows observed so far.
pub const WRAPAROUND: usize = 0x0010;
/// Sequence word guarding the wraparound counter together with the overflow status bit.
pub const WRAP_SEQUENCE: usize = 0x0014;
/// First counter packet slot.
pub const COUNTER_SLOTS: usize = 0x0018;
/// IRIG-frame ready flag.
pub const IRIG_READY: usize = 0x1850;
/// First IRIG frame slot.
pub const IRIG_SLOTS: usize = 0x1858;
/// Error ready flag.
pub const ERROR_READY: usize = 0x3000;
/// The single error record.
pub const ERROR_RECORD: usize = 0x3008;
/// Owner tags, one word per slot of every channel.
pub const SLOT_OWNERS: usize = 0x3010;
/// Total mapped size of the region.
pub const REGION_LEN: usize = 0x4000;

/// Word indices inside a counter packet.
pub mod counter {
    use super::EDGES_PER_PACKET;

    /// Header word.
    pub const HEADER: usize = 0;
    /// First low-32-bit clock value.
    pub const CLOCK: usize = 1;
    /// First overflow count.
    pub const OVERFLOW: usize = CLOCK + EDGES_PER_PACKET;
    /// First monotonic edge index.
    pub const EDGE_INDEX: usize = OVERFLOW + EDGES_PER_PACKET;
    /// Quadrature phases a, b, c.
    pub const QUADRATURE: usize = EDGE_INDEX + EDGES_PER_PACKET;
    /// Words per packet.
    pub const WORDS: usize = QUADRATURE + 3;
}

/// Word indices inside an IRIG frame.
pub mod irig {
    use super::IRIG_DECADES;

    /// Header word.
    pub const HEADER: usize = 0;
    /// Low 32 bits of the frame reference rising edge.
    pub const RISING_EDGE: usize = 1;
    /// Overflow count at the frame reference edge.
    pub const INIT_OVERFLOW: usize = 2;
    /// First decoded data word.
    pub const INFO: usize = 3;
    /// First sync-pulse capture time.
    pub const SYNC_TIME: usize = INFO + IRIG_DECADES;
    /// First sync-pulse overflow count.
    pub const SYNC_OVERFLOW: usize = SYNC_TIME + IRIG_DECADES;
    /// Words per frame.
    pub const WORDS: usize = SYNC_OVERFLOW + IRIG_DECADES;
}

/// Word indices inside the error record.
pub mod error {
    /// Header word.
    pub const HEADER: usize = 0;
    /// Error code word.
    pub const CODE: usize = 1;
    /// Words per record.
    pub const WORDS: usize = 2;
}

/// Location of one publish/consume channel inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Name used in log messages.
    pub name: &'static str,
    /// Byte offset of the ready flag.
    pub ready: usize,
    /// Byte offset of slot 0.
    pub base: usize,
    /// Words per record.
    pub record_words: usize,
    /// Number of slots (ready flag values run 1..=slots).
    pub slots: usize,
    /// Byte offset of the owner tag of slot 0.
    pub owners: usize,
    /// Header word written into every slot at session start.
    pub header: u32,
}

impl ChannelLayout {
    /// Byte offset of a slot.
    pub const fn slot_offset(&self, slot: usize) -> usize {
        self.base + slot * self.record_words * WORD
    }

    /// Byte offset of one word of a slot.
    pub const fn word_offset(&self, slot: usize, word: usize) -> usize {
        self.slot_offset(slot) + word * WORD
    }

    /// Byte offset of a slot's owner tag.
    pub const fn owner_offset(&self, slot: usize) -> usize {
        self.owners + slot * WORD
    }

    /// Size of one record image in bytes.
    pub const fn record_bytes(&self) -> usize {
        self.record_words * WORD
    }
}

/// Double-buffered counter packets.
pub const COUNTER_CHANNEL: ChannelLayout = ChannelLayout {
    name: "counter",
    ready: COUNTER_READY,
    base: COUNTER_SLOTS,
    record_words: counter::WORDS,
    slots: 2,
    owners: SLOT_OWNERS,
    header: COUNTER_HEADER,
};

/// Double-buffered IRIG frames.
pub const IRIG_CHANNEL: ChannelLayout = ChannelLayout {
    name: "irig",
    ready: IRIG_READY,
    base: IRIG_SLOTS,
    record_words: irig::WORDS,
    slots: 2,
    owners: SLOT_OWNERS + 2 * WORD,
    header: IRIG_HEADER,
};

/// Single error record.
pub const ERROR_CHANNEL: ChannelLayout = ChannelLayout {
    name: "error",
    ready: ERROR_READY,
    base: ERROR_RECORD,
    record_words: error::WORDS,
    slots: 1,
    owners: SLOT_OWNERS + 4 * WORD,
    header: ERROR_HEADER,
};

/// All channels in the region.
pub const CHANNELS: [ChannelLayout; 3] = [COUNTER_CHANNEL, IRIG_CHANNEL, ERROR_CHANNEL];

const _: () = {
    assert!(WRAP_SEQUENCE + WORD <= COUNTER_SLOTS);
    assert!(counter::WORDS * WORD == 1816);
    assert!(irig::WORDS * WORD == 132);
    assert!(COUNTER_CHANNEL.slot_offset(2) <= IRIG_READY);
    assert!(IRIG_CHANNEL.slot_offset(2) <= ERROR_READY);
    assert!(ERROR_CHANNEL.slot_offset(1) <= SLOT_OWNERS);
    assert!(ERROR_CHANNEL.owner_offset(1) <= REGION_LEN);
};
