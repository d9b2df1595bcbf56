//! Shared packet region and the records that travel through it.
//!
//! - [`layout`]: fixed offsets of flags, slots and owner tags
//! - [`region`]: the mapped memory and its control words
//! - [`exchange`]: lock-free publish/consume handoff per channel
//! - [`packets`]: owned record types and the datagram codec

pub mod exchange;
pub mod layout;
pub mod packets;
pub mod region;

pub use exchange::{Consumer, PublishStats, Publisher, TakenRecord};
pub use packets::{
    CounterPacket, EdgeRecord, ErrorCode, ErrorState, IrigFrame, Packet, QuadratureState,
};
pub use region::{SharedRegion, ShutdownFlag, WraparoundCounter};
