//! Lock-free publish/consume handoff between a producer loop and the relay.
//!
//! Each channel ([`ChannelLayout`]) has a ready flag, one or two record slots and an owner
//! tag per slot. The flag says which slot holds a finished record (`0` empty, `n` means
//! slot `n - 1`). The owner tag says who may touch the slot:
//!
//! ```text
//! owner word = generation << 1 | holder        holder: 0 = producer, 1 = consumer
//! ```
//!
//! Producer side ([`Publisher`]):
//! 1. Before the first payload write to a slot, claim it by swapping the tag back to the
//!    producer. If the consumer still held it, the previous record was never taken: the
//!    overrun is counted and a flag that still names the slot is cleared.
//! 2. Write payload words (`Relaxed`).
//! 3. Publish: hand the slot to the consumer with a new generation (`Release`), then store
//!    the flag (`Release`). Payload is always visible before the flag.
//!
//! Consumer side ([`Consumer`]):
//! 1. Load the flag (`Acquire`). Zero means nothing to do.
//! 2. Load the slot's tag; it must be consumer-held.
//! 3. Copy the payload.
//! 4. Release the slot with a compare-and-swap from the tag read in step 2. A failed swap
//!    means the producer reclaimed the slot during the copy; the copy is discarded.
//! 5. Clear the flag with a compare-and-swap, so a newer publication is never erased.
//!
//! A slow consumer therefore loses whole records, never mixes two of them, and every loss
//! shows up in [`Publisher::overruns`] or [`Consumer::torn`].

use crate::data::layout::ChannelLayout;
use crate::data::SharedRegion;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Ready flag value meaning "no record pending".
pub const SLOT_FREE: u32 = 0;

const HOLDER_PRODUCER: u32 = 0;
const HOLDER_CONSUMER: u32 = 1;
const HOLDER_MASK: u32 = 1;

/// Counters kept by a publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    /// Records handed to the consumer.
    pub published: u64,
    /// Records reclaimed before the consumer took them.
    pub overruns: u64,
    /// Pending records withdrawn by the producer.
    pub retracted: u64,
}

/// Producer end of one channel.
#[derive(Debug)]
pub struct Publisher {
    region: Arc<SharedRegion>,
    layout: ChannelLayout,
    claimed: [bool; 2],
    generation: [u32; 2],
    stats: PublishStats,
}

impl Publisher {
    /// Attach a producer to `layout` inside `region`.
    pub fn new(region: Arc<SharedRegion>, layout: ChannelLayout) -> Self {
        debug_assert!(layout.slots >= 1 && layout.slots <= 2);
        Self {
            region,
            layout,
            claimed: [false; 2],
            generation: [0; 2],
            stats: PublishStats::default(),
        }
    }

    /// Channel this publisher writes to.
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    #[inline]
    fn ready(&self) -> &AtomicU32 {
        self.region.word(self.layout.ready)
    }

    #[inline]
    fn owner(&self, slot: usize) -> &AtomicU32 {
        self.region.word(self.layout.owner_offset(slot))
    }

    /// Take the slot back from the consumer if needed.
    #[inline]
    fn claim(&mut self, slot: usize) {
        if self.claimed[slot] {
            return;
        }
        let tag = self.generation[slot] << 1 | HOLDER_PRODUCER;
        let previous = self.owner(slot).swap(tag, Ordering::AcqRel);
        if previous & HOLDER_MASK == HOLDER_CONSUMER {
            self.stats.overruns += 1;
            let flag = slot as u32 + 1;
            let _ = self.ready().compare_exchange(
                flag,
                SLOT_FREE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        self.claimed[slot] = true;
    }

    /// Write one payload word of `slot`.
    #[inline]
    pub fn write(&mut self, slot: usize, word: usize, value: u32) {
        debug_assert!(slot < self.layout.slots);
        debug_assert!(word < self.layout.record_words);
        self.claim(slot);
        self.region
            .word(self.layout.word_offset(slot, word))
            .store(value, Ordering::Relaxed);
    }

    /// Hand `slot` to the consumer and raise the ready flag.
    #[inline]
    pub fn publish(&mut self, slot: usize) {
        debug_assert!(slot < self.layout.slots);
        self.claim(slot);
        self.generation[slot] = self.generation[slot].wrapping_add(1) & (u32::MAX >> 1);
        let tag = self.generation[slot] << 1 | HOLDER_CONSUMER;
        self.owner(slot).store(tag, Ordering::Release);
        self.ready().store(slot as u32 + 1, Ordering::Release);
        self.claimed[slot] = false;
        self.stats.published += 1;
    }

    /// Withdraw whatever record is pending and take its slot back.
    pub fn retract(&mut self) {
        let flag = self.ready().swap(SLOT_FREE, Ordering::AcqRel);
        if flag == SLOT_FREE || flag as usize > self.layout.slots {
            return;
        }
        let slot = flag as usize - 1;
        let held = self.generation[slot] << 1 | HOLDER_CONSUMER;
        let reclaimed = self.generation[slot] << 1 | HOLDER_PRODUCER;
        if self
            .owner(slot)
            .compare_exchange(held, reclaimed, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.claimed[slot] = true;
            self.stats.retracted += 1;
        }
    }

    /// Current ready flag value.
    pub fn ready_flag(&self) -> u32 {
        self.ready().load(Ordering::Acquire)
    }

    /// Counters so far.
    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    /// Records reclaimed before the consumer took them.
    pub fn overruns(&self) -> u64 {
        self.stats.overruns
    }
}

/// A record copied out of the region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakenRecord {
    /// Slot the record came from.
    pub slot: usize,
    /// Record words, header first.
    pub words: Vec<u32>,
}

impl TakenRecord {
    /// Little-endian byte image of the record, as sent on the wire.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.words.len() * 4);
        for &word in &self.words {
            buf.put_u32_le(word);
        }
        buf.freeze()
    }
}

/// Consumer end of one channel.
#[derive(Debug)]
pub struct Consumer {
    region: Arc<SharedRegion>,
    layout: ChannelLayout,
    taken: u64,
    torn: u64,
}

impl Consumer {
    /// Attach a consumer to `layout` inside `region`.
    pub fn new(region: Arc<SharedRegion>, layout: ChannelLayout) -> Self {
        Self {
            region,
            layout,
            taken: 0,
            torn: 0,
        }
    }

    /// Channel this consumer reads from.
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Copy out the pending record, if any, and release its slot.
    pub fn take(&mut self) -> Option<TakenRecord> {
        let ready = self.region.word(self.layout.ready);
        let flag = ready.load(Ordering::Acquire);
        if flag == SLOT_FREE {
            return None;
        }
        if flag as usize > self.layout.slots {
            let _ = ready.compare_exchange(flag, SLOT_FREE, Ordering::AcqRel, Ordering::Acquire);
            return None;
        }
        let slot = flag as usize - 1;
        let owner = self.region.word(self.layout.owner_offset(slot));
        let tag = owner.load(Ordering::Acquire);
        if tag & HOLDER_MASK != HOLDER_CONSUMER {
            // Producer already reclaimed the slot; the flag is stale.
            let _ = ready.compare_exchange(flag, SLOT_FREE, Ordering::AcqRel, Ordering::Acquire);
            return None;
        }

        let words: Vec<u32> = (0..self.layout.record_words)
            .map(|i| {
                self.region
                    .word(self.layout.word_offset(slot, i))
                    .load(Ordering::Relaxed)
            })
            .collect();

        let released = owner
            .compare_exchange(
                tag,
                tag & !HOLDER_MASK,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        let _ = ready.compare_exchange(flag, SLOT_FREE, Ordering::AcqRel, Ordering::Acquire);

        if released {
            self.taken += 1;
            Some(TakenRecord { slot, words })
        } else {
            self.torn += 1;
            None
        }
    }

    /// Current ready flag value.
    pub fn ready_flag(&self) -> u32 {
        self.region.word(self.layout.ready).load(Ordering::Acquire)
    }

    /// Records successfully copied out.
    pub fn taken(&self) -> u64 {
        self.taken
    }

    /// Copies discarded because the producer reclaimed the slot mid-copy.
    pub fn torn(&self) -> u64 {
        self.torn
    }
}
