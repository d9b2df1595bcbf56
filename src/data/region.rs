//! Memory-mapped packet region shared by the producers and the relay.
//!
//! The region is a fixed-size block of 32-bit words (see [`layout`](super::layout)). It is
//! either an anonymous mapping, used when every participant lives in this process, or a
//! file-backed mapping (typically under `/dev/shm`) so that an external relay can attach.
//!
//! All access goes through `&AtomicU32`. Producers and the relay never hold `&mut` to the
//! mapping, so the same words can be read and written from several threads at once. The
//! ordering each access needs is decided by the caller ([`exchange`](super::exchange),
//! [`SharedWord`]).

#![allow(unsafe_code)]

use crate::data::layout::{self, CHANNELS, REGION_LEN, WORD};
use crate::error::{AppResult, DaqError};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Packet region viewed as atomic words.
///
/// # Safety
/// `words` points into `mmap`, which is page aligned and at least `len_words * 4` bytes
/// long. The mapping is never accessed through anything but the atomic view after
/// construction, and it lives exactly as long as this struct.
pub struct SharedRegion {
    /// Keeps the mapping alive.
    _mmap: MmapMut,

    /// SAFETY: Points to the start of the mapping, valid as long as `_mmap` exists.
    words: *const AtomicU32,

    len_words: usize,
}

// SAFETY: Every access goes through AtomicU32, so the region can move between threads.
unsafe impl Send for SharedRegion {}

// SAFETY: Concurrent access is through atomic instructions only.
unsafe impl Sync for SharedRegion {}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("len_bytes", &(self.len_words * WORD))
            .finish()
    }
}

impl SharedRegion {
    /// Map an anonymous, zero-filled region of [`REGION_LEN`] bytes.
    pub fn anonymous() -> AppResult<Arc<Self>> {
        let mmap = MmapOptions::new()
            .len(REGION_LEN)
            .map_anon()
            .map_err(|e| DaqError::SharedMemory(format!("anonymous mapping failed: {e}")))?;
        Ok(Arc::new(Self::from_mmap(mmap)))
    }

    /// Create (or truncate) a file of [`REGION_LEN`] bytes and map it.
    ///
    /// ```no_run
    /// use encoder_daq::data::SharedRegion;
    /// use std::path::Path;
    ///
    /// let region = SharedRegion::create(Path::new("/dev/shm/encoder_daq")).unwrap();
    /// ```
    pub fn create(path: &Path) -> AppResult<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                DaqError::SharedMemory(format!("cannot open region file {path:?}: {e}"))
            })?;

        file.set_len(REGION_LEN as u64)?;

        // SAFETY: The file was just sized to REGION_LEN. Other processes attaching to it
        // must follow the same atomic word discipline.
        let mmap = unsafe {
            MmapOptions::new()
                .len(REGION_LEN)
                .map_mut(&file)
                .map_err(|e| DaqError::SharedMemory(format!("cannot map {path:?}: {e}")))?
        };
        debug!(path = ?path, len = REGION_LEN, "Mapped file-backed packet region");
        Ok(Arc::new(Self::from_mmap(mmap)))
    }

    fn from_mmap(mut mmap: MmapMut) -> Self {
        debug_assert!(mmap.len() >= REGION_LEN);
        // Mappings are page aligned, which satisfies AtomicU32 alignment.
        let words = mmap.as_mut_ptr() as *const AtomicU32;
        Self {
            len_words: REGION_LEN / WORD,
            _mmap: mmap,
            words,
        }
    }

    /// All words of the region.
    pub fn words(&self) -> &[AtomicU32] {
        // SAFETY: `words` is valid for `len_words` atomics for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.words, self.len_words) }
    }

    /// The word at a byte offset.
    ///
    /// # Panics
    /// Offsets come from [`layout`] constants; an unaligned or out-of-range offset is a
    /// programming error and panics on the slice index.
    #[inline]
    pub fn word(&self, offset: usize) -> &AtomicU32 {
        debug_assert_eq!(offset % WORD, 0, "unaligned region offset {offset:#x}");
        &self.words()[offset / WORD]
    }

    /// Size of the region in bytes.
    pub fn len_bytes(&self) -> usize {
        self.len_words * WORD
    }

    /// Reset the region for a new session.
    ///
    /// Zeroes every word (flags, wraparound counter, owner tags, payloads) and then writes
    /// the record header into each slot of each channel.
    pub fn initialise_session(&self) {
        for word in self.words() {
            word.store(0, Ordering::Relaxed);
        }
        for channel in CHANNELS {
            for slot in 0..channel.slots {
                self.word(channel.slot_offset(slot))
                    .store(channel.header, Ordering::Relaxed);
            }
        }
        fence(Ordering::Release);
        debug!("Packet region initialised");
    }
}

/// One shared control word with a fixed role.
#[derive(Debug, Clone)]
pub struct SharedWord {
    region: Arc<SharedRegion>,
    offset: usize,
}

impl SharedWord {
    /// View the word at `offset`.
    pub fn new(region: Arc<SharedRegion>, offset: usize) -> Self {
        Self { region, offset }
    }

    #[inline]
    fn cell(&self) -> &AtomicU32 {
        self.region.word(self.offset)
    }
}

/// Session shutdown flag at [`layout::ALL_DONE`].
///
/// Only the IRIG decoder sets it; the sampler and the relay observe it.
#[derive(Debug, Clone)]
pub struct ShutdownFlag(SharedWord);

impl ShutdownFlag {
    /// Attach to the flag in `region`.
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self(SharedWord::new(region, layout::ALL_DONE))
    }

    /// Whether the session is over.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.cell().load(Ordering::Acquire) != 0
    }

    /// Announce the end of the session.
    pub fn set(&self) {
        self.0.cell().store(1, Ordering::Release);
    }
}

/// Software extension of the 32-bit tick counter at [`layout::WRAPAROUND`].
///
/// Single writer (the IRIG decoder), any number of readers. The count and the hardware
/// overflow status bit change together under the sequence word at
/// [`layout::WRAP_SEQUENCE`]: the sequence is odd while an acknowledgement is in
/// progress, and every acknowledgement advances it by two. A reader that sees the same
/// even sequence before and after its reads observed a consistent (count, status) pair.
#[derive(Debug, Clone)]
pub struct WraparoundCounter {
    count: SharedWord,
    sequence: SharedWord,
}

impl WraparoundCounter {
    /// Attach to the counter in `region`.
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            count: SharedWord::new(Arc::clone(&region), layout::WRAPAROUND),
            sequence: SharedWord::new(region, layout::WRAP_SEQUENCE),
        }
    }

    /// Overflows counted so far.
    #[inline]
    pub fn load(&self) -> u32 {
        self.count.cell().load(Ordering::Acquire)
    }

    /// Count one observed overflow and clear its status bit as a single update.
    ///
    /// `clear_status` runs while the sequence is odd. Must only be called by the owning
    /// decoder.
    #[inline]
    pub fn acknowledge<F: FnOnce()>(&self, clear_status: F) {
        let sequence = self.sequence.cell();
        let open = sequence.load(Ordering::Relaxed).wrapping_add(1);
        sequence.store(open, Ordering::Relaxed);
        fence(Ordering::Release);

        clear_status();
        let count = self.count.cell();
        count.store(count.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);

        sequence.store(open.wrapping_add(1), Ordering::Release);
    }

    /// Run `read` until it completes without overlapping an acknowledgement.
    ///
    /// `read` receives the overflow count and is expected to sample the hardware status
    /// bit itself, so both belong to the same side of any acknowledgement.
    #[inline]
    pub fn read_consistent<R, F: FnMut(u32) -> R>(&self, mut read: F) -> R {
        let sequence = self.sequence.cell();
        let mut retries = 0u32;
        loop {
            let before = sequence.load(Ordering::Acquire);
            if before & 1 == 1 {
                // The decoder holds the sequence odd for a handful of instructions.
                if retries < 10 {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
                retries = retries.saturating_add(1);
                continue;
            }
            let value = read(self.count.cell().load(Ordering::Relaxed));
            fence(Ordering::Acquire);
            if sequence.load(Ordering::Relaxed) == before {
                return value;
            }
        }
    }
}
