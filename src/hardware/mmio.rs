//! Memory-mapped register access for the acquisition board.
//!
//! Maps a GPIO bank and the industrial-ethernet-peripheral (IEP) timer through `/dev/mem`
//! and exposes them as [`SignalPort`] and [`TickCounter`].
//!
//! # IEP timer registers
//! ```text
//! 0x00  GLB_CFG   0x11 = enable, increment by 1 per cycle
//! 0x04  GLB_STS   bit 0 = counter overflowed, write 1 to clear
//! 0x08  COMPEN    0 = compensation disabled
//! 0x0C  COUNT     32-bit free-running counter
//! ```

#![allow(unsafe_code)]

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{SignalPort, TickCounter};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const IEP_GLB_CFG: usize = 0x00;
const IEP_GLB_STS: usize = 0x04;
const IEP_COMPEN: usize = 0x08;
const IEP_COUNT: usize = 0x0C;

const IEP_ENABLE: u32 = 0x11;
const IEP_OVERFLOW: u32 = 0x1;

/// Size of each register window.
pub const REGISTER_WINDOW: usize = 0x1000;

/// One mapped page of device registers.
///
/// # Safety
/// `base` points into `mmap`, which is `len` bytes long and lives as long as this struct.
/// Registers are only touched through volatile 32-bit accesses at aligned offsets below
/// `len`.
pub struct RegisterBlock {
    _mmap: MmapMut,
    base: *mut u32,
    len: usize,
}

// SAFETY: Device registers are accessed with single volatile word operations; the block
// itself holds no thread-affine state.
unsafe impl Send for RegisterBlock {}

// SAFETY: See above. Concurrent readers of the same register are fine; the only
// read-modify-write (clearing the overflow bit) is write-1-to-clear in hardware.
unsafe impl Sync for RegisterBlock {}

impl std::fmt::Debug for RegisterBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterBlock").field("len", &self.len).finish()
    }
}

impl RegisterBlock {
    /// Map `len` bytes of physical memory at `physical` from `device`.
    pub fn map(device: &Path, physical: u64, len: usize) -> AppResult<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|e| DaqError::SharedMemory(format!("cannot open {device:?}: {e}")))?;

        // SAFETY: The caller names a register window of the SoC. Nothing else in this
        // process maps it, and all accesses below are volatile.
        let mut mmap = unsafe {
            MmapOptions::new()
                .offset(physical)
                .len(len)
                .map_mut(&file)
                .map_err(|e| {
                    DaqError::SharedMemory(format!(
                        "cannot map {len:#x} bytes at {physical:#x} from {device:?}: {e}"
                    ))
                })?
        };
        let base = mmap.as_mut_ptr() as *mut u32;
        debug!(device = ?device, physical = %format!("{physical:#x}"), len, "Mapped register block");
        Ok(Arc::new(Self {
            _mmap: mmap,
            base,
            len,
        }))
    }

    /// Volatile read of the register at `offset`.
    #[inline]
    pub fn read(&self, offset: usize) -> u32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        // SAFETY: offset is aligned and inside the mapping.
        unsafe { std::ptr::read_volatile(self.base.add(offset / 4)) }
    }

    /// Volatile write of the register at `offset`.
    #[inline]
    pub fn write(&self, offset: usize, value: u32) {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        // SAFETY: offset is aligned and inside the mapping.
        unsafe { std::ptr::write_volatile(self.base.add(offset / 4), value) }
    }
}

/// GPIO bank input register, with an optional output register for completion signals.
#[derive(Debug, Clone)]
pub struct MmioPort {
    block: Arc<RegisterBlock>,
    datain: usize,
    dataout: Option<usize>,
}

impl MmioPort {
    /// Port reading `datain` of `block`, signalling on `dataout` if given.
    pub fn new(block: Arc<RegisterBlock>, datain: usize, dataout: Option<usize>) -> Self {
        Self {
            block,
            datain,
            dataout,
        }
    }
}

impl SignalPort for MmioPort {
    #[inline]
    fn sample(&mut self) -> u32 {
        self.block.read(self.datain)
    }

    fn signal(&mut self, value: u32) {
        match self.dataout {
            Some(offset) => self.block.write(offset, value),
            None => debug!(value, "No output register configured, signal dropped"),
        }
    }
}

/// The IEP free-running counter.
#[derive(Debug, Clone)]
pub struct IepTimer {
    block: Arc<RegisterBlock>,
}

impl IepTimer {
    /// Wrap an already-mapped IEP register window.
    pub fn new(block: Arc<RegisterBlock>) -> Self {
        Self { block }
    }

    /// Clear the overflow flag, enable counting by one per cycle, disable compensation.
    pub fn start(&self) {
        self.block.write(IEP_GLB_STS, IEP_OVERFLOW);
        self.block.write(IEP_GLB_CFG, IEP_ENABLE);
        self.block.write(IEP_COMPEN, 0);
        info!("IEP timer started");
    }
}

impl TickCounter for IepTimer {
    #[inline]
    fn ticks(&self) -> u32 {
        self.block.read(IEP_COUNT)
    }

    #[inline]
    fn overflow_pending(&self) -> bool {
        self.block.read(IEP_GLB_STS) & IEP_OVERFLOW != 0
    }

    #[inline]
    fn clear_overflow(&self) {
        self.block.write(IEP_GLB_STS, IEP_OVERFLOW);
    }
}
