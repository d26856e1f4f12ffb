//! TX FIFO loading over DMA2 stream 0
//!
//! OUT and SETUP payloads are moved from system memory into a channel's
//! transmit FIFO window by a memory-to-memory DMA transfer instead of a CPU
//! copy loop. One stream is shared by all channels; the interrupt engine
//! serializes its use by starting at most one outbound transaction per frame
//! tick.
//!
//! Transfers are word-granular. The FIFO write window ignores byte lanes
//! past the programmed transfer size, so rounding the word count up is safe.

use crate::error::Result;
use crate::otg::{Register, TickTimeout};
use embedded_hal::delay::DelayNs;

/// Base address of the DMA2 controller
pub const DMA2_BASE: usize = 0x4002_6400;

/// Stream configuration for the FIFO load: 32-bit memory and peripheral
/// size, both addresses incrementing, memory-to-memory direction
const STREAM_CONFIG: u32 = (2 << 13) | (2 << 11) | (1 << 10) | (1 << 9) | (2 << 6);

/// Stream enable bit (CR.EN)
const CR_EN: u32 = 1 << 0;

/// Stream 0 interrupt flags in LIFCR
const STREAM0_FLAGS: u32 = 0x3D;

/// DMA controller registers, stream 0 only
#[repr(C)]
pub struct DmaRegisters {
    /// Low interrupt status register (LISR)
    pub lisr: Register<u32>,
    /// High interrupt status register (HISR)
    pub hisr: Register<u32>,
    /// Low interrupt flag clear register (LIFCR)
    pub lifcr: Register<u32>,
    /// High interrupt flag clear register (HIFCR)
    pub hifcr: Register<u32>,
    /// Stream 0 configuration register (S0CR)
    pub s0cr: Register<u32>,
    /// Stream 0 number of data register (S0NDTR)
    pub s0ndtr: Register<u32>,
    /// Stream 0 peripheral address register (S0PAR)
    pub s0par: Register<u32>,
    /// Stream 0 memory 0 address register (S0M0AR)
    pub s0m0ar: Register<u32>,
    /// Stream 0 memory 1 address register (S0M1AR)
    pub s0m1ar: Register<u32>,
    /// Stream 0 FIFO control register (S0FCR)
    pub s0fcr: Register<u32>,
}

const _: () = {
    assert!(core::mem::offset_of!(DmaRegisters, s0cr) == 0x10);
    assert!(core::mem::offset_of!(DmaRegisters, s0ndtr) == 0x14);
};

/// Typed view of the DMA registers at `base`
///
/// # Safety
///
/// `base` must be the DMA2 block base address (or a test bank with the same
/// layout) for which the caller has exclusive access to stream 0.
#[inline(always)]
pub unsafe fn dma_regs<'a>(base: usize) -> &'a DmaRegisters {
    unsafe { &*(base as *const DmaRegisters) }
}

/// Shared DMA stream moving payloads into transmit FIFO windows
pub struct TxFifoDma {
    regs: &'static DmaRegisters,
}

impl TxFifoDma {
    /// Wrap the DMA controller at `base`
    ///
    /// # Safety
    ///
    /// Same contract as [`dma_regs`]; the caller must be the sole user of
    /// stream 0 for the lifetime of the returned value.
    pub unsafe fn new(base: usize) -> Self {
        Self {
            regs: unsafe { dma_regs(base) },
        }
    }

    /// Start a transfer of `len` bytes from `src` into the FIFO window at
    /// `dest`, rounding up to whole words
    pub fn start(&self, dest: *mut u32, src: *const u8, len: usize) {
        let regs = self.regs;
        regs.lifcr.write(STREAM0_FLAGS);
        regs.s0par.write(src as u32);
        regs.s0m1ar.write(0);
        regs.s0m0ar.write(dest as u32);
        regs.s0ndtr.write(((len + 3) / 4) as u32);
        regs.s0fcr.write(0);
        regs.s0cr.write(STREAM_CONFIG);
        regs.s0cr.set_bits(CR_EN);
    }

    /// Disable the stream and wait for the enable bit to clear
    pub fn stop<D: DelayNs>(&self, delay: &mut D) -> Result<()> {
        self.regs.s0cr.write(0);
        TickTimeout::new().wait_for(delay, || self.regs.s0cr.read() & CR_EN == 0)
    }

    /// Wait for an in-flight transfer to drain, then stop the stream
    pub fn wait<D: DelayNs>(&self, delay: &mut D) -> Result<()> {
        let regs = self.regs;
        let done =
            TickTimeout::new().wait_for(delay, || {
                regs.s0cr.read() & CR_EN == 0 || regs.s0ndtr.read() == 0
            });
        // The stream is forced off even when the drain timed out, so a
        // wedged transfer cannot corrupt the next FIFO load.
        let stopped = self.stop(delay);
        done.and(stopped)
    }
}
