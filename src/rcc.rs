//! Reset and clock control (RCC) for the USB and DMA peripherals
//!
//! Only the three RCC registers the driver touches are mapped. Clock gating
//! and peripheral reset pulses for bring-up/teardown live here; the settle
//! delays around them stay in [`host`](crate::host) where the sequence is
//! defined.

use crate::otg::Register;

/// Base address of the RCC block
pub const RCC_BASE: usize = 0x4002_3800;

/// AHB1 peripheral clock enable bit for DMA2
pub const AHB1ENR_DMA2EN: u32 = 1 << 22;

/// AHB2 clock enable / reset bit for OTG_FS
pub const AHB2_OTGFS: u32 = 1 << 7;

/// RCC registers used by the driver
#[repr(C)]
pub struct RccRegisters {
    _reserved0: [Register<u32>; 5],
    /// AHB2 peripheral reset register (AHB2RSTR), offset 0x14
    pub ahb2rstr: Register<u32>,
    _reserved1: [Register<u32>; 6],
    /// AHB1 peripheral clock enable register (AHB1ENR), offset 0x30
    pub ahb1enr: Register<u32>,
    /// AHB2 peripheral clock enable register (AHB2ENR), offset 0x34
    pub ahb2enr: Register<u32>,
}

/// Typed view of the RCC registers at `base`
///
/// # Safety
///
/// `base` must be the RCC block base address (or a test bank with the same
/// layout) for which the caller has exclusive access to the mapped fields.
#[inline(always)]
pub unsafe fn rcc_regs<'a>(base: usize) -> &'a RccRegisters {
    unsafe { &*(base as *const RccRegisters) }
}

const _: () = {
    assert!(core::mem::offset_of!(RccRegisters, ahb2rstr) == 0x14);
    assert!(core::mem::offset_of!(RccRegisters, ahb1enr) == 0x30);
    assert!(core::mem::offset_of!(RccRegisters, ahb2enr) == 0x34);
};
