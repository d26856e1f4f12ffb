//! OTG_FS host controller register interface
//!
//! Memory-mapped register structures and bit definitions for the USB OTG_FS
//! controller operating in host mode, as documented in the STM32F20x/21x
//! reference manual (RM0033, OTG_FS chapter).
//!
//! # Register memory layout
//!
//! The OTG_FS register space is divided into:
//! - Core global registers (offset 0x000)
//! - Host-mode registers (offset 0x400)
//! - Host channel registers (offset 0x500, one 0x20 block per channel)
//! - Data FIFO access windows (offset 0x1000, one 0x1000 window per channel)
//!
//! All access goes through [`Register`]; no policy lives here.

pub mod register;

pub use register::{Register, TickTimeout};

use bitflags::bitflags;

/// Base address of the OTG_FS controller
pub const OTG_FS_BASE: usize = 0x5000_0000;

/// Number of host channels implemented by OTG_FS
pub const MAX_CHANNELS: usize = 8;

/// Offset of the host-mode register block
pub const HOST_REGS_OFFSET: usize = 0x400;

/// Offset of the first host channel register block
pub const CHANNEL_REGS_OFFSET: usize = 0x500;

/// Stride between host channel register blocks
pub const CHANNEL_REGS_STRIDE: usize = 0x20;

/// Offset of the first data FIFO access window
pub const FIFO_OFFSET: usize = 0x1000;

/// Stride between data FIFO access windows
pub const FIFO_STRIDE: usize = 0x1000;

/// OTG_FS core global registers (offset 0x000)
#[repr(C)]
pub struct CoreRegisters {
    /// Control and status register (GOTGCTL)
    pub gotgctl: Register<u32>,
    /// Interrupt register (GOTGINT)
    pub gotgint: Register<u32>,
    /// AHB configuration register (GAHBCFG)
    pub gahbcfg: Register<u32>,
    /// USB configuration register (GUSBCFG)
    pub gusbcfg: Register<u32>,
    /// Reset register (GRSTCTL)
    pub grstctl: Register<u32>,
    /// Core interrupt register (GINTSTS)
    pub gintsts: Register<u32>,
    /// Interrupt mask register (GINTMSK)
    pub gintmsk: Register<u32>,
    /// Receive status debug read register (GRXSTSR)
    pub grxstsr: Register<u32>,
    /// Receive status read and pop register (GRXSTSP)
    pub grxstsp: Register<u32>,
    /// Receive FIFO size register (GRXFSIZ)
    pub grxfsiz: Register<u32>,
    /// Host non-periodic transmit FIFO size register (HNPTXFSIZ)
    pub hnptxfsiz: Register<u32>,
    /// Non-periodic transmit FIFO/queue status register (HNPTXSTS)
    pub hnptxsts: Register<u32>,
    _reserved0: [Register<u32>; 2],
    /// General core configuration register (GCCFG)
    pub gccfg: Register<u32>,
    /// Core ID register (CID)
    pub cid: Register<u32>,
    _reserved1: [Register<u32>; 48],
    /// Host periodic transmit FIFO size register (HPTXFSIZ)
    pub hptxfsiz: Register<u32>,
}

/// OTG_FS host-mode registers (offset 0x400)
#[repr(C)]
pub struct HostRegisters {
    /// Host configuration register (HCFG)
    pub hcfg: Register<u32>,
    /// Host frame interval register (HFIR)
    pub hfir: Register<u32>,
    /// Host frame number/frame time remaining register (HFNUM)
    pub hfnum: Register<u32>,
    _reserved0: Register<u32>,
    /// Periodic transmit FIFO/queue status register (HPTXSTS)
    pub hptxsts: Register<u32>,
    /// All channels interrupt register (HAINT)
    pub haint: Register<u32>,
    /// All channels interrupt mask register (HAINTMSK)
    pub haintmsk: Register<u32>,
    _reserved1: [Register<u32>; 9],
    /// Host port control and status register (HPRT)
    pub hprt: Register<u32>,
}

/// OTG_FS host channel registers (offset 0x500 + 0x20 * channel)
#[repr(C)]
pub struct ChannelRegisters {
    /// Channel characteristics register (HCCHAR)
    pub hcchar: Register<u32>,
    _reserved0: Register<u32>,
    /// Channel interrupt register (HCINT)
    pub hcint: Register<u32>,
    /// Channel interrupt mask register (HCINTMSK)
    pub hcintmsk: Register<u32>,
    /// Channel transfer size register (HCTSIZ)
    pub hctsiz: Register<u32>,
    _reserved1: [Register<u32>; 3],
}

/// Typed view of the core global registers at `base`
///
/// # Safety
///
/// `base` must be the base address of an OTG_FS controller (or a test bank
/// with the same layout) for which the caller has exclusive access.
#[inline(always)]
pub unsafe fn core_regs<'a>(base: usize) -> &'a CoreRegisters {
    unsafe { &*(base as *const CoreRegisters) }
}

/// Typed view of the host-mode registers at `base`
///
/// # Safety
///
/// Same contract as [`core_regs`].
#[inline(always)]
pub unsafe fn host_regs<'a>(base: usize) -> &'a HostRegisters {
    unsafe { &*((base + HOST_REGS_OFFSET) as *const HostRegisters) }
}

/// Typed view of one host channel register block
///
/// # Safety
///
/// Same contract as [`core_regs`]; `index` must be below [`MAX_CHANNELS`].
#[inline(always)]
pub unsafe fn channel_regs<'a>(base: usize, index: usize) -> &'a ChannelRegisters {
    debug_assert!(index < MAX_CHANNELS);
    unsafe {
        &*((base + CHANNEL_REGS_OFFSET + index * CHANNEL_REGS_STRIDE) as *const ChannelRegisters)
    }
}

/// Address of a channel's data FIFO access window
#[inline(always)]
pub fn fifo_ptr(base: usize, index: usize) -> *mut u32 {
    debug_assert!(index < MAX_CHANNELS);
    (base + FIFO_OFFSET + index * FIFO_STRIDE) as *mut u32
}

bitflags! {
    /// AHB configuration register (GAHBCFG) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GahbCfg: u32 {
        /// Global interrupt mask (GINT) - Bit 0
        const GINT = 1 << 0;
    }
}

bitflags! {
    /// USB configuration register (GUSBCFG) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GusbCfg: u32 {
        /// Full-speed serial transceiver select (PHYSEL) - Bit 6
        const PHYSEL = 1 << 6;
        /// USB turnaround time (TRDT) - Bits [13:10]
        const TRDT_MASK = 0xF << 10;
        /// Force host mode (FHMOD) - Bit 29
        const FHMOD = 1 << 29;
    }
}

impl GusbCfg {
    /// Encode a USB turnaround time value into the TRDT field
    pub const fn trdt(cycles: u32) -> u32 {
        (cycles & 0xF) << 10
    }
}

bitflags! {
    /// Reset register (GRSTCTL) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrstCtl: u32 {
        /// Core soft reset (CSRST) - Bit 0
        const CSRST = 1 << 0;
        /// AHB master idle (AHBIDL) - Bit 31
        const AHBIDL = 1 << 31;
    }
}

bitflags! {
    /// Core interrupt register (GINTSTS/GINTMSK) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GintSts: u32 {
        /// Start of frame (SOF) - Bit 3
        const SOF = 1 << 3;
        /// Receive FIFO non-empty (RXFLVL) - Bit 4
        const RXFLVL = 1 << 4;
        /// Host port interrupt (HPRTINT) - Bit 24
        const HPRTINT = 1 << 24;
        /// Host channels interrupt (HCINT) - Bit 25
        const HCINT = 1 << 25;
        /// Disconnect detected (DISCINT) - Bit 29
        const DISCINT = 1 << 29;
    }
}

bitflags! {
    /// General core configuration register (GCCFG) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GccFg: u32 {
        /// Power down deactivated (PWRDWN) - Bit 16
        const PWRDWN = 1 << 16;
        /// SOF output enable (SOFOUTEN) - Bit 20
        const SOFOUTEN = 1 << 20;
    }
}

bitflags! {
    /// Host configuration register (HCFG) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Hcfg: u32 {
        /// FS/LS PHY clock select (FSLSPCS) - Bits [1:0]
        const FSLSPCS_MASK = 0b11;
        /// FS/LS-only support (FSLSS) - Bit 2
        const FSLSS = 1 << 2;
    }
}

impl Hcfg {
    /// Encode a PHY clock selection into the FSLSPCS field
    /// (1 = 48 MHz, 2 = 6 MHz)
    pub const fn fslspcs(sel: u32) -> u32 {
        sel & 0b11
    }
}

bitflags! {
    /// Host port control and status register (HPRT) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Hprt: u32 {
        /// Port connect status (PCSTS) - Bit 0
        const PCSTS = 1 << 0;
        /// Port connect detected (PCDET) - Bit 1, write 1 to clear
        const PCDET = 1 << 1;
        /// Port enabled (PENA) - Bit 2, write 1 to clear
        const PENA = 1 << 2;
        /// Port enable/disable change (PENCHNG) - Bit 3, write 1 to clear
        const PENCHNG = 1 << 3;
        /// Port overcurrent active (POCA) - Bit 4
        const POCA = 1 << 4;
        /// Port overcurrent change (POCCHNG) - Bit 5, write 1 to clear
        const POCCHNG = 1 << 5;
        /// Port resume (PRES) - Bit 6
        const PRES = 1 << 6;
        /// Port suspend (PSUSP) - Bit 7
        const PSUSP = 1 << 7;
        /// Port reset (PRST) - Bit 8
        const PRST = 1 << 8;
        /// Port power (PPWR) - Bit 12
        const PPWR = 1 << 12;
        /// Port speed (PSPD) - Bits [18:17]
        const PSPD_MASK = 0b11 << 17;
    }
}

impl Hprt {
    /// Bits that are write-1-to-clear or cleared by writing zero; a
    /// read-modify-write of HPRT must mask these out of the written value
    /// to avoid acknowledging interrupts or disabling the port by accident
    pub const W1C_MASK: u32 = Self::PCDET.bits()
        | Self::PENA.bits()
        | Self::PENCHNG.bits()
        | Self::POCCHNG.bits();

    /// Shift of the PSPD field
    pub const PSPD_SHIFT: u32 = 17;
}

bitflags! {
    /// Channel characteristics register (HCCHAR) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcChar: u32 {
        /// Maximum packet size (MPSIZ) - Bits [10:0]
        const MPSIZ_MASK = 0x7FF;
        /// Endpoint number (EPNUM) - Bits [14:11]
        const EPNUM_MASK = 0xF << 11;
        /// Endpoint direction (EPDIR) - Bit 15, 1 = IN
        const EPDIR = 1 << 15;
        /// Low-speed device (LSDEV) - Bit 17
        const LSDEV = 1 << 17;
        /// Endpoint type (EPTYP) - Bits [19:18]
        const EPTYP_MASK = 0b11 << 18;
        /// Multicount (MCNT) - Bits [21:20]
        const MCNT_MASK = 0b11 << 20;
        /// One transaction per frame (MCNT = 1)
        const MCNT_1 = 0b01 << 20;
        /// Device address (DAD) - Bits [28:22]
        const DAD_MASK = 0x7F << 22;
        /// Odd frame (ODDFRM) - Bit 29
        const ODDFRM = 1 << 29;
        /// Channel disable (CHDIS) - Bit 30
        const CHDIS = 1 << 30;
        /// Channel enable (CHENA) - Bit 31
        const CHENA = 1 << 31;
    }
}

impl HcChar {
    /// Fields preserved across transactions on an allocated channel
    pub const STATIC_FIELDS: u32 = Self::ODDFRM.bits()
        | Self::DAD_MASK.bits()
        | Self::MCNT_MASK.bits()
        | Self::EPTYP_MASK.bits()
        | Self::LSDEV.bits()
        | Self::EPNUM_MASK.bits()
        | Self::MPSIZ_MASK.bits();

    /// Shift of the EPTYP field
    pub const EPTYP_SHIFT: u32 = 18;
}

bitflags! {
    /// Channel interrupt register (HCINT/HCINTMSK) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcInt: u32 {
        /// Transfer completed (XFRC) - Bit 0
        const XFRC = 1 << 0;
        /// Channel halted (CHH) - Bit 1
        const CHH = 1 << 1;
        /// STALL response received (STALL) - Bit 3
        const STALL = 1 << 3;
        /// NAK response received (NAK) - Bit 4
        const NAK = 1 << 4;
        /// ACK response received (ACK) - Bit 5
        const ACK = 1 << 5;
        /// NYET response received (NYET) - Bit 6
        const NYET = 1 << 6;
        /// Transaction error (TXERR) - Bit 7
        const TXERR = 1 << 7;
        /// Babble error (BBERR) - Bit 8
        const BBERR = 1 << 8;
        /// Frame overrun (FRMOR) - Bit 9
        const FRMOR = 1 << 9;
        /// Data toggle error (DTERR) - Bit 10
        const DTERR = 1 << 10;
    }
}

impl HcInt {
    /// All channel interrupt causes
    pub const ALL: u32 = 0x7FF;

    /// Error-class causes accumulated into the URB error flags
    pub const ERR_MASK: u32 =
        Self::TXERR.bits() | Self::BBERR.bits() | Self::FRMOR.bits() | Self::DTERR.bits();

    /// Shift aligning [`Self::ERR_MASK`] with the URB error flag bits
    pub const ERR_SHIFT: u32 = 7;

    /// Causes enabled while an IN transaction is in flight
    pub const IN_MASK: Self = Self::from_bits_truncate(
        Self::DTERR.bits()
            | Self::BBERR.bits()
            | Self::TXERR.bits()
            | Self::ACK.bits()
            | Self::NAK.bits()
            | Self::STALL.bits()
            | Self::XFRC.bits(),
    );

    /// Causes enabled while an OUT transaction is in flight
    pub const OUT_MASK: Self = Self::from_bits_truncate(
        Self::TXERR.bits()
            | Self::NYET.bits()
            | Self::NAK.bits()
            | Self::STALL.bits()
            | Self::XFRC.bits(),
    );

    /// Causes enabled while a SETUP transaction is in flight
    pub const SETUP_MASK: Self = Self::from_bits_truncate(
        Self::TXERR.bits() | Self::NAK.bits() | Self::STALL.bits() | Self::XFRC.bits(),
    );

    /// Causes enabled while a PING transaction is in flight
    pub const PING_MASK: Self = Self::from_bits_truncate(
        Self::TXERR.bits()
            | Self::ACK.bits()
            | Self::NAK.bits()
            | Self::STALL.bits()
            | Self::XFRC.bits(),
    );
}

/// Channel transfer size register (HCTSIZ) field definitions
pub mod hctsiz {
    /// Transfer size (XFRSIZ) - Bits [18:0]
    pub const XFRSIZ_MASK: u32 = 0x7_FFFF;
    /// Packet count (PKTCNT) - Bits [28:19]
    pub const PKTCNT_SHIFT: u32 = 19;
    /// Packet count mask, in place
    pub const PKTCNT_MASK: u32 = 0x3FF << PKTCNT_SHIFT;
    /// Data PID (DPID) - Bits [30:29]
    pub const DPID_MASK: u32 = 0b11 << 29;
    /// DPID value for DATA0
    pub const DPID_DATA0: u32 = 0b00 << 29;
    /// DPID value for DATA1
    pub const DPID_DATA1: u32 = 0b10 << 29;
    /// DPID value for MDATA (SETUP)
    pub const DPID_MDATA: u32 = 0b11 << 29;
    /// Do PING (DOPING) - Bit 31
    pub const DOPING: u32 = 1 << 31;
}

/// Receive status word (GRXSTSR/GRXSTSP) field helpers
pub mod grxsts {
    /// Packet status value for "IN data packet received"
    pub const PKTSTS_IN_DATA: u32 = 0x2;

    /// Channel number field - Bits [3:0]
    #[inline(always)]
    pub const fn channel(word: u32) -> usize {
        (word & 0xF) as usize
    }

    /// Byte count field - Bits [14:4]
    #[inline(always)]
    pub const fn byte_count(word: u32) -> usize {
        ((word >> 4) & 0x7FF) as usize
    }

    /// Packet status field - Bits [20:17]
    #[inline(always)]
    pub const fn packet_status(word: u32) -> u32 {
        (word >> 17) & 0xF
    }
}

// Register block layout must match the hardware map exactly.
const _: () = {
    assert!(core::mem::size_of::<CoreRegisters>() == 0x104);
    assert!(core::mem::align_of::<CoreRegisters>() == 4);
    assert!(core::mem::size_of::<HostRegisters>() == 0x44);
    assert!(core::mem::size_of::<ChannelRegisters>() == CHANNEL_REGS_STRIDE);
};
