//! Mock register banks for driver tests
//!
//! Plain leaked memory stands in for the OTG, DMA and RCC register blocks.
//! Tests poke status registers the way hardware would and observe what the
//! driver writes back. Write-1-to-clear semantics are not emulated; tests
//! set each status register explicitly before raising an interrupt.

use core::ptr::{read_volatile, write_volatile};

use embedded_hal::delay::DelayNs;
use stm32f2_usbh::UsbHost;

// Core register offsets
pub const GUSBCFG: usize = 0x0C;
pub const GRSTCTL: usize = 0x10;
pub const GINTSTS: usize = 0x14;
pub const GINTMSK: usize = 0x18;
pub const GRXSTSR: usize = 0x1C;
pub const GRXSTSP: usize = 0x20;

// Host register offsets
pub const HCFG: usize = 0x400;
pub const HFIR: usize = 0x404;
pub const HAINT: usize = 0x414;
pub const HAINTMSK: usize = 0x418;
pub const HPRT: usize = 0x440;

// Interrupt bits
pub const INT_SOF: u32 = 1 << 3;
pub const INT_RXFLVL: u32 = 1 << 4;
pub const INT_HPRT: u32 = 1 << 24;
pub const INT_HC: u32 = 1 << 25;
pub const INT_DISC: u32 = 1 << 29;
pub const ALL_INTS: u32 = INT_SOF | INT_RXFLVL | INT_HPRT | INT_HC | INT_DISC;

// HPRT bits
pub const PCSTS: u32 = 1 << 0;
pub const PCDET: u32 = 1 << 1;
pub const PENA: u32 = 1 << 2;
pub const PENCHNG: u32 = 1 << 3;
pub const PSPD_FS: u32 = 1 << 17;
pub const PSPD_LS: u32 = 2 << 17;

// HCCHAR bits
pub const CHENA: u32 = 1 << 31;
pub const CHDIS: u32 = 1 << 30;

// HCINT bits
pub const XFRC: u32 = 1 << 0;
pub const CHH: u32 = 1 << 1;
pub const NAK: u32 = 1 << 4;

pub const fn hcchar(ch: usize) -> usize {
    0x500 + 0x20 * ch
}

pub const fn hcint(ch: usize) -> usize {
    hcchar(ch) + 0x08
}

pub const fn hcintmsk(ch: usize) -> usize {
    hcchar(ch) + 0x0C
}

pub const fn hctsiz(ch: usize) -> usize {
    hcchar(ch) + 0x10
}

pub const fn fifo(ch: usize) -> usize {
    0x1000 * (ch + 1)
}

// DMA stream 0 offsets
pub const S0CR: usize = 0x10;
pub const S0NDTR: usize = 0x14;
pub const S0PAR: usize = 0x18;
pub const S0M0AR: usize = 0x1C;

// RCC offsets
pub const AHB2RSTR: usize = 0x14;
pub const AHB2ENR: usize = 0x34;

pub struct NoopDelay;

impl DelayNs for NoopDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Delay source that also raises CHH on one channel, standing in for the
/// controller reporting the halt while the driver waits out the disable
/// handshake
pub struct HaltReportingDelay {
    pub hcint_addr: usize,
}

impl DelayNs for HaltReportingDelay {
    fn delay_ns(&mut self, _ns: u32) {
        unsafe {
            let reg = self.hcint_addr as *mut u32;
            write_volatile(reg, read_volatile(reg) | CHH);
        }
    }
}

fn leak_bank(words: usize) -> usize {
    let bank = vec![0u32; words].into_boxed_slice();
    Box::leak(bank).as_ptr() as usize
}

/// One mocked controller: OTG block with FIFO windows, DMA block, RCC block
pub struct MockController {
    pub otg_base: usize,
    pub dma_base: usize,
    pub rcc_base: usize,
}

impl MockController {
    pub fn new() -> Self {
        Self {
            // covers core + host + channel registers and all 8 FIFO windows
            otg_base: leak_bank(0x9000 / 4),
            dma_base: leak_bank(16),
            rcc_base: leak_bank(16),
        }
    }

    pub fn host(&self) -> UsbHost<NoopDelay> {
        self.host_with(NoopDelay)
    }

    pub fn host_with<D: DelayNs>(&self, delay: D) -> UsbHost<D> {
        unsafe { UsbHost::new(self.otg_base, self.dma_base, self.rcc_base, delay) }
    }

    pub fn write(&self, offset: usize, value: u32) {
        unsafe { write_volatile((self.otg_base + offset) as *mut u32, value) }
    }

    pub fn read(&self, offset: usize) -> u32 {
        unsafe { read_volatile((self.otg_base + offset) as *const u32) }
    }

    pub fn dma_read(&self, offset: usize) -> u32 {
        unsafe { read_volatile((self.dma_base + offset) as *const u32) }
    }

    pub fn rcc_read(&self, offset: usize) -> u32 {
        unsafe { read_volatile((self.rcc_base + offset) as *const u32) }
    }

    /// Raise an interrupt with the given top-level causes and service it
    pub fn interrupt<D: DelayNs>(&self, host: &mut UsbHost<D>, gintsts: u32) {
        self.write(GINTSTS, gintsts);
        host.on_interrupt();
    }

    /// Raise a channel interrupt: HCINT value on one channel
    pub fn channel_interrupt<D: DelayNs>(
        &self,
        host: &mut UsbHost<D>,
        ch: usize,
        hcint_value: u32,
    ) {
        self.write(hcint(ch), hcint_value);
        self.write(HAINT, 1 << ch);
        self.interrupt(host, INT_HC);
    }
}

/// Walk a host through debounced connect and port enable at full speed
pub fn connect_full_speed<D: DelayNs>(mock: &MockController, host: &mut UsbHost<D>) {
    mock.write(GINTMSK, ALL_INTS);
    mock.write(HAINTMSK, 0xFF);
    mock.write(HPRT, PCSTS | PCDET);
    mock.interrupt(host, INT_HPRT);
    for _ in 0..499 {
        assert_eq!(host.poll_connect_events(), None);
    }
    assert_eq!(
        host.poll_connect_events(),
        Some(stm32f2_usbh::PortEvent::Connected)
    );
    mock.write(HPRT, PCSTS | PENA | PENCHNG | PSPD_FS);
    mock.interrupt(host, INT_HPRT);
}
