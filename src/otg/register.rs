//! Volatile register access and bounded polling
//!
//! MMIO access goes through [`Register`], which pairs volatile reads/writes
//! with data barriers on the Cortex-M weakly-ordered memory model. All
//! bring-up and teardown waits share one bounded-poll primitive,
//! [`TickTimeout`], so every hardware-settle wait has the same budget and
//! failure behaviour.

use crate::error::{Result, UsbError};
use core::cell::UnsafeCell;
use core::ptr::{read_volatile, write_volatile};
use embedded_hal::delay::DelayNs;

#[inline(always)]
fn dmb() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::dmb();
}

#[inline(always)]
fn dsb() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::dsb();
}

/// Volatile MMIO register wrapper with proper memory ordering
#[repr(transparent)]
pub struct Register<T> {
    value: UnsafeCell<T>,
}

unsafe impl<T> Send for Register<T> where T: Send {}
unsafe impl<T> Sync for Register<T> where T: Sync {}

impl Register<u32> {
    /// Read the register
    #[inline(always)]
    pub fn read(&self) -> u32 {
        dmb();
        let value = unsafe { read_volatile(self.value.get()) };
        dmb();
        value
    }

    /// Write the register, ensuring the write completes before continuing
    #[inline(always)]
    pub fn write(&self, value: u32) {
        dmb();
        unsafe { write_volatile(self.value.get(), value) };
        dsb();
    }

    /// Read-modify-write with full barriers
    #[inline(always)]
    pub fn modify<F>(&self, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        dmb();
        let current = unsafe { read_volatile(self.value.get()) };
        dmb();
        let new_value = f(current);
        dmb();
        unsafe { write_volatile(self.value.get(), new_value) };
        dsb();
    }

    /// Set bits in the register
    #[inline(always)]
    pub fn set_bits(&self, mask: u32) {
        self.modify(|v| v | mask);
    }

    /// Clear bits in the register
    #[inline(always)]
    pub fn clear_bits(&self, mask: u32) {
        self.modify(|v| v & !mask);
    }
}

/// Tick budget for a bounded hardware wait (~100 ms: 1000 fast polls plus
/// 10 polls with a 10 ms delay each)
pub const POLL_BUDGET_TICKS: u32 = 1010;

/// Ticks at the tail of the budget that insert a coarse delay between polls
pub const POLL_LATE_THRESHOLD: u32 = 10;

/// Bounded register poll
///
/// Polls a condition once per tick up to a fixed budget. Ticks past the late
/// threshold insert a 10 ms platform delay, so an operation known to take
/// non-trivial time does not busy-spin. Exhausting the budget is a hard
/// failure, never a silent retry.
#[derive(Debug, Clone, Copy)]
pub struct TickTimeout {
    ticks: u32,
    late_threshold: u32,
}

impl TickTimeout {
    /// New timeout with the standard ~100 ms budget
    pub const fn new() -> Self {
        Self {
            ticks: POLL_BUDGET_TICKS,
            late_threshold: POLL_LATE_THRESHOLD,
        }
    }

    /// New timeout with an explicit tick budget and late-delay threshold
    pub const fn with_budget(ticks: u32, late_threshold: u32) -> Self {
        Self {
            ticks,
            late_threshold,
        }
    }

    /// Wait for a condition, failing with [`UsbError::HwTimeout`] once the
    /// budget is exhausted
    pub fn wait_for<D, F>(&self, delay: &mut D, mut condition: F) -> Result<()>
    where
        D: DelayNs,
        F: FnMut() -> bool,
    {
        let mut remaining = self.ticks;
        loop {
            if condition() {
                return Ok(());
            }
            if remaining == 0 {
                return Err(UsbError::HwTimeout);
            }
            if remaining <= self.late_threshold {
                delay.delay_ms(10);
            }
            remaining -= 1;
        }
    }
}

impl Default for TickTimeout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDelay;

    impl DelayNs for NoopDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn register_read_write_modify() {
        let reg: Register<u32> = Register {
            value: UnsafeCell::new(0),
        };
        reg.write(0xA5A5_0000);
        assert_eq!(reg.read(), 0xA5A5_0000);
        reg.set_bits(0x0F);
        assert_eq!(reg.read(), 0xA5A5_000F);
        reg.clear_bits(0xA000_0000);
        assert_eq!(reg.read(), 0x05A5_000F);
        reg.modify(|v| v << 4);
        assert_eq!(reg.read(), 0x5A50_00F0);
    }

    #[test]
    fn timeout_succeeds_when_condition_holds() {
        let mut delay = NoopDelay;
        let mut calls = 0;
        let result = TickTimeout::new().wait_for(&mut delay, || {
            calls += 1;
            calls >= 5
        });
        assert_eq!(result, Ok(()));
        assert_eq!(calls, 5);
    }

    #[test]
    fn timeout_fails_after_budget() {
        let mut delay = NoopDelay;
        let mut calls = 0u32;
        let result = TickTimeout::with_budget(20, 2).wait_for(&mut delay, || {
            calls += 1;
            false
        });
        assert_eq!(result, Err(UsbError::HwTimeout));
        // one initial poll plus one per budget tick
        assert_eq!(calls, 21);
    }
}
