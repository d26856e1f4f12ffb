//! USB host controller core
//!
//! [`UsbHost`] owns the OTG_FS controller, the shared TX FIFO DMA stream and
//! the per-channel bookkeeping. Bring-up and teardown, port power and reset,
//! connect debouncing and the URB submit/cancel surface live here; channel
//! allocation is in [`pipe`](crate::pipe) and the interrupt state machine in
//! [`irq`](crate::irq).

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::delay::DelayNs;

use crate::dma::{TxFifoDma, DMA2_BASE};
use crate::error::{Result, UsbError};
use crate::otg::{
    self, ChannelRegisters, CoreRegisters, GahbCfg, GccFg, GintSts, GrstCtl, GusbCfg, Hcfg,
    HostRegisters, Hprt, TickTimeout, MAX_CHANNELS, OTG_FS_BASE,
};
use crate::pipe::{EndpointType, PipeHandle};
use crate::rcc::{self, RccRegisters, AHB1ENR_DMA2EN, AHB2_OTGFS, RCC_BASE};
use crate::urb::{Urb, UsbResponse, BULK_NAK_RETRIES, CTRL_NAK_RETRIES};

/// Connect debounce window in polling ticks (~500 ms at one tick per ms)
pub const DEBOUNCE_TICKS: u16 = 500;

/// Receive FIFO depth in words: 512 bytes of data, one interrupt endpoint
/// packet, packet info and status
const RX_FIFO_WORDS: u32 = 512 / 4 + 2 + 4;

/// Non-periodic TX FIFO depth in words
const NPTX_FIFO_WORDS: u32 = 512 / 4;

/// Periodic TX FIFO depth in words
const PTX_FIFO_WORDS: u32 = 16;

/// Interrupt sources the driver unmasks in GINTMSK
const CORE_INT_MASK: u32 = GintSts::DISCINT.bits()
    | GintSts::HCINT.bits()
    | GintSts::HPRTINT.bits()
    | GintSts::RXFLVL.bits()
    | GintSts::SOF.bits();

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceSpeed {
    /// Low speed, 1.5 Mbit/s
    Low,
    /// Full speed, 12 Mbit/s
    Full,
    /// High speed, 480 Mbit/s
    High,
}

/// Root port event reported by [`UsbHost::poll_connect_events`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortEvent {
    /// A device connection survived the debounce window
    Connected,
    /// The device was disconnected
    Disconnected,
}

/// Fixed capabilities of this host controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostCapabilities {
    /// Controller splits a transfer into multiple packets in hardware
    pub multi_packet: bool,
    /// Largest single transfer in bytes
    pub max_data_size: u16,
    /// Suggested NAK retry budget for control transfers
    pub ctrl_nak_limit: u32,
    /// Suggested NAK retry budget for bulk transfers
    pub bulk_nak_limit: u32,
}

/// Root port state tracked in software
pub(crate) struct PortState {
    /// Debounced connect state
    pub connected: bool,
    /// Disconnect seen by the interrupt handler, not yet reported
    pub disconnect_pending: bool,
    /// Remaining debounce ticks, 0 when idle
    pub debounce: u16,
    /// Speed latched when the port was enabled
    pub speed: DeviceSpeed,
}

impl PortState {
    const fn new() -> Self {
        Self {
            connected: false,
            disconnect_pending: false,
            debounce: 0,
            speed: DeviceSpeed::Full,
        }
    }
}

/// Per-channel software state
#[derive(Clone, Copy)]
pub(crate) struct ChannelState {
    /// URB currently owned by this channel
    pub urb: Option<NonNull<Urb>>,
    /// Frames until the next periodic transaction may start, 0 = due
    pub interval: u16,
    /// bInterval of the endpoint bound to this channel
    pub interval_max: u8,
}

impl ChannelState {
    const fn new() -> Self {
        Self {
            urb: None,
            interval: 0,
            interval_max: 0,
        }
    }
}

/// USB OTG_FS host controller driver
///
/// Owns the controller, DMA stream 0 of the mapped DMA block and the RCC
/// bits for both. The client wires [`UsbHost::on_interrupt`] into the OTG
/// interrupt vector and enables it in the NVIC after [`UsbHost::init`].
pub struct UsbHost<D> {
    pub(crate) otg_base: usize,
    pub(crate) rcc_base: usize,
    pub(crate) dma: TxFifoDma,
    pub(crate) delay: D,
    pub(crate) channels: [ChannelState; MAX_CHANNELS],
    pub(crate) port: PortState,
    pub(crate) hw_accessing: AtomicBool,
}

// The raw URB pointers in the channel table are only dereferenced while the
// host is borrowed, so the host moves between contexts as a unit.
unsafe impl<D: Send> Send for UsbHost<D> {}

impl<D: DelayNs> UsbHost<D> {
    /// Driver over the controller at `otg_base` with its DMA and RCC blocks
    ///
    /// # Safety
    ///
    /// The three base addresses must point to register blocks with the
    /// expected layout, and the caller must hand over exclusive access to
    /// the OTG controller, DMA stream 0 and the OTG/DMA RCC bits.
    pub unsafe fn new(otg_base: usize, dma_base: usize, rcc_base: usize, delay: D) -> Self {
        Self {
            otg_base,
            rcc_base,
            dma: unsafe { TxFifoDma::new(dma_base) },
            delay,
            channels: [ChannelState::new(); MAX_CHANNELS],
            port: PortState::new(),
            hw_accessing: AtomicBool::new(false),
        }
    }

    /// Driver over the OTG_FS controller at its standard addresses
    ///
    /// # Safety
    ///
    /// Same contract as [`UsbHost::new`].
    pub unsafe fn otg_fs(delay: D) -> Self {
        unsafe { Self::new(OTG_FS_BASE, DMA2_BASE, RCC_BASE, delay) }
    }

    /// Fixed capabilities of the controller
    pub const fn capabilities() -> HostCapabilities {
        HostCapabilities {
            multi_packet: true,
            max_data_size: 512,
            ctrl_nak_limit: CTRL_NAK_RETRIES,
            bulk_nak_limit: BULK_NAK_RETRIES,
        }
    }

    pub(crate) fn core_regs(&self) -> &'static CoreRegisters {
        unsafe { otg::core_regs(self.otg_base) }
    }

    pub(crate) fn host_regs(&self) -> &'static HostRegisters {
        unsafe { otg::host_regs(self.otg_base) }
    }

    pub(crate) fn channel_regs(&self, index: usize) -> &'static ChannelRegisters {
        unsafe { otg::channel_regs(self.otg_base, index) }
    }

    fn rcc_regs(&self) -> &'static RccRegisters {
        unsafe { rcc::rcc_regs(self.rcc_base) }
    }

    /// Write HPRT without acknowledging interrupt latches
    ///
    /// Several HPRT bits are write-1-to-clear, so a plain read-modify-write
    /// would acknowledge pending port interrupts as a side effect.
    pub(crate) fn hprt_set(&self, bits: u32) {
        let host = self.host_regs();
        let value = host.hprt.read() & !Hprt::W1C_MASK;
        host.hprt.write(value | bits);
    }

    /// Clear HPRT control bits, see [`UsbHost::hprt_set`]
    pub(crate) fn hprt_clear(&self, bits: u32) {
        let host = self.host_regs();
        let value = host.hprt.read() & !Hprt::W1C_MASK;
        host.hprt.write(value & !bits);
    }

    /// Bring the controller up in host mode
    ///
    /// Cycles the peripheral clock and reset, soft-resets the core, sizes
    /// the FIFOs and unmasks the interrupt sources the driver handles. The
    /// caller still has to route and enable the OTG interrupt in the NVIC.
    pub fn init(&mut self) -> Result<()> {
        let core = self.core_regs();
        let host = self.host_regs();
        let rcc = self.rcc_regs();

        rcc.ahb2enr.set_bits(AHB2_OTGFS);
        self.delay.delay_ms(10);
        rcc.ahb2rstr.set_bits(AHB2_OTGFS);
        self.delay.delay_ms(10);
        rcc.ahb2rstr.clear_bits(AHB2_OTGFS);
        self.delay.delay_ms(40);

        core.gusbcfg.set_bits(GusbCfg::PHYSEL.bits());
        self.delay.delay_ms(20);

        let soft_reset = TickTimeout::with_budget(1100, 100);
        soft_reset.wait_for(&mut self.delay, || {
            core.grstctl.read() & GrstCtl::AHBIDL.bits() != 0
        })?;
        core.grstctl.set_bits(GrstCtl::CSRST.bits());
        soft_reset.wait_for(&mut self.delay, || {
            core.grstctl.read() & GrstCtl::CSRST.bits() == 0
        })?;
        self.delay.delay_ms(3);

        core.gahbcfg.clear_bits(GahbCfg::GINT.bits());
        core.gccfg
            .set_bits(GccFg::SOFOUTEN.bits() | GccFg::PWRDWN.bits());

        rcc.ahb1enr.set_bits(AHB1ENR_DMA2EN);

        core.gusbcfg.clear_bits(GusbCfg::TRDT_MASK.bits());
        core.gusbcfg
            .set_bits(GusbCfg::FHMOD.bits() | GusbCfg::trdt(5));
        self.delay.delay_ms(100);

        core.grxfsiz.write(RX_FIFO_WORDS);
        core.hnptxfsiz
            .write((NPTX_FIFO_WORDS << 16) | RX_FIFO_WORDS);
        core.hptxfsiz
            .write((PTX_FIFO_WORDS << 16) | (RX_FIFO_WORDS + NPTX_FIFO_WORDS));

        core.gintmsk.set_bits(CORE_INT_MASK);
        if host.hcfg.read() & Hcfg::FSLSPCS_MASK.bits() == 0 {
            host.hcfg.write(Hcfg::fslspcs(1) | Hcfg::FSLSS.bits());
        }
        host.haintmsk.write(0xFF);
        core.gahbcfg.set_bits(GahbCfg::GINT.bits());

        self.port = PortState::new();
        for state in self.channels.iter_mut() {
            *state = ChannelState::new();
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("host controller initialized");
        Ok(())
    }

    /// Shut the controller down and restore reset defaults
    pub fn deinit(&mut self) -> Result<()> {
        let core = self.core_regs();
        let host = self.host_regs();
        let rcc = self.rcc_regs();

        core.gahbcfg.clear_bits(GahbCfg::GINT.bits());
        host.haintmsk.write(0);

        rcc.ahb2rstr.set_bits(AHB2_OTGFS);
        self.delay.delay_ms(10);
        rcc.ahb2rstr.clear_bits(AHB2_OTGFS);
        self.delay.delay_ms(10);
        rcc.ahb2enr.clear_bits(AHB2_OTGFS);
        self.delay.delay_ms(40);

        host.hprt.write(0);
        host.hcfg.write(0);
        core.gintmsk.clear_bits(CORE_INT_MASK);
        core.gusbcfg.clear_bits(
            GusbCfg::FHMOD.bits() | GusbCfg::TRDT_MASK.bits() | GusbCfg::PHYSEL.bits(),
        );
        core.gusbcfg.set_bits(GusbCfg::trdt(2));
        self.delay.delay_ms(100);

        self.port = PortState::new();
        for state in self.channels.iter_mut() {
            *state = ChannelState::new();
        }
        Ok(())
    }

    /// Drive root port VBUS via the controller's port power bit
    pub fn port_power(&mut self, on: bool) {
        if on {
            self.hprt_set(Hprt::PPWR.bits());
        } else {
            self.hprt_clear(Hprt::PPWR.bits());
        }
    }

    /// Debounced connect state of the root port
    pub fn is_connected(&self) -> bool {
        self.port.connected
    }

    /// Speed latched when the port was last enabled
    pub fn port_speed(&self) -> DeviceSpeed {
        self.port.speed
    }

    /// Advance the connect/disconnect state machine by one tick
    ///
    /// Call this periodically (roughly once per millisecond while a
    /// debounce window is open). Disconnects are reported immediately; a
    /// connect is reported once, after the attach state has held for the
    /// full [`DEBOUNCE_TICKS`] window.
    pub fn poll_connect_events(&mut self) -> Option<PortEvent> {
        let raw = self.host_regs().hprt.read() & Hprt::PCSTS.bits() != 0;

        if self.port.disconnect_pending || (!raw && self.port.connected) {
            self.port.disconnect_pending = false;
            #[cfg(feature = "defmt")]
            defmt::info!("port disconnected");
            return Some(PortEvent::Disconnected);
        }

        if self.port.debounce > 0 {
            self.port.debounce -= 1;
            if self.port.debounce == 0 {
                if raw && !self.port.connected {
                    self.port.connected = true;
                    #[cfg(feature = "defmt")]
                    defmt::info!("port connected");
                    return Some(PortEvent::Connected);
                }
            } else {
                self.delay.delay_ms(1);
            }
        } else if raw && !self.port.connected {
            self.port.debounce = DEBOUNCE_TICKS;
        }

        None
    }

    /// Reset the root port and wait for it to come back enabled
    ///
    /// Reprograms the frame interval and PHY clock for the speed the port
    /// negotiated, then drives a 17 ms reset pulse. Fails with
    /// [`UsbError::NotConnected`] when no device is attached and
    /// [`UsbError::HwTimeout`] when the port never re-enables.
    pub fn reset_port(&mut self) -> Result<()> {
        if !self.port.connected {
            return Err(UsbError::NotConnected);
        }
        let host = self.host_regs();
        let hcfg = host.hcfg.read();
        let hprt = host.hprt.read();

        match (hprt >> Hprt::PSPD_SHIFT) & 0b11 {
            0 | 1 => {
                // High or full speed, 48 MHz PHY clock
                host.hfir.write(48_000);
                if hcfg & Hcfg::FSLSPCS_MASK.bits() != 1 {
                    host.hcfg
                        .write((hcfg & !Hcfg::FSLSPCS_MASK.bits()) | Hcfg::fslspcs(1));
                }
            }
            2 => {
                // Low speed, 6 MHz PHY clock
                host.hfir.write(6_000);
                if hcfg & Hcfg::FSLSPCS_MASK.bits() != 2 {
                    host.hcfg
                        .write((hcfg & !Hcfg::FSLSPCS_MASK.bits()) | Hcfg::fslspcs(2));
                }
            }
            _ => {}
        }

        self.hprt_set(Hprt::PRST.bits());
        self.delay.delay_ms(17);
        self.hprt_clear(Hprt::PRST.bits());

        TickTimeout::new().wait_for(&mut self.delay, || {
            host.hprt.read() & Hprt::PENA.bits() != 0
        })?;
        self.delay.delay_ms(20);

        #[cfg(feature = "defmt")]
        defmt::debug!("port reset complete");
        Ok(())
    }

    /// Validate a handle, returning the channel index it names
    pub(crate) fn check_handle(&self, handle: PipeHandle) -> Result<usize> {
        let index = handle.index();
        if index >= MAX_CHANNELS || self.channel_regs(index).hcchar.read() == 0 {
            return Err(UsbError::InvalidHandle);
        }
        Ok(index)
    }

    /// Endpoint type programmed into a channel's characteristics register
    pub(crate) fn channel_ep_type(&self, index: usize) -> EndpointType {
        let eptyp = (self.channel_regs(index).hcchar.read() >> otg::HcChar::EPTYP_SHIFT) & 0b11;
        EndpointType::from_bits(eptyp as u8)
    }

    /// Queue a URB on the endpoint's channel
    ///
    /// Control and bulk URBs on a full/high-speed bus start immediately;
    /// everything else starts from the frame scheduler inside
    /// [`UsbHost::on_interrupt`]. Periodic URBs are due after the endpoint
    /// interval, scaled by bus speed, or on the next frame when the
    /// endpoint's previous response was not a NAK.
    ///
    /// # Safety
    ///
    /// The driver keeps a pointer to `urb` until it sets `completed` or
    /// `cancelled`, so the block must not move or be dropped before then.
    pub unsafe fn submit(&mut self, handle: PipeHandle, urb: &mut Urb) -> Result<()> {
        let index = self.check_handle(handle)?;
        if !self.port.connected {
            return Err(UsbError::NotConnected);
        }
        if urb.submitted || urb.in_progress {
            return Err(UsbError::AlreadySubmitted);
        }
        if self.channels[index].urb.is_some() {
            return Err(UsbError::ChannelBusy);
        }

        let previous_response = urb.response;
        urb.prepare_for_submit();
        self.channels[index].urb = NonNull::new(urb as *mut Urb);

        #[cfg(feature = "defmt")]
        defmt::trace!("submit ch={} len={}", index, urb.len);

        if self.channel_ep_type(index).is_periodic() {
            // A NAKing endpoint is re-polled at its descriptor interval;
            // otherwise the next frame is soon enough.
            self.channels[index].interval = if previous_response == UsbResponse::Nak {
                match self.port.speed {
                    DeviceSpeed::High => {
                        let exponent = self.channels[index].interval_max & 0x0F;
                        1 << if exponent == 0 { 1 } else { exponent }
                    }
                    DeviceSpeed::Full | DeviceSpeed::Low => {
                        let frames = self.channels[index].interval_max as u16;
                        if frames == 0 {
                            1
                        } else {
                            frames
                        }
                    }
                }
            } else {
                1
            };
            urb.submitted = true;
        } else if self.port.speed != DeviceSpeed::Low {
            self.hw_accessing.store(true, Ordering::SeqCst);
            urb.submitted = true;
            urb.in_progress = true;
            let started =
                self.enqueue_transaction(index, urb.packet, urb.toggle, urb.buf, urb.len);
            self.hw_accessing.store(false, Ordering::SeqCst);
            started?;
        } else {
            // Low-speed control/bulk waits for the frame scheduler
            urb.submitted = true;
        }
        Ok(())
    }

    /// Cancel a URB
    ///
    /// Safe to call on a URB that already completed or was never submitted;
    /// the channel's claim on it is released either way. An in-progress
    /// transaction is stopped with the channel disable sequence first. When
    /// the hardware never confirms the halt this returns
    /// [`UsbError::HwTimeout`], but the URB is still cancelled and the
    /// channel slot still freed.
    pub fn cancel(&mut self, handle: PipeHandle, urb: &mut Urb) -> Result<()> {
        let index = self.check_handle(handle)?;
        let owns_slot = self.channels[index]
            .urb
            .is_some_and(|ptr| core::ptr::eq(ptr.as_ptr(), urb));

        if !urb.submitted {
            if owns_slot {
                self.channels[index].urb = None;
            }
            return Ok(());
        }

        urb.submitted = false;
        let halted = if urb.in_progress {
            urb.in_progress = false;
            self.disable_channel(index)
        } else {
            Ok(())
        };
        self.channels[index].interval = 0;
        if owns_slot {
            self.channels[index].urb = None;
        }
        urb.cancelled = true;
        halted
    }

    /// Cancel whatever URB a channel currently owns, from driver context
    ///
    /// Used by the disconnect sweep and endpoint removal; disable failures
    /// are swallowed because the caller is already tearing the channel down.
    pub(crate) fn cancel_channel(&mut self, index: usize) {
        if let Some(mut ptr) = self.channels[index].urb.take() {
            let urb = unsafe { ptr.as_mut() };
            if urb.submitted {
                urb.submitted = false;
                if urb.in_progress {
                    let _ = self.disable_channel(index);
                    urb.in_progress = false;
                }
                urb.cancelled = true;
            }
        }
        self.channels[index].interval = 0;
    }
}
