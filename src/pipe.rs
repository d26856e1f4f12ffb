//! Endpoint to channel binding and the transaction encoder
//!
//! Each endpoint the client opens is bound one-to-one to a hardware channel.
//! A channel is free while its characteristics register reads zero, so the
//! register file itself is the allocation table. The transaction encoder
//! turns (token kind, toggle policy, buffer) into the HCTSIZ/HCINTMSK/HCCHAR
//! programming for one bus transaction and kicks the FIFO DMA for outbound
//! payloads.

use embedded_hal::delay::DelayNs;

use crate::error::{Result, UsbError};
use crate::host::UsbHost;
use crate::otg::{self, hctsiz, HcChar, HcInt, TickTimeout, MAX_CHANNELS};
use crate::urb::{PacketKind, TogglePolicy};

/// Opaque handle naming the channel an endpoint is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeHandle(pub(crate) u8);

impl PipeHandle {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// USB endpoint transfer type, as encoded in `bmAttributes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointType {
    /// Control endpoint
    Control,
    /// Isochronous endpoint
    Isochronous,
    /// Bulk endpoint
    Bulk,
    /// Interrupt endpoint
    Interrupt,
}

impl EndpointType {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }

    /// Scheduled per frame interval rather than on demand
    pub fn is_periodic(self) -> bool {
        matches!(self, Self::Isochronous | Self::Interrupt)
    }
}

/// The standard endpoint descriptor fields the channel programming needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    /// `bEndpointAddress`: endpoint number in bits [3:0], bit 7 set for IN
    pub address: u8,
    /// `bmAttributes`: transfer type in bits [1:0]
    pub attributes: u8,
    /// `wMaxPacketSize`
    pub max_packet_size: u16,
    /// `bInterval`
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Transfer type encoded in the attributes field
    pub fn transfer_type(&self) -> EndpointType {
        EndpointType::from_bits(self.attributes)
    }
}

/// PKTCNT and XFRSIZ for a transfer of `len` bytes in `max_packet` packets
///
/// A zero-length transfer still moves one (empty) packet. `max_packet` must
/// be non-zero for a non-empty transfer.
pub fn transfer_size(len: usize, max_packet: usize) -> (u32, u32) {
    if len == 0 {
        (1, 0)
    } else {
        ((len + max_packet - 1) as u32 / max_packet as u32, len as u32)
    }
}

impl<D: DelayNs> UsbHost<D> {
    /// Bind an endpoint to a free channel
    ///
    /// Programs the channel characteristics from the descriptor and the
    /// device address and speed. Periodic endpoints record their interval
    /// for the frame scheduler. Fails with [`UsbError::NoFreeChannel`] when
    /// every channel is bound and [`UsbError::InvalidEndpoint`] when the
    /// descriptor carries a zero `wMaxPacketSize`.
    pub fn add_endpoint(
        &mut self,
        dev_addr: u8,
        speed: crate::host::DeviceSpeed,
        descriptor: &EndpointDescriptor,
    ) -> Result<PipeHandle> {
        if descriptor.max_packet_size == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        let index = (0..MAX_CHANNELS)
            .find(|&i| self.channel_regs(i).hcchar.read() == 0)
            .ok_or(UsbError::NoFreeChannel)?;

        self.channel_regs(index)
            .hcchar
            .write(endpoint_hcchar(dev_addr, speed, descriptor));
        if descriptor.transfer_type().is_periodic() {
            self.channels[index].interval_max = descriptor.interval;
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("endpoint bound to channel {}", index);
        Ok(PipeHandle(index as u8))
    }

    /// Reprogram a bound endpoint in place
    ///
    /// The channel is halted first so a reconfiguration cannot race an
    /// in-flight transaction. A descriptor with a zero `wMaxPacketSize` is
    /// rejected before the channel is touched.
    pub fn configure_endpoint(
        &mut self,
        handle: PipeHandle,
        dev_addr: u8,
        speed: crate::host::DeviceSpeed,
        descriptor: &EndpointDescriptor,
    ) -> Result<()> {
        let index = self.check_handle(handle)?;
        if descriptor.max_packet_size == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        self.disable_channel(index)?;

        self.channel_regs(index)
            .hcchar
            .write(endpoint_hcchar(dev_addr, speed, descriptor));
        if descriptor.transfer_type().is_periodic() {
            self.channels[index].interval_max = descriptor.interval;
        }
        Ok(())
    }

    /// Release a channel
    ///
    /// Cancels any URB the channel still owns, then zeroes its registers and
    /// software counters so the channel reads as free again.
    pub fn remove_endpoint(&mut self, handle: PipeHandle) -> Result<()> {
        let index = self.check_handle(handle)?;
        self.cancel_channel(index);

        let regs = self.channel_regs(index);
        regs.hcchar.write(0);
        regs.hcint.write(0);
        regs.hcintmsk.write(0);
        regs.hctsiz.write(0);

        self.channels[index].interval = 0;
        self.channels[index].interval_max = 0;
        Ok(())
    }

    /// Halt a channel, waiting for the hardware to confirm
    ///
    /// An in-flight outbound FIFO load is stopped first so the disable does
    /// not race the DMA stream. Known silicon limitation: a channel that was
    /// enabled with no packet queue credit can fail to report the halt, in
    /// which case this returns [`UsbError::HwTimeout`].
    pub(crate) fn disable_channel(&mut self, index: usize) -> Result<()> {
        let regs = self.channel_regs(index);

        regs.hcintmsk.write(0);
        self.delay.delay_ms(2);

        let hcchar = regs.hcchar.read();
        if hcchar & HcChar::CHENA.bits() != 0 {
            if hcchar & HcChar::EPDIR.bits() == 0 && regs.hctsiz.read() != 0 {
                self.dma.stop(&mut self.delay)?;
            }
            regs.hcint.write(!HcInt::CHH.bits());
            regs.hcchar.write(regs.hcchar.read() | HcChar::CHENA.bits());
            self.delay.delay_ms(2);
            regs.hcchar
                .write((regs.hcchar.read() & !HcChar::CHENA.bits()) | HcChar::CHDIS.bits());

            let both = HcChar::CHENA.bits() | HcChar::CHDIS.bits();
            TickTimeout::new().wait_for(&mut self.delay, || {
                regs.hcint.read() & HcInt::CHH.bits() != 0
                    || regs.hcchar.read() & both == both
            })?;
        }
        Ok(())
    }

    /// Program and enable one bus transaction on a channel
    ///
    /// Keeps the endpoint's static characteristics, selects direction and
    /// interrupt causes from the token kind, encodes the packet count and
    /// data toggle, and enables the channel. OUT and SETUP payloads are
    /// handed to the DMA stream after the channel is armed; a still-running
    /// previous load is drained first.
    pub(crate) fn enqueue_transaction(
        &mut self,
        index: usize,
        packet: PacketKind,
        toggle: TogglePolicy,
        buf: *mut u8,
        len: usize,
    ) -> Result<()> {
        if !self.port.connected {
            return Err(UsbError::NotConnected);
        }
        let regs = self.channel_regs(index);
        let current = regs.hcchar.read();
        if current == 0 {
            return Err(UsbError::InvalidChannel);
        }

        let mut hcchar = current & HcChar::STATIC_FIELDS;
        let hcintmsk = match packet {
            PacketKind::In => {
                hcchar |= HcChar::EPDIR.bits();
                HcInt::IN_MASK
            }
            PacketKind::Out => HcInt::OUT_MASK,
            PacketKind::Setup => HcInt::SETUP_MASK,
            PacketKind::Ping => HcInt::PING_MASK,
        };
        hcchar |= HcChar::CHENA.bits();

        let mut size = regs.hctsiz.read() & hctsiz::DPID_MASK;
        if packet == PacketKind::Setup {
            size = (size & !hctsiz::DPID_MASK) | hctsiz::DPID_MDATA;
        } else {
            match toggle {
                TogglePolicy::Keep => {}
                TogglePolicy::Data0 => {
                    size = (size & !hctsiz::DPID_MASK) | hctsiz::DPID_DATA0;
                }
                TogglePolicy::Data1 => {
                    size = (size & !hctsiz::DPID_MASK) | hctsiz::DPID_DATA1;
                }
            }
        }
        if packet == PacketKind::Ping {
            size |= hctsiz::DOPING;
        }

        let max_packet = (hcchar & HcChar::MPSIZ_MASK.bits()) as usize;
        let (pktcnt, xfrsiz) = transfer_size(len, max_packet);
        size |= (pktcnt << hctsiz::PKTCNT_SHIFT) | (xfrsiz & hctsiz::XFRSIZ_MASK);

        regs.hcintmsk.write(hcintmsk.bits());
        regs.hctsiz.write(size);

        let load_data = matches!(packet, PacketKind::Out | PacketKind::Setup) && len > 0;
        if load_data {
            // A previous load that never drained is forcibly stopped inside
            // wait(), so the enqueue proceeds either way.
            let _ = self.dma.wait(&mut self.delay);
        }

        regs.hcchar.write(hcchar);

        if load_data {
            self.dma
                .start(otg::fifo_ptr(self.otg_base, index), buf as *const u8, len);
        }
        Ok(())
    }
}

// Channel characteristics for an endpoint: packet size, endpoint number and
// direction, device speed and address, transfer type, one transaction per
// frame for periodic types.
fn endpoint_hcchar(
    dev_addr: u8,
    speed: crate::host::DeviceSpeed,
    descriptor: &EndpointDescriptor,
) -> u32 {
    let mut hcchar = (descriptor.max_packet_size as u32 & 0x7FF)
        | ((descriptor.address as u32 & 0x0F) << 11)
        | (((descriptor.address as u32 >> 7) & 1) << 15)
        | (((speed == crate::host::DeviceSpeed::Low) as u32) << 17)
        | ((descriptor.attributes as u32 & 0b11) << HcChar::EPTYP_SHIFT)
        | ((dev_addr as u32 & 0x7F) << 22);
    if descriptor.transfer_type().is_periodic() {
        hcchar |= HcChar::MCNT_1.bits();
    }
    hcchar
}
