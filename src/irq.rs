//! Interrupt service path
//!
//! The entire transfer protocol runs from [`UsbHost::on_interrupt`]: frame
//! timeout accounting, port change handling, the disconnect sweep, receive
//! FIFO draining, per-channel response dispatch and the frame-tick transfer
//! scheduler. The client's interrupt vector calls this once per OTG
//! interrupt; nothing here blocks beyond the channel halt handshake.

use core::ptr::read_volatile;

use embedded_hal::delay::DelayNs;

use crate::host::{DeviceSpeed, UsbHost, DEBOUNCE_TICKS};
use crate::otg::{self, grxsts, hctsiz, GintSts, HcChar, HcInt, Hprt, MAX_CHANNELS};
use crate::urb::{TransferError, Urb, UsbResponse, MAX_TIMEOUT_FRAMES};

impl<D: DelayNs> UsbHost<D> {
    /// Service one OTG interrupt
    pub fn on_interrupt(&mut self) {
        let core = self.core_regs();
        let host = self.host_regs();

        let gintsts = core.gintsts.read() & core.gintmsk.read();
        let hprt = host.hprt.read();
        let haint = host.haint.read();

        if gintsts & GintSts::SOF.bits() != 0 {
            self.decrement_frame_timeouts();
        }

        if gintsts & GintSts::HPRTINT.bits() != 0 {
            self.service_port_change(hprt);
        }
        if gintsts & GintSts::DISCINT.bits() != 0 && self.port.connected {
            self.port.disconnect_pending = true;
            self.port.connected = false;
        }

        if self.port.disconnect_pending {
            for channel in 0..MAX_CHANNELS {
                self.cancel_channel(channel);
            }
        }

        if gintsts & GintSts::RXFLVL.bits() != 0 {
            self.drain_rx_fifo();
        }

        if gintsts & GintSts::HCINT.bits() != 0 {
            for channel in 0..MAX_CHANNELS {
                if haint & (1 << channel) != 0 {
                    self.service_channel(channel);
                }
            }
            host.haint.write(haint);
        }

        core.gintsts.write(gintsts);

        if gintsts & GintSts::SOF.bits() != 0 {
            self.schedule_frame();
        }
    }

    /// Count down per-URB frame budgets, raising `timeout` on expiry
    fn decrement_frame_timeouts(&mut self) {
        for channel in 0..MAX_CHANNELS {
            if let Some(mut ptr) = self.channels[channel].urb {
                let urb = unsafe { ptr.as_mut() };
                if urb.timeout_frames > 0 {
                    urb.timeout_frames -= 1;
                    if urb.timeout_frames == 0 {
                        urb.timeout = true;
                    }
                }
            }
        }
    }

    /// Latch connect/enable/disconnect changes from a port interrupt
    fn service_port_change(&mut self, hprt: u32) {
        if hprt & Hprt::PCDET.bits() != 0 && !self.port.connected {
            self.port.debounce = DEBOUNCE_TICKS;
        }
        if hprt & Hprt::PENCHNG.bits() != 0 {
            if hprt & Hprt::PENA.bits() != 0 {
                self.port.speed = match (hprt >> Hprt::PSPD_SHIFT) & 0b11 {
                    0 => DeviceSpeed::High,
                    1 => DeviceSpeed::Full,
                    2 => DeviceSpeed::Low,
                    _ => self.port.speed,
                };
            }
            if hprt & Hprt::PCSTS.bits() == 0 && self.port.connected {
                self.port.disconnect_pending = true;
                self.port.connected = false;
            }
        }
        // Writing PENA back would disable the port, everything else is
        // acknowledged by the write
        self.host_regs().hprt.write(hprt & !Hprt::PENA.bits());
    }

    /// Copy one received packet out of the shared receive FIFO
    ///
    /// The controller raises RXFLVL once per pending status entry, so one
    /// entry is popped per interrupt with the source masked while the copy
    /// runs. Non-data entries (transfer complete, halted, toggle error) are
    /// popped and dropped; the channel interrupt carries their meaning.
    fn drain_rx_fifo(&mut self) {
        let core = self.core_regs();
        core.gintmsk.clear_bits(GintSts::RXFLVL.bits());

        let status = core.grxstsr.read();
        let channel = grxsts::channel(status);
        if grxsts::packet_status(status) == grxsts::PKTSTS_IN_DATA && channel < MAX_CHANNELS {
            let status = core.grxstsp.read();
            let byte_count = grxsts::byte_count(status);
            let fifo = otg::fifo_ptr(self.otg_base, channel);

            if let Some(mut ptr) = self.channels[channel].urb {
                let urb = unsafe { ptr.as_mut() };
                let mut dst = unsafe { urb.buf.add(urb.transferred) };
                for _ in 0..byte_count / 4 {
                    let word = unsafe { read_volatile(fifo) };
                    unsafe {
                        core::ptr::copy_nonoverlapping(word.to_le_bytes().as_ptr(), dst, 4);
                        dst = dst.add(4);
                    }
                    urb.transferred += 4;
                }
                let tail = byte_count & 3;
                if tail > 0 {
                    let word = unsafe { read_volatile(fifo) };
                    let bytes = word.to_le_bytes();
                    unsafe {
                        core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, tail);
                    }
                    urb.transferred += tail;
                }
            }
        } else {
            let _ = core.grxstsp.read();
        }

        core.gintmsk.set_bits(GintSts::RXFLVL.bits());
    }

    /// Dispatch one channel's interrupt causes against its URB
    fn service_channel(&mut self, channel: usize) {
        let regs = self.channel_regs(channel);
        let hcint = regs.hcint.read() & regs.hcintmsk.read();

        if let Some(mut ptr) = self.channels[channel].urb {
            let urb = unsafe { ptr.as_mut() };
            urb.error |= TransferError::from_hcint(hcint);
            match urb.packet {
                crate::urb::PacketKind::Out | crate::urb::PacketKind::Setup => {
                    self.service_outbound(channel, hcint, urb)
                }
                crate::urb::PacketKind::Ping => self.service_ping(channel, hcint, urb),
                crate::urb::PacketKind::In => self.service_inbound(channel, hcint, urb),
            }
        }
        regs.hcint.write(HcInt::ALL);
    }

    /// Clear the channel claim and mark the URB finished
    fn finalize(&mut self, channel: usize, urb: &mut Urb) {
        self.channel_regs(channel).hcintmsk.write(0);
        self.channels[channel].urb = None;
        urb.finalize();
        #[cfg(feature = "defmt")]
        defmt::trace!("urb complete ch={} transferred={}", channel, urb.transferred);
    }

    /// Restart a NAKed non-periodic transfer from where it stopped
    fn retry_from_progress(&mut self, channel: usize, urb: &mut Urb) {
        let buf = unsafe { urb.buf.add(urb.transferred) };
        let len = urb.len - urb.transferred;
        let _ = self.enqueue_transaction(channel, urb.packet, urb.toggle, buf, len);
        urb.timeout_frames = MAX_TIMEOUT_FRAMES;
    }

    /// Bytes already accepted by the device, from the remaining packet count
    fn outbound_progress(&self, channel: usize, len: usize) -> usize {
        let regs = self.channel_regs(channel);
        let remaining =
            ((regs.hctsiz.read() & hctsiz::PKTCNT_MASK) >> hctsiz::PKTCNT_SHIFT) as usize;
        let max_packet = (regs.hcchar.read() & HcChar::MPSIZ_MASK.bits()) as usize;
        ((len + max_packet - 1) / max_packet - remaining) * max_packet
    }

    /// OUT and SETUP responses
    fn service_outbound(&mut self, channel: usize, hcint: u32, urb: &mut Urb) {
        let regs = self.channel_regs(channel);
        if hcint & HcInt::XFRC.bits() != 0 {
            // All packets accepted; the channel disabled itself
            let _ = self.dma.stop(&mut self.delay);
            urb.transferred = urb.len;
            urb.response = if hcint & HcInt::NYET.bits() != 0 {
                UsbResponse::Nyet
            } else {
                UsbResponse::Ack
            };
            self.finalize(channel, urb);
        } else if hcint & HcInt::STALL.bits() != 0 {
            let _ = self.dma.stop(&mut self.delay);
            urb.response = UsbResponse::Stall;
            regs.hcintmsk.write(HcInt::CHH.bits());
            regs.hcchar.set_bits(HcChar::CHDIS.bits());
        } else if hcint & (HcInt::NAK.bits() | HcInt::NYET.bits() | HcInt::TXERR.bits()) != 0 {
            let _ = self.dma.stop(&mut self.delay);
            if hcint & HcInt::NAK.bits() != 0 {
                urb.response = UsbResponse::Nak;
                regs.hcintmsk.write(HcInt::CHH.bits());
            } else if hcint & HcInt::NYET.bits() != 0 {
                urb.response = UsbResponse::Nyet;
                regs.hcintmsk.write(HcInt::CHH.bits());
            } else {
                urb.error = TransferError::TRANSACTION;
                regs.hcintmsk.write(HcInt::ACK.bits() | HcInt::CHH.bits());
            }
            if urb.len > 0 {
                urb.transferred = self.outbound_progress(channel, urb.len);
            }
            regs.hcchar
                .set_bits(HcChar::CHENA.bits() | HcChar::CHDIS.bits());
        } else if hcint & HcInt::CHH.bits() != 0 {
            if !self.channel_ep_type(channel).is_periodic()
                && urb.response == UsbResponse::Nak
                && urb.nak_retries > 0
            {
                urb.nak_retries -= 1;
                self.retry_from_progress(channel, urb);
            } else {
                self.finalize(channel, urb);
            }
        } else if hcint & HcInt::ACK.bits() != 0 {
            urb.response = UsbResponse::Ack;
            urb.error = TransferError::empty();
            regs.hcintmsk.clear_bits(HcInt::ACK.bits());
        }
    }

    /// PING responses
    fn service_ping(&mut self, channel: usize, hcint: u32, urb: &mut Urb) {
        let regs = self.channel_regs(channel);
        if hcint & HcInt::STALL.bits() != 0 {
            urb.response = UsbResponse::Stall;
            regs.hcintmsk.write(HcInt::CHH.bits());
            regs.hcchar.set_bits(HcChar::CHDIS.bits());
        } else if hcint & (HcInt::NAK.bits() | HcInt::TXERR.bits()) != 0 {
            if hcint & HcInt::NAK.bits() != 0 {
                urb.response = UsbResponse::Nak;
                regs.hcintmsk.write(HcInt::CHH.bits());
            } else {
                urb.error = TransferError::TRANSACTION;
                regs.hcintmsk.write(HcInt::ACK.bits() | HcInt::CHH.bits());
            }
            regs.hcchar.set_bits(HcChar::CHDIS.bits());
        } else if hcint & HcInt::CHH.bits() != 0 {
            if !self.channel_ep_type(channel).is_periodic()
                && urb.response == UsbResponse::Nak
                && urb.nak_retries > 0
            {
                urb.nak_retries -= 1;
                self.retry_from_progress(channel, urb);
            } else {
                self.finalize(channel, urb);
            }
        } else if hcint & HcInt::ACK.bits() != 0 {
            urb.response = UsbResponse::Ack;
            urb.error = TransferError::empty();
            regs.hcintmsk.write(HcInt::CHH.bits());
            regs.hcchar.set_bits(HcChar::CHDIS.bits());
        }
    }

    /// IN responses
    fn service_inbound(&mut self, channel: usize, hcint: u32, urb: &mut Urb) {
        let regs = self.channel_regs(channel);
        if hcint & HcInt::XFRC.bits() != 0 {
            urb.response = UsbResponse::Ack;
            urb.error = TransferError::empty();
            regs.hcintmsk.write(HcInt::CHH.bits());
            regs.hcchar
                .set_bits(HcChar::CHENA.bits() | HcChar::CHDIS.bits());
        } else if hcint & HcInt::NAK.bits() != 0 {
            urb.response = UsbResponse::Nak;
            if self.port.connected
                && !self.channel_ep_type(channel).is_periodic()
                && urb.nak_retries > 0
            {
                // Re-arm in place, no halt round trip
                urb.nak_retries -= 1;
                regs.hcintmsk.write(HcInt::IN_MASK.bits());
                regs.hcchar.set_bits(HcChar::CHENA.bits());
                urb.timeout_frames = MAX_TIMEOUT_FRAMES;
            } else {
                regs.hcintmsk.write(HcInt::CHH.bits());
                regs.hcchar
                    .set_bits(HcChar::CHENA.bits() | HcChar::CHDIS.bits());
            }
        } else if hcint & (HcInt::TXERR.bits() | HcInt::BBERR.bits() | HcInt::STALL.bits()) != 0 {
            if hcint & HcInt::TXERR.bits() != 0 {
                urb.error = TransferError::TRANSACTION;
                regs.hcintmsk.write(HcInt::ACK.bits() | HcInt::CHH.bits());
            } else if hcint & HcInt::BBERR.bits() != 0 {
                urb.error = TransferError::BABBLE;
                regs.hcintmsk.write(HcInt::CHH.bits());
            } else {
                urb.response = UsbResponse::Stall;
                regs.hcintmsk.write(HcInt::CHH.bits());
            }
            regs.hcchar
                .set_bits(HcChar::CHENA.bits() | HcChar::CHDIS.bits());
        } else if hcint & HcInt::CHH.bits() != 0 {
            self.finalize(channel, urb);
        } else if hcint & HcInt::ACK.bits() != 0 {
            urb.response = UsbResponse::Ack;
            urb.error = TransferError::empty();
            if !self.channel_ep_type(channel).is_periodic() {
                regs.hcintmsk.write(HcInt::IN_MASK.bits());
                regs.hcchar.set_bits(HcChar::CHENA.bits());
                urb.timeout_frames = MAX_TIMEOUT_FRAMES;
            } else {
                regs.hcintmsk.write(HcInt::CHH.bits());
                regs.hcchar
                    .set_bits(HcChar::CHENA.bits() | HcChar::CHDIS.bits());
            }
        } else if hcint & HcInt::DTERR.bits() != 0 {
            regs.hcintmsk.write(HcInt::CHH.bits());
            regs.hcchar
                .set_bits(HcChar::CHENA.bits() | HcChar::CHDIS.bits());
        }
    }

    /// Start due transfers on the frame tick
    ///
    /// The shared DMA stream and receive FIFO allow one new transaction per
    /// frame; the bus counts as busy while any URB is in progress or the
    /// submit path holds the hardware. Periodic countdowns still advance on
    /// a busy frame unless they are about to expire, so a due endpoint is
    /// not skipped.
    fn schedule_frame(&mut self) {
        let mut active = self.hw_accessing.load(core::sync::atomic::Ordering::SeqCst);
        if !active {
            for channel in 0..MAX_CHANNELS {
                if let Some(ptr) = self.channels[channel].urb {
                    if unsafe { ptr.as_ref() }.in_progress {
                        active = true;
                        break;
                    }
                }
            }
        }

        for channel in 0..MAX_CHANNELS {
            let Some(mut ptr) = self.channels[channel].urb else {
                continue;
            };
            let urb = unsafe { ptr.as_mut() };
            if !urb.submitted || urb.in_progress {
                continue;
            }
            if self.channel_ep_type(channel).is_periodic() {
                if self.channels[channel].interval > 0
                    && ((active && self.channels[channel].interval > 1) || !active)
                {
                    self.channels[channel].interval -= 1;
                }
                if !active && self.channels[channel].interval == 0 {
                    urb.in_progress = true;
                    let _ =
                        self.enqueue_transaction(channel, urb.packet, urb.toggle, urb.buf, urb.len);
                    active = true;
                }
            } else if !active {
                urb.in_progress = true;
                let _ = self.enqueue_transaction(channel, urb.packet, urb.toggle, urb.buf, urb.len);
                active = true;
            }
        }
    }
}
