//! Driver behaviour against mocked register banks: port state machine,
//! transfer encoding, interrupt dispatch and URB lifecycle.

mod common;

use common::*;
use stm32f2_usbh::{
    DeviceSpeed, EndpointDescriptor, PacketKind, PortEvent, TogglePolicy, Urb, UsbError,
    UsbResponse,
};

const BULK_OUT: EndpointDescriptor = EndpointDescriptor {
    address: 0x01,
    attributes: 0x02,
    max_packet_size: 64,
    interval: 0,
};

const BULK_IN: EndpointDescriptor = EndpointDescriptor {
    address: 0x81,
    attributes: 0x02,
    max_packet_size: 64,
    interval: 0,
};

const INT_IN: EndpointDescriptor = EndpointDescriptor {
    address: 0x81,
    attributes: 0x03,
    max_packet_size: 8,
    interval: 4,
};

#[test]
fn connect_survives_full_debounce_window() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);
    assert!(host.is_connected());
    assert_eq!(host.port_speed(), DeviceSpeed::Full);
}

#[test]
fn connect_aborts_when_attach_drops_mid_window() {
    let mock = MockController::new();
    let mut host = mock.host();
    mock.write(GINTMSK, ALL_INTS);
    mock.write(HPRT, PCSTS | PCDET);
    mock.interrupt(&mut host, INT_HPRT);

    for _ in 0..100 {
        assert_eq!(host.poll_connect_events(), None);
    }
    mock.write(HPRT, 0);
    for _ in 0..450 {
        assert_eq!(host.poll_connect_events(), None);
    }
    assert!(!host.is_connected());
}

#[test]
fn debounce_rearms_from_polling_alone() {
    let mock = MockController::new();
    let mut host = mock.host();
    mock.write(HPRT, PCSTS);

    // first poll only opens the window
    assert_eq!(host.poll_connect_events(), None);
    for _ in 0..499 {
        assert_eq!(host.poll_connect_events(), None);
    }
    assert_eq!(host.poll_connect_events(), Some(PortEvent::Connected));
    // no repeated event while the device stays attached
    assert_eq!(host.poll_connect_events(), None);
}

#[test]
fn disconnect_cancels_all_urbs_and_reports_once() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    let mut buf = [0u8; 64];
    let mut urb = Urb::new(PacketKind::Out, TogglePolicy::Data0, buf.as_mut_ptr(), buf.len());
    unsafe { host.submit(handle, &mut urb) }.unwrap();
    assert!(urb.in_progress);

    // hardware halts the channel as the device goes away
    mock.write(hcchar(0), mock.read(hcchar(0)) & !CHENA);
    mock.write(HPRT, 0);
    mock.interrupt(&mut host, INT_DISC);

    assert!(!host.is_connected());
    assert!(urb.cancelled);
    assert!(!urb.submitted);
    assert!(!urb.in_progress);

    assert_eq!(host.poll_connect_events(), Some(PortEvent::Disconnected));
    assert_eq!(host.poll_connect_events(), None);
}

#[test]
fn bulk_out_transfer_runs_to_completion() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(5, DeviceSpeed::Full, &BULK_OUT).unwrap();
    let mut buf = [0xA5u8; 200];
    let mut urb = Urb::new(PacketKind::Out, TogglePolicy::Data0, buf.as_mut_ptr(), buf.len());
    unsafe { host.submit(handle, &mut urb) }.unwrap();

    // device 5, endpoint 1 OUT
    assert_eq!((mock.read(hcchar(0)) >> 22) & 0x7F, 5);
    assert_eq!((mock.read(hcchar(0)) >> 11) & 0xF, 1);
    // OUT cause mask, 4 packets of 64, full length, channel enabled
    assert_eq!(mock.read(hcintmsk(0)), 0xD9);
    assert_eq!(mock.read(hctsiz(0)) & 0x7_FFFF, 200);
    assert_eq!((mock.read(hctsiz(0)) >> 19) & 0x3FF, 4);
    assert_ne!(mock.read(hcchar(0)) & CHENA, 0);

    // payload handed to the FIFO DMA as 50 words
    assert_eq!(mock.dma_read(S0NDTR), 50);
    assert_eq!(mock.dma_read(S0PAR), buf.as_ptr() as u32);
    assert_eq!(mock.dma_read(S0M0AR), (mock.otg_base + fifo(0)) as u32);

    mock.channel_interrupt(&mut host, 0, XFRC);

    assert!(urb.completed);
    assert!(!urb.submitted);
    assert!(!urb.in_progress);
    assert_eq!(urb.transferred, 200);
    assert_eq!(urb.response, UsbResponse::Ack);
    assert_eq!(mock.read(hcintmsk(0)), 0);
}

#[test]
fn bulk_in_naks_retry_in_place_then_complete() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_IN).unwrap();
    let mut buf = [0u8; 64];
    let mut urb = Urb::new(PacketKind::In, TogglePolicy::Keep, buf.as_mut_ptr(), buf.len());
    urb.nak_retries = 5;
    unsafe { host.submit(handle, &mut urb) }.unwrap();
    assert_eq!(mock.read(hcintmsk(0)), 0x5B9);

    for retry in 1..=3u32 {
        mock.channel_interrupt(&mut host, 0, NAK);
        assert_eq!(urb.response, UsbResponse::Nak);
        assert_eq!(urb.nak_retries, 5 - retry);
        // channel re-armed without a halt round trip
        assert_ne!(mock.read(hcchar(0)) & CHENA, 0);
        assert_eq!(mock.read(hcchar(0)) & CHDIS, 0);
        assert_eq!(mock.read(hcintmsk(0)), 0x5B9);
    }

    // 7 bytes arrive in the receive FIFO
    let status = (2 << 17) | (7 << 4);
    mock.write(GRXSTSR, status);
    mock.write(GRXSTSP, status);
    unsafe {
        core::ptr::write_volatile((mock.otg_base + fifo(0)) as *mut u32, 0x4433_2211);
    }
    mock.interrupt(&mut host, INT_RXFLVL);
    assert_eq!(urb.transferred, 7);
    assert_eq!(&buf[..7], &[0x11, 0x22, 0x33, 0x44, 0x11, 0x22, 0x33]);

    mock.channel_interrupt(&mut host, 0, XFRC);
    assert!(!urb.completed);
    assert_eq!(mock.read(hcintmsk(0)), CHH);

    mock.channel_interrupt(&mut host, 0, CHH);
    assert!(urb.completed);
    assert_eq!(urb.response, UsbResponse::Ack);
    assert_eq!(urb.transferred, 7);
}

#[test]
fn out_nak_resumes_from_accepted_packets() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    let mut buf = [0u8; 200];
    let mut urb = Urb::new(PacketKind::Out, TogglePolicy::Keep, buf.as_mut_ptr(), buf.len());
    urb.nak_retries = 3;
    unsafe { host.submit(handle, &mut urb) }.unwrap();

    // device accepted 2 of 4 packets before NAKing
    let size = mock.read(hctsiz(0));
    mock.write(hctsiz(0), (size & !(0x3FF << 19)) | (2 << 19));
    mock.channel_interrupt(&mut host, 0, NAK);

    assert_eq!(urb.response, UsbResponse::Nak);
    assert_eq!(urb.transferred, 128);
    assert_eq!(mock.read(hcintmsk(0)), CHH);

    mock.channel_interrupt(&mut host, 0, CHH);

    // retried from byte 128: 72 bytes, 2 packets, fresh timeout budget
    assert_eq!(urb.nak_retries, 2);
    assert!(urb.submitted && urb.in_progress && !urb.completed);
    assert_eq!(mock.read(hctsiz(0)) & 0x7_FFFF, 72);
    assert_eq!((mock.read(hctsiz(0)) >> 19) & 0x3FF, 2);
    assert_eq!(mock.dma_read(S0NDTR), 18);
    assert_eq!(mock.dma_read(S0PAR), unsafe { buf.as_ptr().add(128) } as u32);
    assert_eq!(urb.timeout_frames, 100);
}

#[test]
fn interrupt_endpoint_waits_out_its_interval() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &INT_IN).unwrap();
    let mut buf = [0u8; 8];
    let mut urb = Urb::new(PacketKind::In, TogglePolicy::Keep, buf.as_mut_ptr(), buf.len());
    // previous poll NAKed, so the endpoint is due after its full interval
    urb.response = UsbResponse::Nak;
    unsafe { host.submit(handle, &mut urb) }.unwrap();
    assert!(urb.submitted);
    assert!(!urb.in_progress);

    for _ in 0..3 {
        mock.interrupt(&mut host, INT_SOF);
        assert!(!urb.in_progress);
        assert_eq!(mock.read(hcchar(0)) & CHENA, 0);
    }
    mock.interrupt(&mut host, INT_SOF);
    assert!(urb.in_progress);
    assert_ne!(mock.read(hcchar(0)) & CHENA, 0);
    assert_eq!(mock.read(hcintmsk(0)), 0x5B9);
}

#[test]
fn pending_transfer_times_out_after_frame_budget() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    let mut buf = [0u8; 8];
    let mut urb = Urb::new(PacketKind::Out, TogglePolicy::Keep, buf.as_mut_ptr(), buf.len());
    unsafe { host.submit(handle, &mut urb) }.unwrap();

    for _ in 0..99 {
        mock.interrupt(&mut host, INT_SOF);
        assert!(!urb.timeout);
    }
    mock.interrupt(&mut host, INT_SOF);
    assert!(urb.timeout);
    assert!(!urb.completed);
}

#[test]
fn channel_accepts_one_urb_at_a_time() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    let mut buf = [0u8; 8];
    let mut first = Urb::new(PacketKind::Out, TogglePolicy::Keep, buf.as_mut_ptr(), buf.len());
    unsafe { host.submit(handle, &mut first) }.unwrap();

    assert_eq!(
        unsafe { host.submit(handle, &mut first) },
        Err(UsbError::AlreadySubmitted)
    );
    let mut second = Urb::zero_length(PacketKind::Out, TogglePolicy::Keep);
    assert_eq!(
        unsafe { host.submit(handle, &mut second) },
        Err(UsbError::ChannelBusy)
    );
}

#[test]
fn submit_requires_connection() {
    let mock = MockController::new();
    let mut host = mock.host();

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    let mut urb = Urb::zero_length(PacketKind::Out, TogglePolicy::Keep);
    assert_eq!(
        unsafe { host.submit(handle, &mut urb) },
        Err(UsbError::NotConnected)
    );
}

#[test]
fn ninth_endpoint_is_rejected() {
    let mock = MockController::new();
    let mut host = mock.host();

    for _ in 0..8 {
        host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    }
    assert_eq!(
        host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT),
        Err(UsbError::NoFreeChannel)
    );
}

#[test]
fn stale_handle_is_rejected() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    host.remove_endpoint(handle).unwrap();

    let mut urb = Urb::zero_length(PacketKind::Out, TogglePolicy::Keep);
    assert_eq!(
        unsafe { host.submit(handle, &mut urb) },
        Err(UsbError::InvalidHandle)
    );
}

#[test]
fn cancel_is_idempotent() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &INT_IN).unwrap();
    let mut buf = [0u8; 8];
    let mut urb = Urb::new(PacketKind::In, TogglePolicy::Keep, buf.as_mut_ptr(), buf.len());
    unsafe { host.submit(handle, &mut urb) }.unwrap();
    assert!(urb.submitted && !urb.in_progress);

    host.cancel(handle, &mut urb).unwrap();
    assert!(urb.cancelled);
    assert!(!urb.submitted);

    host.cancel(handle, &mut urb).unwrap();

    // the channel is free for the next URB
    let mut next = Urb::new(PacketKind::In, TogglePolicy::Keep, buf.as_mut_ptr(), buf.len());
    unsafe { host.submit(handle, &mut next) }.unwrap();
}

#[test]
fn cancel_releases_urb_even_when_halt_never_confirms() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    let mut buf = [0u8; 64];
    let mut urb = Urb::new(PacketKind::Out, TogglePolicy::Keep, buf.as_mut_ptr(), buf.len());
    unsafe { host.submit(handle, &mut urb) }.unwrap();
    assert!(urb.in_progress);

    // the channel never reports CHH, so the disable wait runs out
    assert_eq!(host.cancel(handle, &mut urb), Err(UsbError::HwTimeout));
    assert!(urb.cancelled);
    assert!(!urb.submitted);
    assert!(!urb.in_progress);

    // the slot was released despite the failed halt
    let mut next = Urb::zero_length(PacketKind::Out, TogglePolicy::Keep);
    assert_eq!(unsafe { host.submit(handle, &mut next) }, Ok(()));
}

#[test]
fn reconfigure_halts_the_live_channel_and_reprograms_it() {
    let mock = MockController::new();
    let mut host = mock.host_with(HaltReportingDelay {
        hcint_addr: mock.otg_base + hcint(0),
    });
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    let mut urb = Urb::zero_length(PacketKind::Out, TogglePolicy::Keep);
    unsafe { host.submit(handle, &mut urb) }.unwrap();
    mock.channel_interrupt(&mut host, 0, XFRC);
    assert!(urb.completed);
    // the mock leaves CHENA standing, so the reconfiguration has to run the
    // whole disable handshake before it may touch the channel
    assert_ne!(mock.read(hcchar(0)) & CHENA, 0);

    host.configure_endpoint(handle, 2, DeviceSpeed::Full, &INT_IN)
        .unwrap();

    let reprogrammed = mock.read(hcchar(0));
    assert_eq!(reprogrammed & CHENA, 0);
    assert_eq!(reprogrammed & 0x7FF, 8);
    assert_eq!((reprogrammed >> 18) & 0b11, 3);
    assert_eq!((reprogrammed >> 22) & 0x7F, 2);
    // the halt was reported and its causes masked before the rewrite
    assert_ne!(mock.read(hcint(0)) & CHH, 0);
    assert_eq!(mock.read(hcintmsk(0)), 0);

    // the refreshed interval drives the frame scheduler
    let mut buf = [0u8; 8];
    let mut poll = Urb::new(PacketKind::In, TogglePolicy::Keep, buf.as_mut_ptr(), buf.len());
    poll.response = UsbResponse::Nak;
    unsafe { host.submit(handle, &mut poll) }.unwrap();
    for _ in 0..3 {
        mock.interrupt(&mut host, INT_SOF);
        assert!(!poll.in_progress);
    }
    mock.interrupt(&mut host, INT_SOF);
    assert!(poll.in_progress);
}

#[test]
fn reconfigure_fails_when_the_halt_never_comes() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    let mut urb = Urb::zero_length(PacketKind::Out, TogglePolicy::Keep);
    unsafe { host.submit(handle, &mut urb) }.unwrap();
    mock.channel_interrupt(&mut host, 0, XFRC);
    assert_ne!(mock.read(hcchar(0)) & CHENA, 0);

    assert_eq!(
        host.configure_endpoint(handle, 1, DeviceSpeed::Full, &BULK_IN),
        Err(UsbError::HwTimeout)
    );
    // the disable writes went out even though the confirmation never did
    assert_eq!(mock.read(hcchar(0)) & CHENA, 0);
    assert_ne!(mock.read(hcchar(0)) & CHDIS, 0);
    assert_eq!(mock.read(hcintmsk(0)), 0);
}

#[test]
fn zero_packet_size_endpoint_is_rejected() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let bad = EndpointDescriptor {
        address: 0x01,
        attributes: 0x02,
        max_packet_size: 0,
        interval: 0,
    };
    assert_eq!(
        host.add_endpoint(1, DeviceSpeed::Full, &bad),
        Err(UsbError::InvalidEndpoint)
    );

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    assert_eq!(
        host.configure_endpoint(handle, 1, DeviceSpeed::Full, &bad),
        Err(UsbError::InvalidEndpoint)
    );
    // the channel keeps its previous programming
    assert_eq!(mock.read(hcchar(0)) & 0x7FF, 64);
}

#[test]
fn remove_endpoint_frees_and_zeroes_the_channel() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &INT_IN).unwrap();
    let mut buf = [0u8; 8];
    let mut urb = Urb::new(PacketKind::In, TogglePolicy::Keep, buf.as_mut_ptr(), buf.len());
    unsafe { host.submit(handle, &mut urb) }.unwrap();

    host.remove_endpoint(handle).unwrap();
    assert!(urb.cancelled);
    assert_eq!(mock.read(hcchar(0)), 0);
    assert_eq!(mock.read(hcint(0)), 0);
    assert_eq!(mock.read(hcintmsk(0)), 0);
    assert_eq!(mock.read(hctsiz(0)), 0);

    // channel is allocatable again
    let reused = host.add_endpoint(2, DeviceSpeed::Full, &BULK_OUT).unwrap();
    assert_eq!(reused, handle);
}

#[test]
fn completion_callback_fires_on_finalize() {
    use std::sync::atomic::{AtomicU32, Ordering};
    static CALLS: AtomicU32 = AtomicU32::new(0);
    fn completed() {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    let handle = host.add_endpoint(1, DeviceSpeed::Full, &BULK_OUT).unwrap();
    let mut urb = Urb::zero_length(PacketKind::Out, TogglePolicy::Keep);
    urb.on_complete = Some(completed);
    unsafe { host.submit(handle, &mut urb) }.unwrap();
    // zero-length status stage: one empty packet
    assert_eq!((mock.read(hctsiz(0)) >> 19) & 0x3FF, 1);
    assert_eq!(mock.read(hctsiz(0)) & 0x7_FFFF, 0);

    mock.channel_interrupt(&mut host, 0, XFRC);
    assert!(urb.completed);
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn init_fails_when_core_never_goes_idle() {
    let mock = MockController::new();
    let mut host = mock.host();
    assert_eq!(host.init(), Err(UsbError::HwTimeout));
    // clock was enabled before the wait
    assert_ne!(mock.rcc_read(AHB2ENR) & (1 << 7), 0);
}

#[test]
fn init_fails_when_soft_reset_sticks() {
    let mock = MockController::new();
    let mut host = mock.host();
    mock.write(GRSTCTL, 1 << 31);
    assert_eq!(host.init(), Err(UsbError::HwTimeout));
    // reset was requested
    assert_ne!(mock.read(GRSTCTL) & 1, 0);
}

#[test]
fn deinit_restores_reset_defaults() {
    let mock = MockController::new();
    let mut host = mock.host();
    mock.write(HAINTMSK, 0xFF);
    mock.write(HCFG, 0x05);
    mock.write(HPRT, PCSTS);

    host.deinit().unwrap();
    assert_eq!(mock.read(HPRT), 0);
    assert_eq!(mock.read(HCFG), 0);
    assert_eq!(mock.read(HAINTMSK), 0);
    // turnaround time back to its reset value
    assert_eq!(mock.read(GUSBCFG), 2 << 10);
    assert_eq!(mock.rcc_read(AHB2ENR) & (1 << 7), 0);
    assert_eq!(mock.rcc_read(AHB2RSTR) & (1 << 7), 0);
}

#[test]
fn reset_port_needs_a_device() {
    let mock = MockController::new();
    let mut host = mock.host();
    assert_eq!(host.reset_port(), Err(UsbError::NotConnected));
}

#[test]
fn reset_port_programs_frame_interval_for_speed() {
    let mock = MockController::new();
    let mut host = mock.host();
    connect_full_speed(&mock, &mut host);

    mock.write(HPRT, PCSTS | PSPD_FS);
    // the mock never re-raises port enable, so the wait runs out
    assert_eq!(host.reset_port(), Err(UsbError::HwTimeout));
    assert_eq!(mock.read(HFIR), 48_000);
    assert_eq!(mock.read(HCFG) & 0b11, 1);
    // reset pulse released
    assert_eq!(mock.read(HPRT) & (1 << 8), 0);

    mock.write(HPRT, PCSTS | PSPD_LS);
    assert_eq!(host.reset_port(), Err(UsbError::HwTimeout));
    assert_eq!(mock.read(HFIR), 6_000);
    assert_eq!(mock.read(HCFG) & 0b11, 2);
}

#[test]
fn port_power_drives_ppwr() {
    let mock = MockController::new();
    let mut host = mock.host();
    host.port_power(true);
    assert_ne!(mock.read(HPRT) & (1 << 12), 0);
    host.port_power(false);
    assert_eq!(mock.read(HPRT) & (1 << 12), 0);
}
