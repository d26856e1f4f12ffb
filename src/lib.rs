//! USB OTG_FS host controller driver for STM32F2xx microcontrollers
//!
//! Register-level host mode driver for the on-chip OTG_FS controller:
//! channel allocation, USB request block (URB) lifecycle, port connect
//! debouncing and reset, and DMA-assisted transmit FIFO loading. The
//! protocol state machine runs entirely from the OTG interrupt.
//!
//! # Architecture
//!
//! - [`otg`] - register layout, bit definitions, volatile access
//! - [`rcc`], [`dma`] - clock/reset bits and the shared TX FIFO DMA stream
//! - [`pipe`] - endpoint-to-channel binding and the transaction encoder
//! - [`urb`] - client-owned transfer request blocks
//! - [`host`] - the [`UsbHost`] driver object and its control surface
//! - [`irq`] - the interrupt-driven protocol engine
//! - [`vbus`] - external VBUS switch helper
//!
//! # Usage
//!
//! ```no_run
//! use stm32f2_usbh::{UsbHost, PortEvent};
//! # fn bring_up(delay: impl embedded_hal::delay::DelayNs) -> stm32f2_usbh::Result<()> {
//! let mut usb = unsafe { UsbHost::otg_fs(delay) };
//! usb.init()?;
//! usb.port_power(true);
//! // route UsbHost::on_interrupt into the OTG_FS vector, then:
//! loop {
//!     if usb.poll_connect_events() == Some(PortEvent::Connected) {
//!         usb.reset_port()?;
//!         break;
//!     }
//! }
//! # Ok(()) }
//! ```
//!
//! URBs are driver-mutated but client-owned; see
//! [`UsbHost::submit`](host::UsbHost::submit) for the liveness contract.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod dma;
pub mod error;
pub mod host;
pub mod irq;
pub mod otg;
pub mod pipe;
pub mod rcc;
pub mod urb;
pub mod vbus;

pub use error::{Result, UsbError};
pub use host::{DeviceSpeed, HostCapabilities, PortEvent, UsbHost, DEBOUNCE_TICKS};
pub use pipe::{EndpointDescriptor, EndpointType, PipeHandle};
pub use urb::{PacketKind, TogglePolicy, TransferError, Urb, UsbResponse};
pub use vbus::VbusSwitch;
