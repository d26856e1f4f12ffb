//! USB host driver error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB host driver error types
///
/// Per-transaction USB outcomes (ACK, NAK, STALL, ...) are not errors of the
/// driver; they are reported on the [`Urb`](crate::urb::Urb) itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// A bounded register poll exceeded its tick budget
    HwTimeout,
    /// Operation attempted with no device attached
    NotConnected,
    /// Endpoint handle is out of range or not allocated
    InvalidHandle,
    /// Transaction requested on an unallocated hardware channel
    InvalidChannel,
    /// All hardware channels are in use
    NoFreeChannel,
    /// URB is already submitted or in progress
    AlreadySubmitted,
    /// The channel already has an active URB
    ChannelBusy,
    /// Endpoint descriptor fields cannot be programmed into a channel
    InvalidEndpoint,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HwTimeout => write!(f, "Hardware timeout"),
            Self::NotConnected => write!(f, "Device not connected"),
            Self::InvalidHandle => write!(f, "Invalid endpoint handle"),
            Self::InvalidChannel => write!(f, "Invalid channel"),
            Self::NoFreeChannel => write!(f, "No free channel"),
            Self::AlreadySubmitted => write!(f, "URB already submitted"),
            Self::ChannelBusy => write!(f, "Channel busy"),
            Self::InvalidEndpoint => write!(f, "Invalid endpoint descriptor"),
        }
    }
}
