//! USB request blocks
//!
//! A [`Urb`] describes one transfer request against an endpoint: the data
//! buffer, the token kind, the data-toggle policy and the retry budgets. The
//! client owns the block; the driver mutates its progress and outcome fields
//! while the transfer runs and sets `completed` (or `cancelled`) when it is
//! finished with it.

use bitflags::bitflags;

use crate::otg::HcInt;

/// Token kind of the transaction a URB requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketKind {
    /// IN token, device to host
    In,
    /// OUT token, host to device
    Out,
    /// SETUP token, control transfer stage
    Setup,
    /// PING token, high-speed OUT flow control
    Ping,
}

/// Data toggle selection for the first packet of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TogglePolicy {
    /// Continue from the toggle state the channel last used
    Keep,
    /// Force DATA0
    Data0,
    /// Force DATA1
    Data1,
}

/// Last handshake the device answered with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbResponse {
    /// No response recorded yet
    None,
    /// ACK handshake
    Ack,
    /// NAK handshake
    Nak,
    /// NYET handshake
    Nyet,
    /// STALL handshake
    Stall,
}

bitflags! {
    /// Accumulated transaction error classes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferError: u8 {
        /// Transaction error (CRC, bit stuffing, false EOP, timeout)
        const TRANSACTION = 1 << 0;
        /// Babble error
        const BABBLE = 1 << 1;
        /// Frame overrun
        const FRAME_OVERRUN = 1 << 2;
        /// Data toggle error
        const DATA_TOGGLE = 1 << 3;
    }
}

impl TransferError {
    /// Extract the error classes from a channel interrupt status word
    ///
    /// The four error causes occupy bits [10:7] of HCINT in the same order
    /// as the flag bits here.
    #[inline]
    pub fn from_hcint(hcint: u32) -> Self {
        Self::from_bits_truncate(((hcint & HcInt::ERR_MASK) >> HcInt::ERR_SHIFT) as u8)
    }
}

/// Frames a transfer may remain pending before its `timeout` flag is set
pub const MAX_TIMEOUT_FRAMES: u16 = 100;

/// Default NAK retry budget for control endpoints
pub const CTRL_NAK_RETRIES: u32 = 100_000;

/// Default NAK retry budget for bulk endpoints
pub const BULK_NAK_RETRIES: u32 = 1_000_000;

/// One USB transfer request
///
/// The driver holds a raw pointer to a submitted URB until the transfer
/// finishes, so the block must stay at a stable address from
/// [`submit`](crate::host::UsbHost::submit) until `completed` or `cancelled`
/// is observed.
pub struct Urb {
    /// Transfer data buffer; read for OUT/SETUP, written for IN
    pub buf: *mut u8,
    /// Requested transfer length in bytes
    pub len: usize,
    /// Bytes moved so far, maintained by the driver
    pub transferred: usize,
    /// Token kind
    pub packet: PacketKind,
    /// Data toggle selection for the first packet
    pub toggle: TogglePolicy,
    /// Last device handshake, maintained by the driver
    pub response: UsbResponse,
    /// Accumulated error classes, maintained by the driver
    pub error: TransferError,
    /// Set while the URB is queued on a channel
    pub submitted: bool,
    /// Set while a transaction for this URB is on the bus
    pub in_progress: bool,
    /// Set once when the driver is finished with the URB
    pub completed: bool,
    /// Set when the URB was cancelled instead of completed
    pub cancelled: bool,
    /// Set when the frame timeout budget ran out before completion
    pub timeout: bool,
    /// Remaining NAK retries before the transfer is finalized as NAKed
    pub nak_retries: u32,
    /// Remaining frames before `timeout` is raised
    pub timeout_frames: u16,
    /// Invoked from interrupt context when the URB completes
    pub on_complete: Option<fn()>,
}

impl Urb {
    /// New URB for a transfer of `len` bytes at `buf`
    pub fn new(packet: PacketKind, toggle: TogglePolicy, buf: *mut u8, len: usize) -> Self {
        Self {
            buf,
            len,
            transferred: 0,
            packet,
            toggle,
            response: UsbResponse::None,
            error: TransferError::empty(),
            submitted: false,
            in_progress: false,
            completed: false,
            cancelled: false,
            timeout: false,
            nak_retries: 0,
            timeout_frames: 0,
            on_complete: None,
        }
    }

    /// New zero-length URB (status stage, PING)
    pub fn zero_length(packet: PacketKind, toggle: TogglePolicy) -> Self {
        Self::new(packet, toggle, core::ptr::null_mut(), 0)
    }

    /// Reset progress and outcome fields and arm the frame timeout
    pub(crate) fn prepare_for_submit(&mut self) {
        self.transferred = 0;
        self.error = TransferError::empty();
        self.completed = false;
        self.cancelled = false;
        self.timeout = false;
        self.timeout_frames = MAX_TIMEOUT_FRAMES;
    }

    /// Mark the URB finished and fire the completion callback
    ///
    /// A completed URB is never left submitted or in progress.
    pub(crate) fn finalize(&mut self) {
        self.submitted = false;
        self.in_progress = false;
        self.completed = true;
        if let Some(callback) = self.on_complete {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_flags_from_channel_status() {
        // TXERR
        assert_eq!(TransferError::from_hcint(1 << 7), TransferError::TRANSACTION);
        // BBERR
        assert_eq!(TransferError::from_hcint(1 << 8), TransferError::BABBLE);
        // FRMOR
        assert_eq!(TransferError::from_hcint(1 << 9), TransferError::FRAME_OVERRUN);
        // DTERR
        assert_eq!(TransferError::from_hcint(1 << 10), TransferError::DATA_TOGGLE);
        // unrelated bits do not leak in
        assert_eq!(
            TransferError::from_hcint(0x7FF),
            TransferError::all()
        );
        assert_eq!(TransferError::from_hcint(0x3F), TransferError::empty());
    }

    #[test]
    fn finalize_clears_lifecycle_flags() {
        let mut urb = Urb::zero_length(PacketKind::In, TogglePolicy::Keep);
        urb.submitted = true;
        urb.in_progress = true;
        urb.finalize();
        assert!(urb.completed);
        assert!(!urb.submitted);
        assert!(!urb.in_progress);
    }

    #[test]
    fn prepare_resets_outcome() {
        let mut urb = Urb::zero_length(PacketKind::Out, TogglePolicy::Data0);
        urb.transferred = 42;
        urb.completed = true;
        urb.timeout = true;
        urb.error = TransferError::BABBLE;
        urb.prepare_for_submit();
        assert_eq!(urb.transferred, 0);
        assert!(!urb.completed);
        assert!(!urb.timeout);
        assert_eq!(urb.error, TransferError::empty());
        assert_eq!(urb.timeout_frames, MAX_TIMEOUT_FRAMES);
    }
}
