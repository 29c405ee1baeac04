//! The boundary between a NIC driver and the network stack above it.
//!
//! Frames flow down through [`NetworkInterfaceCard::send_packet()`]
//! and flow up through [`NetworkStack::deliver()`].
//! In both directions, ownership of the [`FrameBuffer`] moves with the call.

#![cfg_attr(not(test), no_std)]

extern crate nic_buffers;

use core::fmt;
use nic_buffers::FrameBuffer;


/// A trait that defines the necessary minimum functions that all network interface card (NIC) drivers
/// should implement.
pub trait NetworkInterfaceCard {
    /// Enqueues the given frame for transmission through this NetworkInterfaceCard.
    ///
    /// Does not block: if the NIC cannot accept the frame right now,
    /// it is handed back to the caller inside the returned error.
    fn send_packet(&self, buffer: FrameBuffer) -> Result<(), TransmitError>;

    /// Polls the NIC for received frames and delivers them to the network stack.
    /// Returns the number of frames delivered.
    ///
    /// Can be used as an alternative to interrupts, or as a supplement to interrupts.
    fn poll_receive(&self) -> usize;

    /// Returns the MAC address that this NIC is configured with.
    fn mac_address(&self) -> [u8; 6];
}


/// The network stack's entry point for received frames.
///
/// Implementations are invoked from the NIC's interrupt handler,
/// so they must not block.
pub trait NetworkStack: Send + Sync {
    /// Takes ownership of one received frame.
    fn deliver(&self, frame: FrameBuffer);
}


/// The reasons a frame could not be enqueued for transmission.
///
/// Each variant hands the untouched frame back to the caller,
/// who decides whether to drop it, retry later, or report the failure upward.
pub enum TransmitError {
    /// The transmit ring has no free descriptor, because the hardware
    /// has not yet finished with the descriptor at the tail.
    RingFull(FrameBuffer),
    /// The NIC has not been initialized yet.
    NotInitialized(FrameBuffer),
}

impl TransmitError {
    /// Returns ownership of the frame that could not be sent.
    pub fn into_buffer(self) -> FrameBuffer {
        match self {
            TransmitError::RingFull(buffer) | TransmitError::NotInitialized(buffer) => buffer,
        }
    }

    pub fn is_ring_full(&self) -> bool {
        matches!(self, TransmitError::RingFull(_))
    }

    fn description(&self) -> &'static str {
        match self {
            TransmitError::RingFull(_) => "transmit ring is full",
            TransmitError::NotInitialized(_) => "NIC is not initialized",
        }
    }
}

impl fmt::Debug for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let buffer = match self {
            TransmitError::RingFull(buffer) | TransmitError::NotInitialized(buffer) => buffer,
        };
        write!(f, "TransmitError({}, {:?})", self.description(), buffer)
    }
}

impl fmt::Display for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl From<TransmitError> for &'static str {
    fn from(e: TransmitError) -> &'static str {
        e.description()
    }
}
