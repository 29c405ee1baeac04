//! The legacy transmit and receive descriptor formats used by the 8254x (e1000) family.
//!
//! The layouts are fixed by the hardware: each descriptor is 16 bytes,
//! and an array of them must start on a 16-byte boundary.

use core::fmt;
use bit_field::BitField;
use volatile::Volatile;
use nic_buffers::PhysicalAddress;


/// A trait for functionalities that all transmit descriptors must support.
pub trait TxDescriptor {
    /// Returns a descriptor with every field cleared.
    fn new() -> Self where Self: Sized;

    /// Initializes a transmit descriptor by clearing all of its values
    /// and then marking it as done, so that software sees it as free.
    fn init(&mut self);

    /// Updates the transmit descriptor to send one complete packet.
    ///
    /// # Arguments
    /// * `buffer_address`: the starting physical address of the packet.
    /// * `length`: the length of the packet in bytes.
    fn send(&mut self, buffer_address: PhysicalAddress, length: u16);

    /// Returns true if the hardware has finished with this descriptor.
    fn descriptor_done(&self) -> bool;
}

/// A trait for functionalities that all receive descriptors must support.
pub trait RxDescriptor {
    /// Returns a descriptor with every field cleared.
    fn new() -> Self where Self: Sized;

    /// Initializes a receive descriptor by clearing its status
    /// and setting the descriptor's physical address.
    fn init(&mut self, packet_buffer_address: PhysicalAddress);

    /// Updates the descriptor's physical address.
    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress);

    /// Clears the status bits of the descriptor.
    fn reset_status(&mut self);

    /// Returns true if the descriptor has a received packet copied to its buffer.
    fn descriptor_done(&self) -> bool;

    /// Returns true if the descriptor's packet buffer is the last in a frame.
    fn end_of_packet(&self) -> bool;

    /// The length of the packet in the descriptor's packet buffer.
    fn length(&self) -> u16;
}


/// This struct is a Legacy Transmit Descriptor.
/// There is one instance of this struct per transmit ring slot.
#[repr(C, align(16))]
pub struct LegacyTxDescriptor {
    /// The starting physical address of the transmit buffer
    pub phys_addr:  Volatile<u64>,
    /// Length of the transmit buffer in bytes
    pub length:     Volatile<u16>,
    /// Checksum offset: where to insert the checksum from the start of the packet if enabled
    pub cso:        Volatile<u8>,
    /// Command bits
    pub cmd:        Volatile<u8>,
    /// Status bits, written back by the NIC
    pub status:     Volatile<u8>,
    /// Checksum start: where to begin computing the checksum, if enabled
    pub css:        Volatile<u8>,
    pub special:    Volatile<u16>,
}

const_assert_eq!(core::mem::size_of::<LegacyTxDescriptor>(), 16);
const_assert_eq!(core::mem::align_of::<LegacyTxDescriptor>(), 16);

impl TxDescriptor for LegacyTxDescriptor {
    fn new() -> LegacyTxDescriptor {
        LegacyTxDescriptor {
            phys_addr:  Volatile::new(0),
            length:     Volatile::new(0),
            cso:        Volatile::new(0),
            cmd:        Volatile::new(0),
            status:     Volatile::new(0),
            css:        Volatile::new(0),
            special:    Volatile::new(0),
        }
    }

    fn init(&mut self) {
        self.phys_addr.write(0);
        self.length.write(0);
        self.cso.write(0);
        self.cmd.write(0);
        self.css.write(0);
        self.special.write(0);
        self.status.write(TX_STATUS_DD);
    }

    fn send(&mut self, buffer_address: PhysicalAddress, length: u16) {
        self.phys_addr.write(buffer_address.value() as u64);
        self.length.write(length);
        // every packet fits in a single descriptor
        self.cmd.write(TX_CMD_RS | TX_CMD_EOP);
        // the NIC sets DD again once it has sent this descriptor
        self.status.write(0);
    }

    fn descriptor_done(&self) -> bool {
        self.status.read().get_bit(TX_STATUS_DD_BIT)
    }
}

impl fmt::Debug for LegacyTxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, length: {}, cso: {}, cmd: {:#X}, status: {:#X}, css: {}, special: {}}}",
            self.phys_addr.read(), self.length.read(), self.cso.read(), self.cmd.read(),
            self.status.read(), self.css.read(), self.special.read())
    }
}


/// This struct is a Legacy Receive Descriptor.
/// There is one instance of this struct per receive buffer.
#[repr(C, align(16))]
pub struct LegacyRxDescriptor {
    /// The starting physical address of the receive buffer
    pub phys_addr:  Volatile<u64>,
    /// Length of the received packet in bytes, written back by the NIC
    pub length:     Volatile<u16>,
    /// Packet checksum, written back by the NIC
    pub checksum:   Volatile<u16>,
    /// Status bits, written back by the NIC
    pub status:     Volatile<u8>,
    /// Receive errors
    pub errors:     Volatile<u8>,
    pub special:    Volatile<u16>,
}

const_assert_eq!(core::mem::size_of::<LegacyRxDescriptor>(), 16);
const_assert_eq!(core::mem::align_of::<LegacyRxDescriptor>(), 16);

impl RxDescriptor for LegacyRxDescriptor {
    fn new() -> LegacyRxDescriptor {
        LegacyRxDescriptor {
            phys_addr:  Volatile::new(0),
            length:     Volatile::new(0),
            checksum:   Volatile::new(0),
            status:     Volatile::new(0),
            errors:     Volatile::new(0),
            special:    Volatile::new(0),
        }
    }

    fn init(&mut self, packet_buffer_address: PhysicalAddress) {
        self.phys_addr.write(packet_buffer_address.value() as u64);
        self.status.write(0);
    }

    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress) {
        self.phys_addr.write(packet_buffer_address.value() as u64);
    }

    fn reset_status(&mut self) {
        self.status.write(0);
    }

    fn descriptor_done(&self) -> bool {
        self.status.read().get_bit(RX_STATUS_DD_BIT)
    }

    fn end_of_packet(&self) -> bool {
        self.status.read().get_bit(RX_STATUS_EOP_BIT)
    }

    fn length(&self) -> u16 {
        self.length.read()
    }
}

impl fmt::Debug for LegacyRxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, length: {}, checksum: {}, status: {:#X}, errors: {}, special: {}}}",
            self.phys_addr.read(), self.length.read(), self.checksum.read(),
            self.status.read(), self.errors.read(), self.special.read())
    }
}


// Transmit descriptor bits
/// Tx Command: End of Packet
pub const TX_CMD_EOP:                      u8 = 1 << 0;
/// Tx Command: Insert FCS
pub const TX_CMD_IFCS:                     u8 = 1 << 1;
/// Tx Command: Report Status
pub const TX_CMD_RS:                       u8 = 1 << 3;
/// Tx Status: Descriptor Done
pub const TX_STATUS_DD:                    u8 = 1 << TX_STATUS_DD_BIT;
const TX_STATUS_DD_BIT:                    usize = 0;

// Receive descriptor bits
/// Rx Status: Descriptor Done
pub const RX_STATUS_DD:                    u8 = 1 << RX_STATUS_DD_BIT;
/// Rx Status: End of Packet
pub const RX_STATUS_EOP:                   u8 = 1 << RX_STATUS_EOP_BIT;
const RX_STATUS_DD_BIT:                    usize = 0;
const RX_STATUS_EOP_BIT:                   usize = 1;
