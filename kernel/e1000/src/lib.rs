//! A driver for the Intel 8254x (e1000) family of Ethernet NICs,
//! including the one emulated by QEMU.
//!
//! The rest of the kernel only uses three entry points:
//! * [`initialize()`], called once at boot with the address of the mapped register block,
//! * [`transmit()`], called from any thread to send a frame,
//! * [`on_interrupt()`], called by the interrupt dispatcher when the NIC raises its IRQ.
//!
//! Transmission never blocks: if the transmit ring is full, the frame is handed back to the caller.
//! Transmit completion is noticed lazily, the next time a transmit reuses a slot.
//! Reception is driven entirely by the "receive descriptor written back" interrupt,
//! which drains every completed receive descriptor up to the network stack.

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate bit_field;
extern crate spin;
extern crate volatile;
extern crate irq_safety;
extern crate intel_ethernet;
extern crate network_interface_card;
extern crate nic_buffers;
extern crate nic_queues;

mod regs;
pub use regs::*;

use core::sync::atomic::{fence, AtomicBool, Ordering};
use bit_field::BitField;
use spin::Once;
use irq_safety::MutexIrqSafe;
use intel_ethernet::descriptors::{LegacyRxDescriptor, LegacyTxDescriptor};
use network_interface_card::{NetworkInterfaceCard, NetworkStack, TransmitError};
use nic_buffers::{FrameAllocator, FrameBuffer};
use nic_queues::{RxQueue, TxQueue};

/// The default number of transmit descriptors.
pub const E1000_NUM_TX_DESC:    u16 = 16;
/// The default number of receive descriptors.
pub const E1000_NUM_RX_DESC:    u16 = 16;

/// The MAC address that QEMU assigns to its emulated e1000 by default, 52:54:00:12:34:56.
pub const QEMU_MAC_ADDRESS:     [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

const_assert!(nic_buffers::FRAME_BUFFER_SIZE >= 2048);


/// Settings used when bringing up the NIC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct E1000Config {
    /// The number of transmit descriptors. Their total size must be a multiple of 128 bytes.
    pub num_tx_descs: u16,
    /// The number of receive descriptors. Their total size must be a multiple of 128 bytes.
    pub num_rx_descs: u16,
    /// The only unicast address the receive filter accepts.
    pub mac_address: [u8; 6],
}

impl Default for E1000Config {
    fn default() -> Self {
        E1000Config {
            num_tx_descs: E1000_NUM_TX_DESC,
            num_rx_descs: E1000_NUM_RX_DESC,
            mac_address: QEMU_MAC_ADDRESS,
        }
    }
}


/// The single instance of the E1000 NIC.
static E1000_NIC: Once<E1000Nic> = Once::new();

/// Returns a reference to the E1000Nic, if it has been initialized.
pub fn get_e1000_nic() -> Option<&'static E1000Nic> {
    E1000_NIC.get()
}

/// Initializes the e1000 whose registers are mapped at `register_base`, using the default [`E1000Config`].
///
/// # Safety
/// See [`E1000Mmio::new()`].
///
/// # Panics
/// If the device or its rings cannot be brought up, or if the NIC was already initialized.
/// The kernel cannot safely continue in either case.
pub unsafe fn initialize(
    register_base: usize,
    frame_allocator: &'static dyn FrameAllocator,
    network_stack: &'static dyn NetworkStack,
) -> &'static E1000Nic {
    initialize_with_config(register_base, E1000Config::default(), frame_allocator, network_stack)
}

/// Initializes the e1000 whose registers are mapped at `register_base`.
///
/// # Safety
/// See [`E1000Mmio::new()`].
///
/// # Panics
/// If the device or its rings cannot be brought up, or if the NIC was already initialized.
pub unsafe fn initialize_with_config(
    register_base: usize,
    config: E1000Config,
    frame_allocator: &'static dyn FrameAllocator,
    network_stack: &'static dyn NetworkStack,
) -> &'static E1000Nic {
    if E1000_NIC.is_completed() {
        panic!("e1000::initialize(): the NIC was already initialized");
    }

    let nic = E1000Mmio::new(register_base)
        .and_then(|regs| E1000Nic::init(regs, &config, frame_allocator, network_stack))
        .unwrap_or_else(|e| panic!("e1000::initialize(): {}", e));

    let mut installed = false;
    let nic_ref = E1000_NIC.call_once(|| {
        installed = true;
        nic
    });
    if !installed {
        panic!("e1000::initialize(): the NIC was already initialized");
    }
    info!("e1000: initialized NIC at {:#X} with MAC address {:02x?}", register_base, nic_ref.mac_address());
    nic_ref
}

/// Enqueues `buffer` for transmission on the e1000.
///
/// On failure the buffer is handed back inside the error, untouched.
pub fn transmit(buffer: FrameBuffer) -> Result<(), TransmitError> {
    match E1000_NIC.get() {
        Some(nic) => nic.transmit(buffer),
        None => {
            warn!("e1000::transmit(): the NIC hasn't been initialized yet");
            Err(TransmitError::NotInitialized(buffer))
        }
    }
}

/// The e1000's interrupt entry point, invoked by the platform interrupt dispatcher.
///
/// Spurious invocations are harmless: they find no completed descriptors and return.
pub fn on_interrupt() {
    if let Some(nic) = E1000_NIC.get() {
        nic.handle_interrupt();
    } else {
        error!("BUG: e1000::on_interrupt(): E1000 NIC hasn't yet been initialized!");
    }
}


/// Struct representing an e1000 network interface card.
pub struct E1000Nic {
    /// memory-mapped control registers
    regs: E1000Mmio,
    /// Transmit queue with descriptors.
    /// This lock serializes every transmitting thread and guards the tail register.
    /// The network stack may transmit from within the receive interrupt,
    /// so it is held with interrupts disabled.
    tx_queue: MutexIrqSafe<TxQueue<E1000TxQueueRegisters, LegacyTxDescriptor>>,
    /// Receive queue with descriptors, drained by the interrupt handler or an explicit poll.
    rx_queue: MutexIrqSafe<RxQueue<E1000RxQueueRegisters, LegacyRxDescriptor>>,
    /// Set when a drain of the receive queue has been requested and not yet run.
    /// Whoever holds `rx_queue` keeps draining until this is clear.
    rx_pending: AtomicBool,
    frame_allocator: &'static dyn FrameAllocator,
    network_stack: &'static dyn NetworkStack,
}

impl E1000Nic {
    /// Brings the device and both of its rings to an interrupt-ready state.
    ///
    /// The steps run in this order, each one relying on the previous:
    /// 1. mask interrupts, reset the device, and mask interrupts again,
    /// 2. set up and publish the transmit ring,
    /// 3. set up, fill, and publish the receive ring,
    /// 4. program the address filters, transmitter, receiver, and interrupt mask.
    pub fn init(
        regs: E1000Mmio,
        config: &E1000Config,
        frame_allocator: &'static dyn FrameAllocator,
        network_stack: &'static dyn NetworkStack,
    ) -> Result<E1000Nic, &'static str> {
        Self::reset(&regs);

        let tx_queue = TxQueue::new(E1000TxQueueRegisters(regs.clone()), config.num_tx_descs)?;
        let rx_queue = RxQueue::new(E1000RxQueueRegisters(regs.clone()), config.num_rx_descs, frame_allocator)?;

        Self::write_mac_address(&regs, config.mac_address);
        Self::clear_multicast(&regs);
        Self::tx_init(&regs);
        Self::rx_init(&regs);
        Self::enable_interrupts(&regs);

        Ok(E1000Nic {
            regs,
            tx_queue: MutexIrqSafe::new(tx_queue),
            rx_queue: MutexIrqSafe::new(rx_queue),
            rx_pending: AtomicBool::new(false),
            frame_allocator,
            network_stack,
        })
    }

    /// Resets the device with its interrupts masked.
    fn reset(regs: &E1000Mmio) {
        regs.write(REG_IMC, u32::MAX);
        let ctrl = regs.read(REG_CTRL);
        regs.write(REG_CTRL, ctrl | CTRL_RST);
        // the reset can unmask interrupts again
        regs.write(REG_IMC, u32::MAX);
        fence(Ordering::SeqCst);
    }

    /// Programs the receive address filter so that it only accepts unicast frames for `mac_addr`.
    fn write_mac_address(regs: &E1000Mmio, mac_addr: [u8; 6]) {
        let ral = u32::from_le_bytes([mac_addr[0], mac_addr[1], mac_addr[2], mac_addr[3]]);
        let mut rah = u32::from_le_bytes([mac_addr[4], mac_addr[5], 0, 0]);
        rah.set_bit(RAH_AV_BIT, true);
        regs.write(REG_RAL, ral);
        regs.write(REG_RAH, rah);
        debug!("e1000: programmed MAC address {:02x?}, RAL: {:#X}, RAH: {:#X}", mac_addr, ral, rah);
    }

    /// Clears the multicast table, so no multicast groups are accepted.
    fn clear_multicast(regs: &E1000Mmio) {
        for i in 0..MTA_NUM_ENTRIES {
            regs.write(REG_MTA + i * 4, 0);
        }
    }

    /// Enables the transmitter.
    fn tx_init(regs: &E1000Mmio) {
        let mut tctl = TCTL_EN | TCTL_PSP;
        tctl.set_bits(TCTL_CT, 0x10);
        tctl.set_bits(TCTL_COLD, 0x40);
        regs.write(REG_TCTL, tctl);

        let mut tipg = 0u32;
        tipg.set_bits(TIPG_IPGT, 10);
        tipg.set_bits(TIPG_IPGR1, 8);
        tipg.set_bits(TIPG_IPGR2, 6);
        regs.write(REG_TIPG, tipg);
    }

    /// Enables the receiver: broadcast frames are accepted, buffers are 2048 bytes, and the CRC is stripped.
    fn rx_init(regs: &E1000Mmio) {
        regs.write(REG_RCTL, RCTL_EN | RCTL_BAM | RCTL_BSIZE_2048 | RCTL_SECRC);
    }

    /// Asks for an interrupt after every received packet, and for nothing else.
    fn enable_interrupts(regs: &E1000Mmio) {
        // no delay timers: interrupt right after each write back
        regs.write(REG_RDTR, 0);
        regs.write(REG_RADV, 0);
        regs.write(REG_IMS, INT_RXDW);
    }

    /// Reads back the MAC address from the receive address filter.
    pub fn mac_address(&self) -> [u8; 6] {
        let ral = self.regs.read(REG_RAL).to_le_bytes();
        let rah = self.regs.read(REG_RAH).to_le_bytes();
        [ral[0], ral[1], ral[2], ral[3], rah[0], rah[1]]
    }

    /// Enqueues `buffer` on the transmit ring.
    ///
    /// Returns [`TransmitError::RingFull`] with the buffer if the NIC hasn't finished
    /// with the descriptor at the tail yet; the driver never retries or waits.
    pub fn transmit(&self, buffer: FrameBuffer) -> Result<(), TransmitError> {
        self.tx_queue.lock()
            .send_on_queue(buffer, self.frame_allocator)
            .map_err(TransmitError::RingFull)
    }

    /// The main interrupt handling routine for the e1000 NIC.
    /// This should be invoked from the actual interrupt handler entry point.
    ///
    /// Acknowledges every pending interrupt cause and then drains the receive ring.
    /// Returns the number of frames delivered to the network stack.
    pub fn handle_interrupt(&self) -> usize {
        // without this, the NIC won't raise any further interrupts
        self.regs.write(REG_ICR, u32::MAX);
        self.drain_receive_queue()
    }

    /// Drains the receive queue, or, if another CPU is already draining it,
    /// leaves a request that makes that CPU drain it once more before it lets go.
    ///
    /// Returns the number of frames delivered by this call.
    fn drain_receive_queue(&self) -> usize {
        self.rx_pending.store(true, Ordering::SeqCst);
        let mut delivered = 0;

        // re-checked after unlocking, in case a request arrived just before the unlock
        while self.rx_pending.load(Ordering::SeqCst) {
            let Some(mut rx_queue) = self.rx_queue.try_lock() else {
                trace!("e1000: receive queue is busy, its holder will drain it again");
                break;
            };
            while self.rx_pending.swap(false, Ordering::SeqCst) {
                delivered += rx_queue.drain(self.frame_allocator, self.network_stack);
            }
        }
        delivered
    }
}

impl NetworkInterfaceCard for E1000Nic {
    fn send_packet(&self, buffer: FrameBuffer) -> Result<(), TransmitError> {
        self.transmit(buffer)
    }

    fn poll_receive(&self) -> usize {
        self.drain_receive_queue()
    }

    fn mac_address(&self) -> [u8; 6] {
        E1000Nic::mac_address(self)
    }
}
