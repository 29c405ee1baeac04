//! This file contains the register offsets and bit values of the e1000 device,
//! and the MMIO interface that is used to access them.
//!
//! Every register is 32 bits wide and is accessed by its byte offset from the start of the
//! memory-mapped register block. Reads and writes have side effects on the device
//! (e.g., writing the tail registers hands descriptors to the NIC), so they are never
//! cached, merged, or reordered by the compiler.

use core::ptr::NonNull;
use volatile::Volatile;
use nic_queues::{RxQueueRegisters, TxQueueRegisters};

/// The size of the e1000's memory-mapped register block (128 KiB).
pub const REGISTERS_SIZE_BYTES:     usize = 0x20000;

/// Device Control
pub const REG_CTRL:                 usize = 0x0000;
/// Interrupt Cause Read; writing a 1 to a bit clears that cause
pub const REG_ICR:                  usize = 0x00C0;
/// Interrupt Mask Set/Read
pub const REG_IMS:                  usize = 0x00D0;
/// Interrupt Mask Clear
pub const REG_IMC:                  usize = 0x00D8;
/// Receive Control
pub const REG_RCTL:                 usize = 0x0100;
/// Transmit Control
pub const REG_TCTL:                 usize = 0x0400;
/// Transmit Inter Packet Gap
pub const REG_TIPG:                 usize = 0x0410;

pub const REG_RDBAL:                usize = 0x2800;
pub const REG_RDBAH:                usize = 0x2804;
pub const REG_RDLEN:                usize = 0x2808;
pub const REG_RDH:                  usize = 0x2810;
pub const REG_RDT:                  usize = 0x2818;
/// RX Delay Timer
pub const REG_RDTR:                 usize = 0x2820;
/// RX Interrupt Absolute Delay Timer
pub const REG_RADV:                 usize = 0x282C;

pub const REG_TDBAL:                usize = 0x3800;
pub const REG_TDBAH:                usize = 0x3804;
pub const REG_TDLEN:                usize = 0x3808;
pub const REG_TDH:                  usize = 0x3810;
pub const REG_TDT:                  usize = 0x3818;

/// Multicast Table Array, 128 consecutive 32-bit entries
pub const REG_MTA:                  usize = 0x5200;
pub const MTA_NUM_ENTRIES:          usize = 4096 / 32;
/// Receive Address Low: the lower 32 bits of the MAC address filter
pub const REG_RAL:                  usize = 0x5400;
/// Receive Address High: the upper 16 bits of the MAC address filter and the Address Valid bit
pub const REG_RAH:                  usize = 0x5404;
/// RAH: Address Valid
pub const RAH_AV_BIT:               usize = 31;

// CTRL commands
/// Device Reset
pub const CTRL_RST:                 u32 = 1 << 26;

// RCTL commands
/// Receiver Enable
pub const RCTL_EN:                  u32 = 1 << 1;
/// Broadcast Accept Mode
pub const RCTL_BAM:                 u32 = 1 << 15;
pub const RCTL_BSIZE_2048:          u32 = 0 << 16;
/// Strip Ethernet CRC
pub const RCTL_SECRC:               u32 = 1 << 26;

// TCTL commands
/// Transmit Enable
pub const TCTL_EN:                  u32 = 1 << 1;
/// Pad Short Packets
pub const TCTL_PSP:                 u32 = 1 << 3;
/// Collision Threshold
pub const TCTL_CT:                  core::ops::Range<usize> = 4..12;
/// Collision Distance
pub const TCTL_COLD:                core::ops::Range<usize> = 12..22;

// TIPG fields
/// IPG Transmit Time
pub const TIPG_IPGT:                core::ops::Range<usize> = 0..10;
/// IPG Receive Time 1
pub const TIPG_IPGR1:               core::ops::Range<usize> = 10..20;
/// IPG Receive Time 2
pub const TIPG_IPGR2:               core::ops::Range<usize> = 20..30;

/// Interrupt cause: Receiver Descriptor Write Back
pub const INT_RXDW:                 u32 = 1 << 7;


/// The memory-mapped registers of one e1000 device.
///
/// This is a cheap handle that can be cloned so that each queue owns the registers it drives;
/// all clones refer to the same device.
#[derive(Clone)]
pub struct E1000Mmio {
    base: NonNull<u32>,
}

// The register block belongs to the device for the lifetime of the kernel,
// and every access to it is a single volatile 32-bit read or write.
unsafe impl Send for E1000Mmio {}
unsafe impl Sync for E1000Mmio {}

impl E1000Mmio {
    /// Creates a handle to the register block mapped at `base`.
    ///
    /// # Safety
    /// `base` must be the virtual address of the device's register block,
    /// mapped as uncached device memory for `REGISTERS_SIZE_BYTES` bytes,
    /// and it must stay mapped for as long as any handle to it exists.
    pub unsafe fn new(base: usize) -> Result<E1000Mmio, &'static str> {
        if base % core::mem::align_of::<u32>() != 0 {
            return Err("register base address is not 4-byte aligned");
        }
        NonNull::new(base as *mut u32)
            .map(|base| E1000Mmio { base })
            .ok_or("register base address is null")
    }

    fn register(&self, offset: usize) -> *mut Volatile<u32> {
        debug_assert!(offset % 4 == 0 && offset < REGISTERS_SIZE_BYTES, "bad e1000 register offset {:#X}", offset);
        self.base.as_ptr().cast::<u8>().wrapping_add(offset).cast()
    }

    /// Reads the register at byte `offset`.
    pub fn read(&self, offset: usize) -> u32 {
        // SAFETY: `new()`'s contract covers every offset within the register block.
        unsafe { (*self.register(offset)).read() }
    }

    /// Writes `value` to the register at byte `offset`.
    pub fn write(&self, offset: usize, value: u32) {
        // SAFETY: `new()`'s contract covers every offset within the register block.
        unsafe { (*self.register(offset)).write(value) }
    }
}


/// The registers of the e1000's single receive queue.
pub struct E1000RxQueueRegisters(pub E1000Mmio);

impl RxQueueRegisters for E1000RxQueueRegisters {
    fn set_rdbal(&mut self, value: u32) {
        self.0.write(REG_RDBAL, value);
    }
    fn set_rdbah(&mut self, value: u32) {
        self.0.write(REG_RDBAH, value);
    }
    fn set_rdlen(&mut self, value: u32) {
        self.0.write(REG_RDLEN, value);
    }
    fn set_rdh(&mut self, value: u32) {
        self.0.write(REG_RDH, value);
    }
    fn set_rdt(&mut self, value: u32) {
        self.0.write(REG_RDT, value);
    }
    fn rdt(&self) -> u32 {
        self.0.read(REG_RDT)
    }
}

/// The registers of the e1000's single transmit queue.
pub struct E1000TxQueueRegisters(pub E1000Mmio);

impl TxQueueRegisters for E1000TxQueueRegisters {
    fn set_tdbal(&mut self, value: u32) {
        self.0.write(REG_TDBAL, value);
    }
    fn set_tdbah(&mut self, value: u32) {
        self.0.write(REG_TDBAH, value);
    }
    fn set_tdlen(&mut self, value: u32) {
        self.0.write(REG_TDLEN, value);
    }
    fn set_tdh(&mut self, value: u32) {
        self.0.write(REG_TDH, value);
    }
    fn set_tdt(&mut self, value: u32) {
        self.0.write(REG_TDT, value);
    }
    fn tdt(&self) -> u32 {
        self.0.read(REG_TDT)
    }
}

const_assert_eq!(REG_RAH, REG_RAL + 4);
const_assert!(REG_MTA + MTA_NUM_ENTRIES * 4 <= REG_RAL);
