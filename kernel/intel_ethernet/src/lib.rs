//! Hardware structures shared by Intel Ethernet NIC drivers:
//! the legacy descriptor formats and the rules for laying them out in a ring.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate static_assertions;
extern crate bit_field;
extern crate volatile;
extern crate nic_buffers;

pub mod descriptors;

use alloc::boxed::Box;

/// The total byte length of a descriptor ring must be a multiple of this value.
pub const RING_ALIGNMENT: usize = 128;

/// Returns the size in bytes of a ring of `num_descs` descriptors of type `T`.
pub const fn ring_size_in_bytes<T>(num_descs: usize) -> usize {
    num_descs * core::mem::size_of::<T>()
}

/// Checks that a ring of `size_in_bytes` bytes can be handed to the NIC.
///
/// The hardware requires the ring length to be a nonzero multiple of 128 bytes.
/// A ring that violates this must never be truncated or padded to fit.
pub fn check_ring_length(size_in_bytes: usize) -> Result<(), &'static str> {
    if size_in_bytes == 0 {
        Err("descriptor ring is empty")
    } else if size_in_bytes % RING_ALIGNMENT != 0 {
        Err("descriptor ring length is not a multiple of 128 bytes")
    } else if u32::try_from(size_in_bytes).is_err() {
        Err("descriptor ring length does not fit in the length register")
    } else {
        Ok(())
    }
}

/// Allocates a ring of `num_descs` descriptors, each built by `init`.
///
/// The ring is heap-allocated, so it never moves after the NIC has been told its address.
pub fn allocate_ring<T, F: FnMut() -> T>(num_descs: usize, init: F) -> Box<[T]> {
    core::iter::repeat_with(init).take(num_descs).collect()
}
