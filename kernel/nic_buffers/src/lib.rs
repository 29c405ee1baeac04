//! Defines the buffers that are used to send and receive packets,
//! and the allocator interface through which the NIC driver obtains and returns them.
//!
//! A [`FrameBuffer`] is an owned handle: it is moved (never copied) when it is handed
//! to the hardware for transmission, when it is stored in a receive ring slot,
//! and when it is delivered up to the network stack.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use alloc::{
    boxed::Box,
    sync::Arc,
};

/// The size in bytes of the backing region of every frame buffer.
/// This matches the 2048-byte receive buffer size programmed into the NIC.
pub const FRAME_BUFFER_SIZE: usize = 2048;

/// The default amount of headroom reserved in front of a frame,
/// which leaves space for the network stack to prepend protocol headers.
pub const DEFAULT_HEADROOM: usize = 128;


/// A physical memory address, as seen by a DMA-capable device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    pub const fn new(value: usize) -> PhysicalAddress {
        PhysicalAddress(value)
    }

    /// Returns the address of the given pointer.
    ///
    /// The kernel identity-maps physical memory,
    /// so a virtual address is also the physical address the device sees.
    pub fn from_ptr<T>(ptr: *const T) -> PhysicalAddress {
        PhysicalAddress(ptr as usize)
    }

    pub const fn value(&self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for PhysicalAddress {
    type Output = PhysicalAddress;
    fn add(self, rhs: usize) -> PhysicalAddress {
        PhysicalAddress(self.0 + rhs)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#X}", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#X}", self.0)
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}


/// A buffer that stores one network frame in flight.
///
/// The frame occupies `length` bytes starting at `head` within a fixed-size backing region.
/// The bytes in front of `head` are headroom, and the bytes after the frame are tailroom.
/// Auto-dereferences into a byte slice covering only the valid frame bytes.
///
/// The backing region is heap-allocated and never moves, so the address
/// reported by [`FrameBuffer::phys_addr()`] stays valid while the buffer is owned
/// by a descriptor ring, no matter where the handle itself is moved.
///
/// A buffer obtained from a [`HeapFrameAllocator`] stops counting against
/// that allocator's limit as soon as it is dropped, wherever that happens.
pub struct FrameBuffer {
    storage: Box<[u8; FRAME_BUFFER_SIZE]>,
    head: usize,
    length: u16,
    /// The outstanding-buffer count of the allocator this buffer came from.
    owner: Option<Arc<AtomicUsize>>,
}

impl FrameBuffer {
    /// Creates a new empty `FrameBuffer` with `headroom` bytes reserved in front of the frame.
    pub fn new(headroom: usize) -> Result<FrameBuffer, &'static str> {
        if headroom > FRAME_BUFFER_SIZE {
            return Err("FrameBuffer::new(): headroom is larger than the buffer");
        }
        Ok(FrameBuffer {
            storage: Box::new([0; FRAME_BUFFER_SIZE]),
            head: headroom,
            length: 0,
            owner: None,
        })
    }

    /// The physical address of the first byte of the frame.
    /// This is the address that is written into a NIC descriptor.
    pub fn phys_addr(&self) -> PhysicalAddress {
        PhysicalAddress::from_ptr(self.storage.as_ptr()) + self.head
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// Sets the length of the frame, e.g., to the number of bytes the NIC wrote into it.
    ///
    /// Returns an error if the frame would extend past the end of the backing region.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if self.head + usize::from(length) > FRAME_BUFFER_SIZE {
            Err("FrameBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }

    pub fn capacity(&self) -> usize {
        FRAME_BUFFER_SIZE
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn tailroom(&self) -> usize {
        FRAME_BUFFER_SIZE - self.head - usize::from(self.length)
    }

    /// Prepends `len` bytes to the front of the frame, taking them from the headroom.
    /// Returns the newly-exposed bytes, or `None` if there is not enough headroom.
    pub fn push(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.head {
            return None;
        }
        self.head -= len;
        self.length += len as u16;
        Some(&mut self.storage[self.head .. self.head + len])
    }

    /// Strips `len` bytes from the front of the frame, e.g., a parsed header.
    /// Returns the stripped bytes, or `None` if the frame is shorter than `len`.
    pub fn pull(&mut self, len: usize) -> Option<&[u8]> {
        if len > usize::from(self.length) {
            return None;
        }
        let start = self.head;
        self.head += len;
        self.length -= len as u16;
        Some(&self.storage[start .. start + len])
    }

    /// Appends `len` bytes to the end of the frame, taking them from the tailroom.
    /// Returns the newly-exposed bytes, or `None` if there is not enough tailroom.
    pub fn put(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.tailroom() {
            return None;
        }
        let tail = self.head + usize::from(self.length);
        self.length += len as u16;
        Some(&mut self.storage[tail .. tail + len])
    }

    /// Removes `len` bytes from the end of the frame.
    /// Returns the removed bytes, or `None` if the frame is shorter than `len`.
    pub fn trim(&mut self, len: usize) -> Option<&[u8]> {
        if len > usize::from(self.length) {
            return None;
        }
        self.length -= len as u16;
        let tail = self.head + usize::from(self.length);
        Some(&self.storage[tail .. tail + len])
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // `set_length()`, `push()` and `put()` never let the frame extend past the backing region.
        &self.storage[self.head .. self.head + usize::from(self.length)]
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.storage[self.head .. self.head + usize::from(self.length)]
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some(outstanding) = self.owner.take() {
            outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FrameBuffer {{ phys_addr: {:#X}, headroom: {}, length: {} }}",
            self.phys_addr(), self.head, self.length)
    }
}


/// The interface through which the NIC driver obtains and gives back frame buffers.
///
/// Implementations must be safe to call from an interrupt handler,
/// because the receive path replenishes its ring from there.
pub trait FrameAllocator: Send + Sync {
    /// Allocates a new empty frame buffer with `headroom` bytes reserved in front of the frame.
    /// Returns `None` if no buffer could be allocated.
    fn allocate(&self, headroom: usize) -> Option<FrameBuffer>;

    /// Gives back a frame buffer that is no longer needed.
    fn release(&self, buffer: FrameBuffer) {
        drop(buffer);
    }
}


/// A frame allocator backed by the kernel heap.
///
/// It can be given a limit on the number of buffers that may be outstanding at once,
/// i.e., allocated and not yet dropped. A buffer is dropped either when it is given back
/// via [`FrameAllocator::release()`] or when its last owner (e.g., the network stack) is done with it.
pub struct HeapFrameAllocator {
    limit: Option<usize>,
    outstanding: Arc<AtomicUsize>,
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl HeapFrameAllocator {
    /// Creates an allocator with no limit on outstanding buffers.
    pub fn new() -> HeapFrameAllocator {
        HeapFrameAllocator {
            limit: None,
            outstanding: Arc::new(AtomicUsize::new(0)),
            allocated: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Creates an allocator that fails once `limit` buffers are outstanding.
    pub fn with_limit(limit: usize) -> HeapFrameAllocator {
        HeapFrameAllocator {
            limit: Some(limit),
            outstanding: Arc::new(AtomicUsize::new(0)),
            allocated: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// The number of buffers that have been allocated and not yet dropped.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// The total number of successful allocations.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// The total number of buffers given back via `release()`.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }
}

impl Default for HeapFrameAllocator {
    fn default() -> Self {
        HeapFrameAllocator::new()
    }
}

impl FrameAllocator for HeapFrameAllocator {
    fn allocate(&self, headroom: usize) -> Option<FrameBuffer> {
        let limit = self.limit.unwrap_or(usize::MAX);
        if self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| if n < limit { Some(n + 1) } else { None })
            .is_err()
        {
            trace!("HeapFrameAllocator: limit of {} outstanding buffers reached", limit);
            return None;
        }

        match FrameBuffer::new(headroom) {
            Ok(mut buffer) => {
                buffer.owner = Some(Arc::clone(&self.outstanding));
                self.allocated.fetch_add(1, Ordering::AcqRel);
                Some(buffer)
            }
            Err(e) => {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                warn!("HeapFrameAllocator: {}", e);
                None
            }
        }
    }

    fn release(&self, buffer: FrameBuffer) {
        // dropping the buffer gives back its slot
        drop(buffer);
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}
