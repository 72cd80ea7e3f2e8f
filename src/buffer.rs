//! Transfer memory buffers
//!
//! The transfer engine reads and writes a transfer's bytes long after the
//! transfer was started, so the bytes must live somewhere that outlives the
//! call. A [`TransferMemory`] is a static pool that hands out [`Buffer`]s
//! for that purpose.

use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

/// Static memory for transfer buffers
///
/// Allocate one `static` object, and acquire its allocator once.
///
/// ```
/// use no2usb::TransferMemory;
///
/// static TRANSFER_MEMORY: TransferMemory<1024> = TransferMemory::new();
///
/// let mut alloc = TRANSFER_MEMORY.allocator().unwrap();
/// let staging = alloc.allocate(64).unwrap();
/// assert_eq!(staging.len(), 64);
/// assert!(TRANSFER_MEMORY.allocator().is_none());
/// ```
pub struct TransferMemory<const SIZE: usize> {
    buffer: UnsafeCell<[u8; SIZE]>,
    taken: AtomicBool,
}

unsafe impl<const SIZE: usize> Sync for TransferMemory<SIZE> {}

impl<const SIZE: usize> TransferMemory<SIZE> {
    pub const fn new() -> Self {
        TransferMemory {
            buffer: UnsafeCell::new([0; SIZE]),
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the allocator for this memory
    ///
    /// Returns `None` if the allocator was already taken.
    pub fn allocator(&'static self) -> Option<Allocator> {
        if self.taken.swap(true, Ordering::SeqCst) {
            None
        } else {
            // Safety: the flag guarantees a single allocator over this memory.
            Some(unsafe {
                Allocator::new(NonNull::new_unchecked(self.buffer.get().cast()), SIZE)
            })
        }
    }
}

/// Transfer memory allocator
///
/// Hands out disjoint buffers from the end of the memory, towards the start.
pub struct Allocator {
    start: *mut u8,
    ptr: *mut u8,
}

// Safety: the allocator exclusively owns the remaining memory.
unsafe impl Send for Allocator {}

impl Allocator {
    /// # Safety
    ///
    /// Caller must ensure `start` points to an allocation of size. Caller must
    /// ensure that no one else is using this memory for anything else.
    pub unsafe fn new(start: NonNull<u8>, size: usize) -> Self {
        let start = start.as_ptr();
        let ptr = start.add(size);
        Allocator { start, ptr }
    }

    /// Allocates a buffer of `size` bytes
    ///
    /// Returns `None` if there's not enough memory left.
    pub fn allocate(&mut self, size: usize) -> Option<Buffer> {
        let ptr = self.ptr as usize;
        let new_ptr = ptr.checked_sub(size)?;
        if new_ptr < self.start as usize {
            None
        } else {
            self.ptr = self.ptr.wrapping_sub(size);
            Some(Buffer {
                ptr: NonNull::new(self.ptr)?,
                len: size,
            })
        }
    }

    /// Returns the number of bytes that can still be allocated
    pub fn remaining(&self) -> usize {
        self.ptr as usize - self.start as usize
    }
}

/// A transfer buffer
///
/// The transfer engine accesses the memory behind a `Buffer` while a
/// transfer is active. Only touch the contents, through
/// [`volatile_read`](Buffer::volatile_read) and
/// [`volatile_write`](Buffer::volatile_write), when the endpoint
/// using the buffer is idle.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: a buffer is the only handle to its memory.
unsafe impl Send for Buffer {}

impl Buffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Copy bytes out of the buffer
    ///
    /// Returns the number of bytes copied.
    pub fn volatile_read(&self, buffer: &mut [u8]) -> usize {
        let size = buffer.len().min(self.len);
        buffer
            .iter_mut()
            .take(size)
            .fold(self.ptr.as_ptr(), |src, dst| {
                // Safety: src in bounds of the allocation.
                unsafe {
                    *dst = src.read_volatile();
                    src.add(1)
                }
            });
        size
    }

    /// Copy bytes into the buffer
    ///
    /// Returns the number of bytes copied.
    pub fn volatile_write(&mut self, buffer: &[u8]) -> usize {
        let size = buffer.len().min(self.len);
        buffer
            .iter()
            .take(size)
            .fold(self.ptr.as_ptr(), |dst, src| {
                // Safety: dst in bounds of the allocation.
                unsafe {
                    dst.write_volatile(*src);
                    dst.add(1)
                }
            });
        size
    }
}

#[cfg(test)]
mod test {
    use super::Allocator;
    use core::ptr::NonNull;

    fn allocator(buffer: &mut [u8]) -> Allocator {
        unsafe { Allocator::new(NonNull::new_unchecked(buffer.as_mut_ptr()), buffer.len()) }
    }

    #[test]
    fn allocate_entire_buffer() {
        let mut buffer = [0; 32];
        let mut alloc = allocator(&mut buffer);
        let ptr = alloc.allocate(32);
        assert!(ptr.is_some());
        assert_eq!(ptr.unwrap().as_ptr().as_ptr(), buffer.as_mut_ptr());

        let ptr = alloc.allocate(1);
        assert!(ptr.is_none());
    }

    #[test]
    fn allocate_partial_buffers() {
        let mut buffer = [0; 32];
        let base = buffer.as_mut_ptr();
        let mut alloc = allocator(&mut buffer);

        let ptr = alloc.allocate(7);
        assert!(ptr.is_some());
        assert_eq!(ptr.unwrap().as_ptr().as_ptr(), base.wrapping_add(32 - 7));

        let ptr = alloc.allocate(7);
        assert!(ptr.is_some());
        assert_eq!(ptr.unwrap().as_ptr().as_ptr(), base.wrapping_add(32 - 14));
        assert_eq!(alloc.remaining(), 18);

        let ptr = alloc.allocate(19);
        assert!(ptr.is_none());
    }

    #[test]
    fn read_write() {
        let mut memory = [0; 16];
        let mut alloc = allocator(&mut memory);
        let mut buffer = alloc.allocate(4).unwrap();
        assert_eq!(buffer.volatile_write(&[1, 2, 3, 4, 5]), 4);

        let mut out = [0; 8];
        assert_eq!(buffer.volatile_read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4, 0, 0, 0, 0]);

        let mut out = [0; 2];
        assert_eq!(buffer.volatile_read(&mut out), 2);
        assert_eq!(out, [1, 2]);
    }
}
