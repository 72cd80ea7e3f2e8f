//! Shared packet memory
//!
//! The core keeps packet payloads in two dedicated memories, one for
//! packets received from the host and one for packets sent to the host.
//! Both only support aligned 32-bit accesses. Offsets are byte offsets, and
//! always come from the packet allocator, which keeps them word aligned.

use crate::vcell::VCell;

const WORD: usize = core::mem::size_of::<u32>();

/// Word-wise access to the RX and TX packet memories
pub struct PacketMemory {
    rx: *const VCell<u32>,
    tx: *const VCell<u32>,
}

// Safety: the memories are owned by the driver that owns this object.
unsafe impl Send for PacketMemory {}

impl PacketMemory {
    /// Create a packet memory accessor
    ///
    /// # Safety
    ///
    /// `rx` and `tx` must be the word-aligned base addresses of the core's
    /// packet memories, and must stay valid for as long as the object
    /// exists.
    pub unsafe fn new(rx: *const (), tx: *const ()) -> Self {
        PacketMemory {
            rx: rx.cast(),
            tx: tx.cast(),
        }
    }

    /// Copy `src` into TX memory at byte offset `dst`
    ///
    /// A trailing partial word is padded with zeros; the core only sends
    /// the bytes that the BD's length names. Never reads past `src`.
    pub fn write(&self, dst: usize, src: &[u8]) {
        debug_assert_eq!(dst % WORD, 0);
        let base = dst / WORD;
        for (idx, chunk) in src.chunks(WORD).enumerate() {
            let mut word = [0u8; WORD];
            word[..chunk.len()].copy_from_slice(chunk);
            // Safety: offsets come from the allocator, which stays inside
            // the packet memory.
            unsafe { (*self.tx.add(base + idx)).write(u32::from_ne_bytes(word)) };
        }
    }

    /// Copy from RX memory at byte offset `src` into all of `dst`
    ///
    /// A trailing partial word is read once, and only its leading bytes
    /// are kept.
    pub fn read(&self, dst: &mut [u8], src: usize) {
        debug_assert_eq!(src % WORD, 0);
        let base = src / WORD;
        for (idx, chunk) in dst.chunks_mut(WORD).enumerate() {
            // Safety: see write().
            let word = unsafe { (*self.rx.add(base + idx)).read() }.to_ne_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}
