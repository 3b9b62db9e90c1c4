use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use log::trace;
use num_integer::Integer;

use crate::error::{MTError, MTInvalid};
use crate::memory::MTRegion;

//

const NIL: u32 = u32::MAX;

fn pack(tag: u64, idx: u32) -> u64
{
    (tag << 32) | (idx as u64)
}

fn unpack(head: u64) -> (u64, u32)
{
    (head >> 32, head as u32)
}

/// Fixed-size block pool
///
/// Blocks are handed out from a lock-free free stack, so `alloc` and `free`
/// may be called from any thread, including callbacks that must not block.
pub struct MTSlab
{
    region: MTRegion,
    stride: usize,
    block_size: usize,
    n_blocks: usize,
    head: AtomicU64,
    next: Box<[AtomicU32]>,
    used: Box<[AtomicBool]>,
    n_free: AtomicUsize
}

impl MTSlab
{
    /// Creates a slab.
    /// * `block_size` - bytes per block.
    /// * `n_blocks` - number of blocks.
    /// * `align` - alignment of every block; a power of two.
    pub fn new(block_size: usize, n_blocks: usize, align: usize) -> MTSlab
    {
        assert!(block_size > 0, "slab: zero block size");
        assert!(n_blocks > 0 && n_blocks < NIL as usize, "slab: {} blocks unsupported", n_blocks);
        assert!(align.is_power_of_two(), "slab: alignment {} not a power of two", align);

        let stride = Integer::next_multiple_of(&block_size, &align);
        let region = MTRegion::new(stride * n_blocks, align);

        // free stack initially holds 0, 1, .. n_blocks - 1 in order
        let next = (0..n_blocks)
            .map(|i| AtomicU32::new(if i + 1 < n_blocks {(i + 1) as u32} else {NIL}))
            .collect();
        let used = (0..n_blocks).map(|_| AtomicBool::new(false)).collect();

        MTSlab {
            region,
            stride,
            block_size,
            n_blocks,
            head: AtomicU64::new(pack(0, 0)),
            next,
            used,
            n_free: AtomicUsize::new(n_blocks)
        }
    }

    /// Allocates a block.
    /// * Fails with `MTError::OutOfMemory` if every block is in use.
    pub fn alloc(&self) -> Result<NonNull<u8>, MTError>
    {
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            let (tag, idx) = unpack(head);
            if idx == NIL {
                return Err(MTError::OutOfMemory);
            }

            let next = self.next[idx as usize].load(Ordering::Relaxed);

            match self.head.compare_exchange_weak(head, pack(tag.wrapping_add(1), next),
                                                  Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.used[idx as usize].store(true, Ordering::Release);
                    self.n_free.fetch_sub(1, Ordering::AcqRel);

                    trace!("slab: alloc block {}", idx);

                    return Ok(self.region.ptr_at(idx as usize * self.stride));
                },
                Err(h) => {
                    head = h;
                }
            }
        }
    }

    /// Returns a block to the slab.
    /// * `ptr` - pointer returned by `alloc` of this slab.
    /// * Fails with `MTInvalid::ForeignPointer` if `ptr` is not a block start of this slab,
    ///   or `MTInvalid::NotAllocated` if the block is already free.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), MTError>
    {
        let offset = self.region.offset_of(ptr).ok_or(MTInvalid::ForeignPointer)?;

        let (idx, rem) = Integer::div_rem(&offset, &self.stride);
        if rem != 0 || idx >= self.n_blocks {
            return Err(MTInvalid::ForeignPointer.into());
        }

        if !self.used[idx].swap(false, Ordering::AcqRel) {
            return Err(MTInvalid::NotAllocated.into());
        }

        let mut head = self.head.load(Ordering::Acquire);

        loop {
            let (tag, top) = unpack(head);
            self.next[idx].store(top, Ordering::Relaxed);

            match self.head.compare_exchange_weak(head, pack(tag.wrapping_add(1), idx as u32),
                                                  Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(h) => {
                    head = h;
                }
            }
        }

        self.n_free.fetch_add(1, Ordering::AcqRel);

        trace!("slab: free block {}", idx);

        Ok(())
    }

    pub fn num_free(&self) -> usize
    {
        self.n_free.load(Ordering::Acquire)
    }

    pub fn num_used(&self) -> usize
    {
        self.n_blocks - self.num_free()
    }

    /// Gets the usable size of each block in bytes.
    pub fn block_size(&self) -> usize
    {
        self.block_size
    }

    /// Gets the number of blocks.
    pub fn capacity(&self) -> usize
    {
        self.n_blocks
    }
}
