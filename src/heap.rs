use std::ptr::NonNull;

use log::{debug, trace};
use num_integer::Integer;
use parking_lot::Mutex;

use crate::error::{MTError, MTInvalid};
use crate::memory::{MTRegion, MTRawArray};

//

/*
Region layout, in 8-byte chunks

block i:
    [i]     header: bit 0-30 size (chunks), bit 31 used, bit 32-63 size of preceding block
    [i+1..] payload
free block i additionally:
    [i+1]   links: bit 0-31 next free, bit 32-63 prev free
*/

const CHUNK: usize = 8;
const HDR_CHUNKS: usize = 1;
const MIN_CHUNKS: usize = 2;

const SIZE_MASK: u64 = 0x7fff_ffff;
const USED: u64 = 0x8000_0000;
const NIL: u32 = u32::MAX;

type MTWords<'r> = MTRawArray<'r, u64>;

fn hdr_size(words: &MTWords, i: usize) -> usize
{
    (words.read(i) & SIZE_MASK) as usize
}

fn hdr_used(words: &MTWords, i: usize) -> bool
{
    words.read(i) & USED != 0
}

fn hdr_prev(words: &MTWords, i: usize) -> usize
{
    (words.read(i) >> 32) as usize
}

fn set_hdr(words: &MTWords, i: usize, size: usize, used: bool, prev: usize)
{
    let used = if used {USED} else {0};

    words.write(i, (size as u64) | used | ((prev as u64) << 32));
}

fn set_hdr_prev(words: &MTWords, i: usize, prev: usize)
{
    let hdr = words.read(i) & 0xffff_ffff;

    words.write(i, hdr | ((prev as u64) << 32));
}

fn link_next(words: &MTWords, i: usize) -> u32
{
    words.read(i + HDR_CHUNKS) as u32
}

fn link_prev(words: &MTWords, i: usize) -> u32
{
    (words.read(i + HDR_CHUNKS) >> 32) as u32
}

fn set_links(words: &MTWords, i: usize, next: u32, prev: u32)
{
    words.write(i + HDR_CHUNKS, (next as u64) | ((prev as u64) << 32));
}

//

struct MTHeapState
{
    n_chunks: usize,
    free_head: u32,
    starts: Vec<u64>
}

impl MTHeapState
{
    fn is_start(&self, i: usize) -> bool
    {
        self.starts[i / 64] & (1 << (i % 64)) != 0
    }

    fn start_set(&mut self, i: usize)
    {
        self.starts[i / 64] |= 1 << (i % 64);
    }

    fn start_clear(&mut self, i: usize)
    {
        self.starts[i / 64] &= !(1 << (i % 64));
    }

    fn list_push(&mut self, words: &MTWords, i: usize)
    {
        let head = self.free_head;

        set_links(words, i, head, NIL);
        if head != NIL {
            set_links(words, head as usize, link_next(words, head as usize), i as u32);
        }

        self.free_head = i as u32;
    }

    fn list_remove(&mut self, words: &MTWords, i: usize)
    {
        let next = link_next(words, i);
        let prev = link_prev(words, i);

        if prev != NIL {
            set_links(words, prev as usize, next, link_prev(words, prev as usize));
        }
        else {
            self.free_head = next;
        }

        if next != NIL {
            set_links(words, next as usize, link_next(words, next as usize), prev);
        }
    }
}

//

/// Allocation statistics of a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MTHeapStats
{
    /// Size of the backing region.
    pub size: usize,
    /// Payload bytes held by free blocks.
    pub free_bytes: usize,
    /// Payload bytes held by allocated blocks, including rounding.
    pub allocated_bytes: usize,
    /// Header bytes of all blocks.
    pub overhead_bytes: usize,
    /// Largest payload a single allocation could get right now.
    pub max_free_block: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize
}

/// Variable-size first-fit heap over a fixed backing region
///
/// * Allocation never blocks; it fails with `MTError::OutOfMemory`.
/// * Payloads are 8-byte aligned and carry one 8-byte header each.
/// * Freed blocks are coalesced with free neighbours immediately.
pub struct MTHeap
{
    region: MTRegion,
    state: Mutex<MTHeapState>
}

impl MTHeap
{
    /// Creates a heap.
    /// * `size` - size of the backing region in bytes, rounded down to 8 bytes.
    pub fn new(size: usize) -> MTHeap
    {
        let n_chunks = size / CHUNK;
        assert!(n_chunks >= MIN_CHUNKS && n_chunks as u64 <= SIZE_MASK,
                "{} bytes: unsupported heap size", size);

        let region = MTRegion::new(n_chunks * CHUNK, CHUNK);

        let mut state = MTHeapState {
            n_chunks,
            free_head: NIL,
            starts: vec![0; Integer::div_ceil(&n_chunks, &64)]
        };

        let words = region.array::<u64>();
        bk_assert!(words.len() == n_chunks);

        set_hdr(&words, 0, n_chunks, false, 0);
        state.start_set(0);
        state.list_push(&words, 0);

        MTHeap {
            region,
            state: Mutex::new(state)
        }
    }

    fn chunks_for(size: usize) -> Option<usize>
    {
        if size == 0 {
            return None;
        }

        let need = HDR_CHUNKS + Integer::div_ceil(&size, &CHUNK);

        Some(need.max(MIN_CHUNKS))
    }

    /// Allocates a block.
    /// * `size` - requested payload bytes.
    /// * Returns an 8-byte aligned pointer to at least `size` bytes.
    /// * Fails with `MTError::OutOfMemory` if no free block is large enough or `size` is zero.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, MTError>
    {
        let need = Self::chunks_for(size).ok_or(MTError::OutOfMemory)?;

        let words = self.region.array::<u64>();
        let mut st = self.state.lock();

        // first fit

        let mut cur = st.free_head;
        while cur != NIL {
            if hdr_size(&words, cur as usize) >= need {
                break;
            }
            cur = link_next(&words, cur as usize);
        }

        if cur == NIL {
            debug!("heap: no free block for {} bytes", size);
            return Err(MTError::OutOfMemory);
        }

        let i = cur as usize;
        let total = hdr_size(&words, i);
        let prev = hdr_prev(&words, i);

        st.list_remove(&words, i);

        // split off the tail if it can stand as a block

        if total - need >= MIN_CHUNKS {
            let rest = i + need;
            let rest_size = total - need;

            set_hdr(&words, rest, rest_size, false, need);
            st.start_set(rest);
            st.list_push(&words, rest);

            let after = rest + rest_size;
            if after < st.n_chunks {
                set_hdr_prev(&words, after, rest_size);
            }

            set_hdr(&words, i, need, true, prev);
        }
        else {
            set_hdr(&words, i, total, true, prev);
        }

        trace!("heap: alloc {} bytes at chunk {}", size, i);

        Ok(self.region.ptr_at((i + HDR_CHUNKS) * CHUNK))
    }

    /// Frees a block.
    /// * `ptr` - pointer returned by `alloc` of this heap.
    /// * Fails with `MTInvalid::ForeignPointer` if `ptr` is not a block of this heap,
    ///   or `MTInvalid::NotAllocated` if the block is already free.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), MTError>
    {
        let offset = self.region.offset_of(ptr).ok_or(MTInvalid::ForeignPointer)?;

        if offset < HDR_CHUNKS * CHUNK || !Integer::is_multiple_of(&offset, &CHUNK) {
            return Err(MTInvalid::ForeignPointer.into());
        }

        let words = self.region.array::<u64>();
        let mut st = self.state.lock();

        let i = offset / CHUNK - HDR_CHUNKS;

        if !st.is_start(i) {
            return Err(MTInvalid::ForeignPointer.into());
        }
        if !hdr_used(&words, i) {
            return Err(MTInvalid::NotAllocated.into());
        }

        let mut start = i;
        let mut size = hdr_size(&words, i);
        let prev = hdr_prev(&words, i);

        // coalesce with the following block

        let next = i + size;
        if next < st.n_chunks && !hdr_used(&words, next) {
            st.list_remove(&words, next);
            st.start_clear(next);
            size += hdr_size(&words, next);
        }

        // coalesce with the preceding block

        let mut start_prev = prev;
        if i > 0 && !hdr_used(&words, i - prev) {
            start = i - prev;
            st.list_remove(&words, start);
            st.start_clear(i);
            size += hdr_size(&words, start);
            start_prev = hdr_prev(&words, start);
        }

        set_hdr(&words, start, size, false, start_prev);
        st.list_push(&words, start);

        let after = start + size;
        if after < st.n_chunks {
            set_hdr_prev(&words, after, size);
        }

        trace!("heap: free chunk {} ({} chunks free there)", i, size);

        Ok(())
    }

    /// Gets the size of the backing region in bytes.
    pub fn size(&self) -> usize
    {
        self.region.size()
    }

    /// Walks all blocks and gets allocation statistics.
    pub fn stats(&self) -> MTHeapStats
    {
        let words = self.region.array::<u64>();
        let st = self.state.lock();

        let mut stats = MTHeapStats {
            size: self.region.size(),
            ..MTHeapStats::default()
        };

        let mut i = 0;
        while i < st.n_chunks {
            let size = hdr_size(&words, i);
            let payload = (size - HDR_CHUNKS) * CHUNK;

            stats.overhead_bytes += HDR_CHUNKS * CHUNK;

            if hdr_used(&words, i) {
                stats.allocated_bytes += payload;
                stats.allocated_blocks += 1;
            }
            else {
                stats.free_bytes += payload;
                stats.free_blocks += 1;
                stats.max_free_block = stats.max_free_block.max(payload);
            }

            i += size;
        }

        stats
    }

    /// Checks every structural invariant of the heap.
    /// * Returns `false` on the first broken one.
    pub fn validate(&self) -> bool
    {
        let words = self.region.array::<u64>();
        let st = self.state.lock();

        // block chain: sizes, boundary tags, start bits, full coalescing

        let mut n_free = 0;
        let mut prev_size = 0;
        let mut prev_free = false;
        let mut i = 0;
        while i < st.n_chunks {
            let size = hdr_size(&words, i);
            let free = !hdr_used(&words, i);

            if size < MIN_CHUNKS || i + size > st.n_chunks {
                return false;
            }
            if !st.is_start(i) || hdr_prev(&words, i) != prev_size {
                return false;
            }
            if free && prev_free {
                return false;
            }
            if (1..size).any(|j| st.is_start(i + j)) {
                return false;
            }

            if free {
                n_free += 1;
            }

            prev_size = size;
            prev_free = free;
            i += size;
        }

        if i != st.n_chunks {
            return false;
        }

        // free list: every entry free, back links consistent, count matches

        let mut n_list = 0;
        let mut back = NIL;
        let mut cur = st.free_head;
        while cur != NIL {
            let c = cur as usize;

            if n_list > n_free || !st.is_start(c) || hdr_used(&words, c) || link_prev(&words, c) != back {
                return false;
            }

            n_list += 1;
            back = cur;
            cur = link_next(&words, c);
        }

        n_list == n_free
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use proptest::prelude::*;

    fn accounted(heap: &MTHeap) -> bool
    {
        let s = heap.stats();

        s.free_bytes + s.allocated_bytes + s.overhead_bytes == s.size
    }

    #[test]
    fn fresh_heap_is_one_free_block()
    {
        let heap = MTHeap::new(1024);
        let s = heap.stats();

        assert_eq!(s.free_blocks, 1);
        assert_eq!(s.free_bytes, 1024 - CHUNK);
        assert_eq!(s.max_free_block, 1024 - CHUNK);
        assert!(heap.validate());
    }

    #[test]
    fn payloads_are_disjoint_and_aligned()
    {
        let heap = MTHeap::new(512);

        let a = heap.alloc(10).unwrap();
        let b = heap.alloc(24).unwrap();

        assert_eq!(a.as_ptr() as usize % CHUNK, 0);
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 10);

        unsafe {
            a.as_ptr().write_bytes(0xaa, 10);
            b.as_ptr().write_bytes(0xbb, 24);
            assert_eq!(a.as_ptr().read(), 0xaa);
        }

        assert!(heap.validate());
        assert!(accounted(&heap));
    }

    #[test]
    fn adjacent_frees_coalesce()
    {
        let heap = MTHeap::new(1024);

        let a = heap.alloc(64).unwrap();
        let b = heap.alloc(64).unwrap();
        let c = heap.alloc(64).unwrap();

        heap.free(a).unwrap();
        heap.free(b).unwrap();

        // a and b merged: two payloads plus b's header, then the tail after c
        let s = heap.stats();
        assert_eq!(s.free_blocks, 2);
        assert_eq!(s.free_bytes, (64 * 2 + CHUNK) + (1024 - 3 * 72 - CHUNK));

        heap.free(c).unwrap();
        assert_eq!(heap.stats().free_blocks, 1);
        assert!(heap.validate());
    }

    #[test]
    fn coalesce_with_both_neighbours()
    {
        let heap = MTHeap::new(256);

        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(16).unwrap();
        let c = heap.alloc(16).unwrap();
        let d = heap.alloc(16).unwrap();

        heap.free(a).unwrap();
        heap.free(c).unwrap();
        heap.free(b).unwrap();

        let s = heap.stats();
        assert_eq!(s.free_blocks, 2);
        assert_eq!(s.allocated_blocks, 1);
        assert!(heap.validate());

        heap.free(d).unwrap();
        assert_eq!(heap.stats().free_bytes, 256 - CHUNK);
    }

    #[test]
    fn double_free_and_foreign_pointers_are_rejected()
    {
        let heap = MTHeap::new(256);
        let other = MTHeap::new(256);

        let a = heap.alloc(32).unwrap();
        let b = heap.alloc(32).unwrap();
        let interior = NonNull::new(a.as_ptr().wrapping_add(CHUNK)).unwrap();

        assert_eq!(heap.free(interior), Err(MTError::InvalidState(MTInvalid::ForeignPointer)));
        assert_eq!(other.free(a), Err(MTError::InvalidState(MTInvalid::ForeignPointer)));

        heap.free(a).unwrap();
        assert_eq!(heap.free(a), Err(MTError::InvalidState(MTInvalid::NotAllocated)));

        heap.free(b).unwrap();
        assert!(heap.validate());
    }

    #[test]
    fn fragmentation_is_visible()
    {
        let heap = MTHeap::new(256);

        let blocks: Vec<_> = (0..8).map(|_| heap.alloc(24).unwrap()).collect();
        assert_eq!(heap.alloc(8), Err(MTError::OutOfMemory));

        for b in blocks.iter().step_by(2) {
            heap.free(*b).unwrap();
        }

        // 4 free blocks of 24 bytes each, none adjacent
        let s = heap.stats();
        assert_eq!(s.free_bytes, 4 * 24);
        assert_eq!(heap.alloc(48), Err(MTError::OutOfMemory));
        assert!(heap.alloc(24).is_ok());
    }

    #[test]
    fn zero_size_fails()
    {
        let heap = MTHeap::new(64);

        assert_eq!(heap.alloc(0), Err(MTError::OutOfMemory));
    }

    #[test]
    fn exact_fit_without_split()
    {
        let heap = MTHeap::new(64);

        // 64 bytes = 8 chunks; 7 payload chunks take the whole region
        let a = heap.alloc(56).unwrap();
        assert_eq!(heap.stats().free_blocks, 0);
        assert_eq!(heap.alloc(1), Err(MTError::OutOfMemory));

        heap.free(a).unwrap();
        assert!(heap.alloc(56).is_ok());
    }

    proptest! {
        #[test]
        fn random_sequences_keep_invariants(ops in prop::collection::vec((any::<bool>(), 1usize..200, any::<prop::sample::Index>()), 1..120))
        {
            let heap = MTHeap::new(2048);
            let mut live: Vec<NonNull<u8>> = Vec::new();

            for (is_alloc, size, pick) in ops {
                if is_alloc || live.is_empty() {
                    if let Ok(p) = heap.alloc(size) {
                        live.push(p);
                    }
                }
                else {
                    let p = live.swap_remove(pick.index(live.len()));
                    prop_assert!(heap.free(p).is_ok());
                }

                prop_assert!(heap.validate());
                prop_assert!(accounted(&heap));
                prop_assert_eq!(heap.stats().allocated_blocks, live.len());
            }

            for p in live {
                prop_assert!(heap.free(p).is_ok());
            }

            let s = heap.stats();
            prop_assert_eq!(s.free_blocks, 1);
            prop_assert_eq!(s.free_bytes, 2048 - CHUNK);
        }
    }
}
