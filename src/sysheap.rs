use std::ptr::NonNull;

use log::debug;
use parking_lot::{const_mutex, Mutex};

use crate::error::{MTError, MTInvalid};
use crate::heap::{MTHeap, MTHeapStats};
use crate::kernel::mtkernel_get;

//

static O_SYSHEAP: Mutex<Option<MTHeap>> = const_mutex(None);

fn with_sysheap<R>(f: impl FnOnce(&MTHeap) -> R) -> R
{
    let mut sysheap = O_SYSHEAP.lock();

    let heap = sysheap.get_or_insert_with(|| {
        let size = mtkernel_get().config().sys_heap_size;
        debug!("sysheap: created with {} bytes", size);

        MTHeap::new(size)
    });

    f(heap)
}

/// Creates the system heap with an explicit size.
/// * `size` - size of the backing region in bytes.
/// * Returns `false` if the system heap already exists; it is left as is.
pub fn sysheap_init(size: usize) -> bool
{
    let mut sysheap = O_SYSHEAP.lock();

    if sysheap.is_some() {
        return false;
    }

    debug!("sysheap: created with {} bytes", size);
    *sysheap = Some(MTHeap::new(size));

    true
}

/// Allocates from the system heap, creating it on first use.
pub fn mt_malloc(size: usize) -> Result<NonNull<u8>, MTError>
{
    with_sysheap(|heap| heap.alloc(size))
}

/// Frees a block of the system heap.
pub fn mt_free(ptr: NonNull<u8>) -> Result<(), MTError>
{
    let sysheap = O_SYSHEAP.lock();

    match sysheap.as_ref() {
        Some(heap) => heap.free(ptr),
        None => Err(MTInvalid::ForeignPointer.into())
    }
}

pub fn sysheap_stats() -> MTHeapStats
{
    with_sysheap(|heap| heap.stats())
}

/// Releases the system heap.
/// * Fails with `MTInvalid::InUse` while any block is allocated.
/// * The next `mt_malloc` or `sysheap_init` creates a fresh one.
pub fn sysheap_teardown() -> Result<(), MTError>
{
    let mut sysheap = O_SYSHEAP.lock();

    if let Some(heap) = sysheap.as_ref() {
        if heap.stats().allocated_blocks > 0 {
            return Err(MTInvalid::InUse.into());
        }
    }

    if sysheap.take().is_some() {
        debug!("sysheap: released");
    }

    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    // single test: the system heap is process-global
    #[test]
    fn lifecycle()
    {
        sysheap_teardown().unwrap();
        assert!(sysheap_init(256));
        assert!(!sysheap_init(512));
        assert_eq!(sysheap_stats().size, 256);

        let p = mt_malloc(100).unwrap();
        assert_eq!(sysheap_teardown(), Err(MTError::InvalidState(MTInvalid::InUse)));

        mt_free(p).unwrap();
        assert_eq!(mt_free(p), Err(MTError::InvalidState(MTInvalid::NotAllocated)));
        sysheap_teardown().unwrap();

        assert_eq!(mt_free(p), Err(MTError::InvalidState(MTInvalid::ForeignPointer)));

        // recreated lazily with the configured size
        let q = mt_malloc(8).unwrap();
        assert_eq!(sysheap_stats().size, mtkernel_get().config().sys_heap_size);
        mt_free(q).unwrap();
    }
}
