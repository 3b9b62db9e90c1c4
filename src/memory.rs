use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::mem::{size_of, align_of};
use std::ptr::NonNull;

//

/// Backing memory owned by one allocator instance
pub(crate) struct MTRegion
{
    head: NonNull<u8>,
    layout: Layout
}

// The region is plain memory; allocators serialize access to it themselves.
unsafe impl Send for MTRegion {}
unsafe impl Sync for MTRegion {}

impl MTRegion
{
    pub(crate) fn new(size: usize, align: usize) -> MTRegion
    {
        assert!(size > 0, "empty memory region");

        let layout = match Layout::from_size_align(size, align) {
            Ok(layout) => layout,
            Err(_) => panic!("{} bytes aligned to {}: invalid region layout", size, align)
        };

        let head = unsafe { alloc_zeroed(layout) };
        let head = match NonNull::new(head) {
            Some(head) => head,
            None => handle_alloc_error(layout)
        };

        MTRegion {
            head,
            layout
        }
    }

    pub(crate) fn size(&self) -> usize
    {
        self.layout.size()
    }

    pub(crate) fn align(&self) -> usize
    {
        self.layout.align()
    }

    /// Byte offset of `ptr` from the region head, if inside the region.
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize>
    {
        let p = ptr.as_ptr() as usize;
        let h = self.head.as_ptr() as usize;

        if p >= h && p < h + self.size() {
            Some(p - h)
        }
        else {
            None
        }
    }

    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8>
    {
        bk_assert!(offset < self.size());

        unsafe { NonNull::new_unchecked(self.head.as_ptr().add(offset)) }
    }

    pub(crate) fn array<V>(&self) -> MTRawArray<'_, V>
    {
        bk_assert!(self.align() >= align_of::<V>());

        MTRawArray {
            head: self.head.as_ptr() as *mut V,
            len: self.size() / size_of::<V>(),
            phantom: PhantomData
        }
    }
}

impl Drop for MTRegion
{
    fn drop(&mut self)
    {
        unsafe { dealloc(self.head.as_ptr(), self.layout) }
    }
}

//

/// Word view over a region; element accesses never create references
pub(crate) struct MTRawArray<'r, V>
{
    head: *mut V,
    len: usize,
    phantom: PhantomData<&'r MTRegion>
}

impl<V> MTRawArray<'_, V>
where V: Copy
{
    pub(crate) fn read(&self, i: usize) -> V
    {
        bk_assert!(i < self.len);

        unsafe { self.head.add(i).read() }
    }

    pub(crate) fn write(&self, i: usize, v: V)
    {
        bk_assert!(i < self.len);

        unsafe { self.head.add(i).write(v) }
    }

    pub(crate) fn len(&self) -> usize
    {
        self.len
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn region_is_aligned_and_zeroed()
    {
        let region = MTRegion::new(256, 64);
        let words = region.array::<u64>();

        assert_eq!(region.ptr_at(0).as_ptr() as usize % 64, 0);
        assert_eq!(words.len(), 32);
        assert!((0..words.len()).all(|i| words.read(i) == 0));

        words.write(3, 0xdead_beef);
        assert_eq!(words.read(3), 0xdead_beef);
    }

    #[test]
    fn offsets_are_bounded()
    {
        let region = MTRegion::new(64, 8);
        let inside = region.ptr_at(63);
        let outside = NonNull::new(inside.as_ptr().wrapping_add(1)).unwrap();

        assert_eq!(region.offset_of(inside), Some(63));
        assert_eq!(region.offset_of(outside), None);
    }
}
