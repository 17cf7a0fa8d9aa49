//! Guard-page bracketed stack allocations for fibers.

use std::ffi::c_void;

use rustix::mm::{self, MapFlags, MprotectFlags, ProtFlags};

use crate::FiberError;

/// A fixed-size stack region flanked by inaccessible guard pages.
///
/// The reservation is `pages + 2` system pages: one guard page below the
/// usable region and one above it. Any read or write that runs off either
/// end of the stack faults immediately instead of silently corrupting
/// neighbouring memory. Fiber stacks are fixed-size, so failing fast is the
/// only acceptable overflow behaviour.
///
/// Stacks grow from high addresses to low on the supported architectures,
/// so [`top`](StackRegion::top) hands out the high end of the usable region
/// (minus one page of slack for the first frame) as the initial stack
/// pointer.
#[derive(Debug)]
pub struct StackRegion {
    /// Start of the whole reservation, including guard pages.
    allocation: *mut c_void,

    /// Size of the whole reservation in bytes, including guard pages.
    allocation_len: usize,

    /// Cached host page size.
    page_size: usize,
}

impl StackRegion {
    /// Map a new region with `pages` usable pages.
    pub fn new(pages: usize) -> Result<StackRegion, FiberError> {
        let page_size = rustix::param::page_size();
        let allocation_len = (pages + 2) * page_size;

        // Safety: fresh anonymous mapping at an address chosen by the host.
        let allocation = unsafe {
            mm::mmap_anonymous(
                std::ptr::null_mut(),
                allocation_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?
        };

        let region = StackRegion {
            allocation,
            allocation_len,
            page_size,
        };

        // Revoke all access to the head and tail pages. The mapping is owned
        // by `region` at this point, so an mprotect failure unmaps it on the
        // way out.
        unsafe {
            mm::mprotect(region.allocation, page_size, MprotectFlags::empty())?;
            mm::mprotect(
                region.allocation.byte_add((pages + 1) * page_size),
                page_size,
                MprotectFlags::empty(),
            )?;
        }

        Ok(region)
    }

    /// Host page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Start of the usable region, just past the head guard page.
    pub fn base(&self) -> *mut u8 {
        // Safety: the head guard page is within the reservation.
        unsafe { self.allocation.byte_add(self.page_size).cast() }
    }

    /// Usable bytes, excluding the guard pages.
    pub fn len(&self) -> usize {
        self.allocation_len - 2 * self.page_size
    }

    /// Whether the usable region is empty. Always false for a mapped region.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Initial stack pointer for a fiber using this region.
    ///
    /// One page below the high end of the usable region, leaving slack for
    /// the prologue of the first frame pushed onto the stack.
    pub fn top(&self) -> *mut u8 {
        // Safety: len() >= page_size for any region constructed with pages >= 1.
        unsafe { self.base().add(self.len() - self.page_size) }
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        // Safety: the full reservation was mapped in new() and is unmapped
        // exactly once.
        unsafe {
            let _ = mm::munmap(self.allocation, self.allocation_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_requested_pages() {
        let stack = StackRegion::new(10).unwrap();

        assert_eq!(stack.len(), 10 * stack.page_size());
        assert!(!stack.is_empty());
    }

    #[test]
    fn usable_region_is_writable() {
        let stack = StackRegion::new(4).unwrap();

        // Touch the first and last usable bytes. The guard pages would fault
        // if the offsets were wrong.
        unsafe {
            stack.base().write(0xaa);
            stack.base().add(stack.len() - 1).write(0xbb);

            assert_eq!(stack.base().read(), 0xaa);
            assert_eq!(stack.base().add(stack.len() - 1).read(), 0xbb);
        }
    }

    #[test]
    fn top_sits_below_tail_guard() {
        let stack = StackRegion::new(10).unwrap();

        let offset = stack.top() as usize - stack.base() as usize;
        assert_eq!(offset, stack.len() - stack.page_size());
    }
}
