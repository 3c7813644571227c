//! The kernel malloc: a `GlobalAlloc` over size-class object caches.
//!
//! Eight power-of-two classes up to 2 KiB cover the kernel's small
//! allocations; anything larger goes through the large-allocation hook,
//! which init points at the kernel virtual-address allocator once that
//! exists. Before then, large allocations fail loudly; early-boot code
//! allocates small, by design of the boot order.
//!
//! The `#[global_allocator]` static only exists in freestanding builds;
//! hosted builds (tests) keep std's.

use crate::{ObjectCache, SlabSource};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use spin::Once;

/// The size classes. Each backs one object cache.
const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Multi-page allocation hooks: `(grow(bytes) -> ptr, release(ptr, bytes))`.
pub struct LargeAllocHooks {
    pub grow: fn(usize) -> Option<NonNull<u8>>,
    pub release: fn(NonNull<u8>, usize),
}

static CACHES: Once<[ObjectCache; SIZE_CLASSES.len()]> = Once::new();
static LARGE_HOOKS: Once<LargeAllocHooks> = Once::new();

fn caches() -> &'static [ObjectCache; SIZE_CLASSES.len()] {
    CACHES.call_once(|| SIZE_CLASSES.map(ObjectCache::new))
}

/// Installs the multi-page allocation path, normally backed by mapped
/// kernel regions.
pub fn set_large_alloc_hooks(hooks: LargeAllocHooks) {
    LARGE_HOOKS.call_once(|| hooks);
}

fn class_index(layout: Layout) -> Option<usize> {
    let want = layout.size().max(layout.align());
    SIZE_CLASSES.iter().position(|&class| class >= want)
}

/// The allocator type behind the kernel's `#[global_allocator]`.
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match class_index(layout) {
            Some(idx) => caches()[idx]
                .alloc()
                .map(|obj| obj.as_ptr())
                .unwrap_or(ptr::null_mut()),
            None => match LARGE_HOOKS.get() {
                Some(hooks) => (hooks.grow)(layout.size())
                    .map(|p| p.as_ptr())
                    .unwrap_or(ptr::null_mut()),
                None => {
                    error!("kernel heap: large allocation of {} bytes before KVA is up", layout.size());
                    ptr::null_mut()
                }
            },
        }
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, layout: Layout) {
        let Some(obj) = NonNull::new(ptr_in) else { return };
        match class_index(layout) {
            Some(idx) => unsafe { caches()[idx].free(obj) },
            None => {
                if let Some(hooks) = LARGE_HOOKS.get() {
                    (hooks.release)(obj, layout.size());
                }
            }
        }
    }
}

#[cfg(all(target_os = "none", not(test)))]
#[global_allocator]
static KERNEL_HEAP: KernelHeap = KernelHeap;

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn size_classes_round_trip() {
        let heap = KernelHeap;
        let layout = Layout::from_size_align(48, 8).unwrap();
        let a = unsafe { heap.alloc(layout) };
        assert!(!a.is_null());
        assert_eq!(a as usize % 8, 0);
        unsafe {
            a.write_bytes(0x5A, 48);
            heap.dealloc(a, layout);
        }

        // Alignment can push an allocation into a bigger class.
        let aligned = Layout::from_size_align(8, 256).unwrap();
        assert_eq!(class_index(aligned), Some(4));

        // Oversize allocations fail cleanly with no hooks installed.
        let big = Layout::from_size_align(16384, 8).unwrap();
        assert!(unsafe { heap.alloc(big) }.is_null());
    }
}
