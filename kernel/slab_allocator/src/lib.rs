//! Fixed-size object caches built from page-sized slabs.
//!
//! Each cache keeps three slab lists: Empty (no objects handed out),
//! Partial, and Full. Allocation prefers a Partial slab, then revives an
//! Empty one, and only then grows by one page. Frees return the object to
//! its slab's free list and migrate the slab between lists as its
//! utilization changes.
//!
//! The first pages come from a statically-reserved bootstrap pool, so
//! caches (and the kernel malloc built on them) exist before the frame
//! allocator's full initialization. Once kernel virtual memory works, init
//! installs a page supplier and growth switches over to mapped pages.
//!
//! Slab layout: the header sits at the start of its page, objects follow
//! at an 8-byte-aligned offset, and a free object's first word links the
//! free list. An object pointer is mapped back to its slab by masking off
//! the page offset, which is why every slab page must be page-aligned.

#![no_std]

#[macro_use]
extern crate log;

pub mod kernel_heap;

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_config::memory::{PAGE_SIZE, SLAB_BOOTSTRAP_POOL_SIZE};
use spin::Once;
use sync_irq::IplMutex;

/// Minimum object alignment and size granule.
const OBJ_ALIGN: usize = 8;
/// Objects begin at this offset inside a slab page; the header must fit.
const OBJ_START: usize = 64;

const _: () = assert!(core::mem::size_of::<SlabHeader>() <= OBJ_START);

/// Where a cache gets fresh slab pages from.
#[derive(Clone, Copy)]
pub struct SlabSource {
    /// Returns one page-aligned, writable page of `PAGE_SIZE` bytes.
    pub grow: fn() -> Option<NonNull<u8>>,
    /// Returns a page previously handed out by `grow`, or `None` if pages
    /// from this source are never returned (the bootstrap pool).
    pub release: Option<fn(NonNull<u8>)>,
}

/// The statically-reserved bootstrap pool, carved into slab pages until
/// the real page supplier is installed.
#[repr(align(4096))]
struct BootstrapPool(UnsafeCell<[u8; SLAB_BOOTSTRAP_POOL_SIZE]>);

// The bump cursor below is the only writer coordination this needs.
unsafe impl Sync for BootstrapPool {}

static BOOTSTRAP_POOL: BootstrapPool = BootstrapPool(UnsafeCell::new([0; SLAB_BOOTSTRAP_POOL_SIZE]));
static BOOTSTRAP_CURSOR: AtomicUsize = AtomicUsize::new(0);

fn bootstrap_grow() -> Option<NonNull<u8>> {
    let offset = BOOTSTRAP_CURSOR.fetch_add(PAGE_SIZE, Ordering::Relaxed);
    if offset + PAGE_SIZE > SLAB_BOOTSTRAP_POOL_SIZE {
        error!("slab_allocator: bootstrap pool exhausted");
        return None;
    }
    let base = BOOTSTRAP_POOL.0.get() as *mut u8;
    NonNull::new(unsafe { base.add(offset) })
}

/// The post-bootstrap page supplier, installed once KVA mapping works.
static PAGE_SUPPLIER: Once<SlabSource> = Once::new();

/// Installs the mapped-page supplier used by every cache created with
/// [`ObjectCache::new`] from then on.
pub fn set_page_supplier(source: SlabSource) {
    PAGE_SUPPLIER.call_once(|| source);
}

fn default_source() -> SlabSource {
    PAGE_SUPPLIER
        .get()
        .copied()
        .unwrap_or(SlabSource { grow: bootstrap_grow, release: None })
}

/// Which of the three lists a slab currently sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlabList {
    Empty,
    Partial,
    Full,
}

/// Lives at the start of every slab page.
struct SlabHeader {
    next: Option<NonNull<SlabHeader>>,
    prev: Option<NonNull<SlabHeader>>,
    free_head: Option<NonNull<FreeObj>>,
    in_use: usize,
    list: SlabList,
    from_bootstrap: bool,
}

/// A free object's first word.
struct FreeObj {
    next: Option<NonNull<FreeObj>>,
}

struct CacheInner {
    obj_size: usize,
    /// Offset of the first object within a slab page.
    first_off: usize,
    objs_per_slab: usize,
    source: SlabSource,
    heads: [Option<NonNull<SlabHeader>>; 3],
    obj_count: usize,
    slab_count: usize,
}

// Raw slab pointers never leave the cache's lock.
unsafe impl Send for CacheInner {}

/// A cache of fixed-size objects.
pub struct ObjectCache {
    inner: IplMutex<CacheInner>,
    ctor: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
}

impl ObjectCache {
    /// Creates a cache for objects of `obj_size` bytes using the default
    /// page source (bootstrap pool, then the installed supplier).
    pub fn new(obj_size: usize) -> ObjectCache {
        Self::with_source(obj_size, None, None, default_source())
    }

    /// Creates a cache with optional per-object constructor/destructor
    /// hooks. The constructor runs once for each object when its slab is
    /// carved; the destructor runs when the cache is destroyed.
    pub fn with_hooks(
        obj_size: usize,
        ctor: Option<fn(*mut u8)>,
        dtor: Option<fn(*mut u8)>,
    ) -> ObjectCache {
        Self::with_source(obj_size, ctor, dtor, default_source())
    }

    /// Creates a cache drawing pages from an explicit source.
    pub fn with_source(
        obj_size: usize,
        ctor: Option<fn(*mut u8)>,
        dtor: Option<fn(*mut u8)>,
        source: SlabSource,
    ) -> ObjectCache {
        let stride = obj_stride(obj_size);
        // Objects are aligned to the largest power of two dividing their
        // stride, so power-of-two classes come back naturally aligned.
        let align = 1usize << stride.trailing_zeros().min(12);
        let first_off = OBJ_START.next_multiple_of(align);
        let objs_per_slab = PAGE_SIZE.saturating_sub(first_off) / stride;
        assert!(objs_per_slab > 0, "object size too large for a one-page slab");
        ObjectCache {
            inner: IplMutex::new(CacheInner {
                obj_size: stride,
                first_off,
                objs_per_slab,
                source,
                heads: [None, None, None],
                obj_count: 0,
                slab_count: 0,
            }),
            ctor,
            dtor,
        }
    }

    /// Allocates one object. Returns `None` when the cache cannot grow.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();

        let slab = match inner.heads[SlabList::Partial as usize] {
            Some(slab) => slab,
            None => match inner.heads[SlabList::Empty as usize] {
                Some(slab) => {
                    inner.move_slab(slab, SlabList::Partial);
                    slab
                }
                None => inner.grow(self.ctor)?,
            },
        };

        let obj = unsafe {
            let header = &mut *slab.as_ptr();
            let free = header.free_head.expect("slab on partial list with no free object");
            header.free_head = free.as_ref().next;
            header.in_use += 1;
            free.cast::<u8>()
        };
        inner.obj_count += 1;

        let full = unsafe { (*slab.as_ptr()).in_use == inner.objs_per_slab };
        if full {
            inner.move_slab(slab, SlabList::Full);
        } else if unsafe { (*slab.as_ptr()).list } == SlabList::Empty {
            inner.move_slab(slab, SlabList::Partial);
        }
        Some(obj)
    }

    /// Returns an object to its slab.
    ///
    /// # Safety
    /// `obj` must have come from [`alloc`](Self::alloc) on this cache and
    /// must not be used afterwards.
    pub unsafe fn free(&self, obj: NonNull<u8>) {
        let mut inner = self.inner.lock();
        let slab_addr = (obj.as_ptr() as usize) & !(PAGE_SIZE - 1);
        let slab = NonNull::new(slab_addr as *mut SlabHeader)
            .expect("slab free: null slab page");

        unsafe {
            let header = &mut *slab.as_ptr();
            let free = obj.cast::<FreeObj>();
            free.as_ptr().write(FreeObj { next: header.free_head });
            header.free_head = Some(free);
            header.in_use -= 1;
        }
        inner.obj_count -= 1;

        let in_use = unsafe { (*slab.as_ptr()).in_use };
        if in_use == 0 {
            inner.move_slab(slab, SlabList::Empty);
        } else if unsafe { (*slab.as_ptr()).list } == SlabList::Full {
            inner.move_slab(slab, SlabList::Partial);
        }
    }

    /// Count of objects currently handed out.
    pub fn obj_count(&self) -> usize {
        self.inner.lock().obj_count
    }

    /// Count of slab pages owned by the cache.
    pub fn slab_count(&self) -> usize {
        self.inner.lock().slab_count
    }

    /// Tears the cache down, running the destructor hook over every object
    /// and releasing non-bootstrap pages to the source.
    ///
    /// All objects must have been freed; outstanding objects are a caller
    /// bug and are reported, not chased.
    pub fn destroy(self) {
        let mut inner = self.inner.lock();
        if inner.obj_count != 0 {
            error!(
                "slab_allocator: destroying cache with {} objects outstanding",
                inner.obj_count
            );
        }
        let release = inner.source.release;
        let objs_per_slab = inner.objs_per_slab;
        let obj_size = inner.obj_size;
        let first_off = inner.first_off;
        for list in [SlabList::Empty, SlabList::Partial, SlabList::Full] {
            let mut cursor = inner.heads[list as usize].take();
            while let Some(slab) = cursor {
                cursor = unsafe { (*slab.as_ptr()).next };
                if let Some(dtor) = self.dtor {
                    for i in 0..objs_per_slab {
                        let obj = (slab.as_ptr() as usize + first_off + i * obj_size) as *mut u8;
                        dtor(obj);
                    }
                }
                let from_bootstrap = unsafe { (*slab.as_ptr()).from_bootstrap };
                if !from_bootstrap {
                    if let Some(release) = release {
                        release(slab.cast::<u8>());
                    }
                }
                inner.slab_count -= 1;
            }
        }
    }
}

impl CacheInner {
    /// Unlinks `slab` from its current list and pushes it onto `target`.
    fn move_slab(&mut self, mut slab: NonNull<SlabHeader>, target: SlabList) {
        unsafe {
            let header = slab.as_mut();
            let (prev, next, list) = (header.prev.take(), header.next.take(), header.list);
            match prev {
                Some(mut p) => p.as_mut().next = next,
                None => self.heads[list as usize] = next,
            }
            if let Some(mut n) = next {
                n.as_mut().prev = prev;
            }

            let old_head = self.heads[target as usize];
            header.next = old_head;
            header.list = target;
            if let Some(mut h) = old_head {
                h.as_mut().prev = Some(slab);
            }
            self.heads[target as usize] = Some(slab);
        }
    }

    /// Grows the cache by one slab page, carving its free list and running
    /// the constructor hook over every object. The new slab is pushed onto
    /// the Partial list, ready for the allocation that triggered the growth.
    fn grow(&mut self, ctor: Option<fn(*mut u8)>) -> Option<NonNull<SlabHeader>> {
        let page = (self.source.grow)()?;
        debug_assert_eq!(page.as_ptr() as usize % PAGE_SIZE, 0, "slab pages must be page-aligned");
        let from_bootstrap = self.source.release.is_none();

        let slab = page.cast::<SlabHeader>();
        unsafe {
            slab.as_ptr().write(SlabHeader {
                next: None,
                prev: None,
                free_head: None,
                in_use: 0,
                list: SlabList::Partial,
                from_bootstrap,
            });
            // Carve objects back-to-front so the free list starts at the
            // lowest address.
            let base = page.as_ptr().add(self.first_off);
            for i in (0..self.objs_per_slab).rev() {
                let obj = base.add(i * self.obj_size);
                if let Some(ctor) = ctor {
                    ctor(obj);
                }
                let free = obj as *mut FreeObj;
                free.write(FreeObj { next: (*slab.as_ptr()).free_head });
                (*slab.as_ptr()).free_head = NonNull::new(free);
            }
            let old_head = self.heads[SlabList::Partial as usize];
            (*slab.as_ptr()).next = old_head;
            if let Some(mut h) = old_head {
                h.as_mut().prev = Some(slab);
            }
        }
        self.heads[SlabList::Partial as usize] = Some(slab);
        self.slab_count += 1;
        Some(slab)
    }
}

/// Rounds an object size up to the 8-byte granule, with room for the
/// free-list word.
fn obj_stride(obj_size: usize) -> usize {
    let min = core::mem::size_of::<FreeObj>();
    let size = obj_size.max(min);
    (size + OBJ_ALIGN - 1) & !(OBJ_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};

    fn page_layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    fn test_grow() -> Option<NonNull<u8>> {
        NonNull::new(unsafe { alloc(page_layout()) })
    }

    fn test_release(page: NonNull<u8>) {
        unsafe { dealloc(page.as_ptr(), page_layout()) };
    }

    fn test_source() -> SlabSource {
        SlabSource { grow: test_grow, release: Some(test_release) }
    }

    #[test]
    fn alloc_is_aligned() {
        let cache = ObjectCache::with_source(24, None, None, test_source());
        for _ in 0..32 {
            let obj = cache.alloc().unwrap();
            assert_eq!(obj.as_ptr() as usize % 8, 0);
        }
        assert_eq!(cache.obj_count(), 32);
        assert_eq!(cache.slab_count(), 1);
    }

    #[test]
    fn free_then_alloc_reuses_slab() {
        let cache = ObjectCache::with_source(64, None, None, test_source());
        let a = cache.alloc().unwrap();
        let b = cache.alloc().unwrap();
        let slab_of = |p: NonNull<u8>| (p.as_ptr() as usize) & !(PAGE_SIZE - 1);
        assert_eq!(slab_of(a), slab_of(b));
        unsafe { cache.free(a) };
        // Utilization is still > 0, so the next object comes from the same slab.
        let c = cache.alloc().unwrap();
        assert_eq!(slab_of(c), slab_of(b));
        unsafe {
            cache.free(b);
            cache.free(c);
        }
        assert_eq!(cache.obj_count(), 0);
        cache.destroy();
    }

    #[test]
    fn grows_past_one_slab() {
        let cache = ObjectCache::with_source(128, None, None, test_source());
        // 128 is a power of two, so objects start at a 128-aligned offset.
        let per_slab = (PAGE_SIZE - 128) / 128;
        let mut objs = std::vec::Vec::new();
        for _ in 0..per_slab + 1 {
            objs.push(cache.alloc().unwrap());
        }
        assert_eq!(cache.slab_count(), 2);
        for obj in objs.drain(..) {
            unsafe { cache.free(obj) };
        }
        assert_eq!(cache.obj_count(), 0);
        cache.destroy();
    }

    #[test]
    fn ctor_runs_per_object() {
        static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
        fn ctor(_obj: *mut u8) {
            CTOR_RUNS.fetch_add(1, Ordering::Relaxed);
        }
        let cache = ObjectCache::with_source(32, Some(ctor), None, test_source());
        let obj = cache.alloc().unwrap();
        let per_slab = (PAGE_SIZE - 64) / 32;
        assert_eq!(CTOR_RUNS.load(Ordering::Relaxed), per_slab);
        let addr = obj.as_ptr() as usize;
        assert_eq!(addr % 32, 0, "power-of-two classes come back size-aligned");
        unsafe { cache.free(obj) };
        cache.destroy();
    }

    #[test]
    fn bootstrap_pool_serves_pages() {
        // Caches created before a supplier is installed draw from the
        // static pool and never release.
        let cache = ObjectCache::with_source(
            16,
            None,
            None,
            SlabSource { grow: bootstrap_grow, release: None },
        );
        let obj = cache.alloc().unwrap();
        let pool_base = BOOTSTRAP_POOL.0.get() as usize;
        let addr = obj.as_ptr() as usize;
        assert!(addr >= pool_base && addr < pool_base + SLAB_BOOTSTRAP_POOL_SIZE);
        unsafe { cache.free(obj) };
    }
}
