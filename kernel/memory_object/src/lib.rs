//! Memory objects: reference-counted containers of pages with a pluggable
//! paging backend.
//!
//! An object describes `page_count` pages of content; the pages actually
//! resident sit in a hash keyed by page index. When the fault path needs a
//! page that is not resident, the object's backend produces it: the
//! anonymous backend allocates and zeroes a fresh frame, the
//! kernel-resident backend looks the frame up in a fixed table built at
//! object creation (kernel image ranges, MMIO windows).
//!
//! Objects are shared by `Arc`; the last reference's drop tears the object
//! down, which releases every resident page it owns and clears the frames'
//! back-mapping lists. Frames the object does not own (kernel-resident,
//! MMIO) are left alone.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::{sync::Arc, vec::Vec};
use hashbrown::HashMap;
use kernel_config::memory::PAGE_SIZE;
use memory_structs::Frame;
use pte_flags::PteFlags;
use sync_irq::IplMutex;


/// A shared handle to a memory object. Cloning is the `ref` operation;
/// dropping the last clone destroys the object.
pub type ObjRef = Arc<MemObject>;

/// Errors surfaced by object operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjError {
    /// The backend could not produce a page.
    OutOfMemory,
    /// The offset lies beyond the object's page count.
    BadOffset,
    /// No page is resident at the given offset.
    NotResident,
}

impl From<frame_allocator::AllocError> for ObjError {
    fn from(_: frame_allocator::AllocError) -> ObjError {
        ObjError::OutOfMemory
    }
}

/// Which backend produces this object's pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Zero-filled on first touch.
    Anonymous,
    /// Pages exist up front in a fixed physical table.
    KernelResident,
}

/// One resident page: the frame, plus the ownership token when the object
/// allocated the frame itself and must free it on page-out or teardown.
struct ResidentPage {
    frame: Frame,
    owned: Option<frame_allocator::PageFrame>,
}

/// The pluggable producer of pages. Implementations are stateful and are
/// destroyed with the object.
trait PagerBackend: Send {
    fn kind(&self) -> BackendKind;
    /// Produces the page at `page_idx`; called only when not resident.
    fn page_in(&mut self, page_idx: usize) -> Result<ResidentPage, ObjError>;
    /// Releases backend state. Resident pages are handled by the object.
    fn destroy(&mut self) {}
}

/// Zero-fill anonymous memory.
struct AnonPager;

impl PagerBackend for AnonPager {
    fn kind(&self) -> BackendKind {
        BackendKind::Anonymous
    }

    fn page_in(&mut self, _page_idx: usize) -> Result<ResidentPage, ObjError> {
        let page = frame_allocator::alloc_page()?;
        mul::zero_frame(page.frame());
        let frame = page.frame();
        Ok(ResidentPage { frame, owned: Some(page) })
    }
}

/// Kernel-resident memory: the frames are fixed at creation and never
/// owned by the object (kernel image, MMIO, boot structures).
struct KernelPager {
    frames: Vec<Frame>,
}

impl PagerBackend for KernelPager {
    fn kind(&self) -> BackendKind {
        BackendKind::KernelResident
    }

    fn page_in(&mut self, page_idx: usize) -> Result<ResidentPage, ObjError> {
        let frame = *self.frames.get(page_idx).ok_or(ObjError::BadOffset)?;
        Ok(ResidentPage { frame, owned: None })
    }

    fn destroy(&mut self) {
        self.frames.clear();
    }
}

struct ObjInner {
    perm: PteFlags,
    pageable: bool,
    resident: HashMap<usize, ResidentPage>,
    backend: alloc::boxed::Box<dyn PagerBackend>,
}

/// A reference-counted container of pages. See the module docs.
pub struct MemObject {
    page_count: usize,
    inner: IplMutex<ObjInner>,
}

impl MemObject {
    /// Creates an anonymous zero-fill object of `page_count` pages.
    pub fn new_anon(page_count: usize, perm: PteFlags) -> ObjRef {
        Arc::new(MemObject {
            page_count,
            inner: IplMutex::new(ObjInner {
                perm,
                pageable: true,
                resident: HashMap::new(),
                backend: alloc::boxed::Box::new(AnonPager),
            }),
        })
    }

    /// Creates a kernel-resident object over the given fixed frames.
    /// The object maps but never owns them.
    pub fn new_kernel(frames: Vec<Frame>, perm: PteFlags) -> ObjRef {
        Arc::new(MemObject {
            page_count: frames.len(),
            inner: IplMutex::new(ObjInner {
                perm,
                pageable: false,
                resident: HashMap::new(),
                backend: alloc::boxed::Box::new(KernelPager { frames }),
            }),
        })
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.lock().backend.kind()
    }

    pub fn is_pageable(&self) -> bool {
        self.inner.lock().pageable
    }

    /// The object's current mapping permissions.
    pub fn perm(&self) -> PteFlags {
        self.inner.lock().perm
    }

    /// Changes the permissions applied to future mappings. Mappings that
    /// already exist are not walked; the change takes effect at the next
    /// fault unless the address-space layer explicitly re-maps.
    pub fn protect(&self, new_perm: PteFlags) {
        self.inner.lock().perm = new_perm;
    }

    /// Count of pages currently resident.
    pub fn resident_count(&self) -> usize {
        self.inner.lock().resident.len()
    }

    /// Returns the frame backing the page at byte `offset` into the
    /// object, consulting the hash first and the backend on a miss.
    /// Calling twice for the same offset yields the same frame.
    pub fn page_in(&self, offset: usize) -> Result<Frame, ObjError> {
        let page_idx = offset / PAGE_SIZE;
        if page_idx >= self.page_count {
            return Err(ObjError::BadOffset);
        }
        let mut inner = self.inner.lock();
        if let Some(resident) = inner.resident.get(&page_idx) {
            return Ok(resident.frame);
        }
        let resident = inner.backend.page_in(page_idx)?;
        let frame = resident.frame;
        if let Some(token) = resident.owned.as_ref() {
            frame_allocator::page_attach(token, page_idx * PAGE_SIZE);
        }
        inner.resident.insert(page_idx, resident);
        Ok(frame)
    }

    /// The frame at `offset` if resident, without invoking the backend.
    pub fn resident_at(&self, offset: usize) -> Option<Frame> {
        self.inner.lock().resident.get(&(offset / PAGE_SIZE)).map(|r| r.frame)
    }

    /// Evicts the page at `offset`. Owned frames return to the frame
    /// allocator. The caller must already have unmapped every back-mapping;
    /// a leftover one is reported and dropped.
    pub fn page_out(&self, offset: usize) -> Result<(), ObjError> {
        let page_idx = offset / PAGE_SIZE;
        let mut inner = self.inner.lock();
        let resident = inner.resident.remove(&page_idx).ok_or(ObjError::NotResident)?;
        release_resident(resident);
        Ok(())
    }
}

impl Drop for MemObject {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for (_idx, resident) in inner.resident.drain() {
            release_resident(resident);
        }
        inner.backend.destroy();
    }
}

/// Frees one formerly-resident page, clearing whatever back-mappings the
/// unmap paths left behind.
fn release_resident(resident: ResidentPage) {
    let leftover = frame_allocator::rmap_take(resident.frame);
    if !leftover.is_empty() {
        warn!(
            "memory_object: releasing frame {:?} with {} live back-mappings",
            resident.frame,
            leftover.len()
        );
    }
    if let Some(page) = resident.owned {
        frame_allocator::page_detach(&page);
        frame_allocator::free_page(page);
    }
}
