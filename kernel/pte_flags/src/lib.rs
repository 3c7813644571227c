//! The set of orthogonal permission bits that callers use to describe a
//! mapping. The MMU underlayer translates these into whatever the hardware
//! page-table format actually stores; nothing outside that layer ever sees
//! a native PTE encoding.

#![no_std]

#[macro_use]
extern crate bitflags;

bitflags! {
    /// Portable mapping permissions.
    pub struct PteFlags: u64 {
        /// The mapping is backed by a frame and valid for translation.
        const PRESENT       = 1 << 0;
        /// The mapping may be read.
        const READ          = 1 << 1;
        /// The mapping may be written.
        const WRITE         = 1 << 2;
        /// The mapping is kernel-only; user-mode accesses fault.
        const KERNEL        = 1 << 3;
        /// The mapping may be executed.
        const EXECUTABLE    = 1 << 4;
        /// Caching is disabled for this mapping (MMIO).
        const CACHE_DISABLE = 1 << 5;
        /// Writes go straight through the cache.
        const WRITE_THROUGH = 1 << 6;
    }
}

impl PteFlags {
    /// The baseline for kernel data mappings: present, readable, writable,
    /// kernel-only.
    pub fn kernel_data() -> PteFlags {
        PteFlags::PRESENT | PteFlags::READ | PteFlags::WRITE | PteFlags::KERNEL
    }

    /// The baseline for user anonymous memory: present, readable, writable.
    pub fn user_data() -> PteFlags {
        PteFlags::PRESENT | PteFlags::READ | PteFlags::WRITE
    }

    pub fn is_present(&self) -> bool {
        self.contains(PteFlags::PRESENT)
    }

    pub fn is_writable(&self) -> bool {
        self.contains(PteFlags::WRITE)
    }

    pub fn is_kernel_only(&self) -> bool {
        self.contains(PteFlags::KERNEL)
    }

    pub fn is_executable(&self) -> bool {
        self.contains(PteFlags::EXECUTABLE)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn baseline_flag_sets() {
        assert!(PteFlags::kernel_data().is_kernel_only());
        assert!(PteFlags::kernel_data().is_present());
        assert!(!PteFlags::user_data().is_kernel_only());
        assert!(PteFlags::user_data().is_writable());
    }
}
