//! The boot handoff contract between `nexboot` and the kernel.
//!
//! Everything here is produced by the bootloader and copied or referenced
//! once at kernel entry; the kernel never serializes any of it back. The
//! memory map feeds the frame allocator's zone setup, the early pool seeds
//! the slab bootstrap, and the log buffer is replayed into the kernel log
//! ring once memory is up.

#![no_std]

use memory_structs::PhysicalAddress;

/// The producer-defined classification of one memory map entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    /// Usable RAM.
    Free,
    /// Permanently unusable (firmware, holes, MMIO).
    Reserved,
    /// ACPI tables; reclaimable after the table walker is done.
    AcpiReclaim,
    /// ACPI non-volatile storage; never reclaimed.
    AcpiNvs,
    /// Bootloader structures; reclaimable after handoff data is consumed.
    BootReclaim,
}

/// One entry of the boot memory map.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
    pub base: PhysicalAddress,
    pub length: usize,
    pub kind: MemoryKind,
}

/// A module loaded by the bootloader alongside the kernel.
#[derive(Clone, Copy, Debug)]
pub struct BootModule {
    pub base: PhysicalAddress,
    pub length: usize,
    pub name: &'static str,
}

/// Firmware flavor the bootloader ran under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareKind {
    Bios,
    Efi,
}

/// Description of the boot framebuffer, if the bootloader set one up.
#[derive(Clone, Copy, Debug)]
pub struct FramebufferInfo {
    pub width: u32,
    pub height: u32,
    pub bytes_per_line: u32,
    pub bits_per_pixel: u8,
    pub bytes_per_pixel: u8,
    /// Total size of the front buffer in bytes.
    pub size: usize,
    /// Bit masks for red, green, blue, reserved, in that order.
    pub pixel_masks: [PixelMask; 4],
    /// Physical address of the front buffer.
    pub front_buffer: PhysicalAddress,
}

/// One color component's position within a pixel.
#[derive(Clone, Copy, Debug, Default)]
pub struct PixelMask {
    pub mask: u32,
    pub shift: u8,
}

/// The boot structure passed to the kernel entry point.
pub struct BootInfo {
    /// System/CPU identification string from the bootloader's detection.
    pub system_name: &'static str,
    pub firmware: FirmwareKind,
    /// The bootloader's log buffer: (physical base, bytes used).
    /// Replayed into the kernel log ring during early init.
    pub log_buffer: Option<(PhysicalAddress, usize)>,
    pub memory_map: &'static [MemoryRegion],
    pub modules: &'static [BootModule],
    /// Early memory pool: (physical base, length). Seeds the slab bootstrap
    /// and serves frame allocations before the allocator's full init.
    pub early_pool: (PhysicalAddress, usize),
    /// Raw kernel command line, e.g. `-loglevel=debug -root=/dev/nd0`.
    pub cmdline: &'static str,
    pub framebuffer: Option<FramebufferInfo>,
}

impl BootInfo {
    /// Looks up a command-line argument by name, returning its value.
    ///
    /// Arguments are whitespace-separated `-name=value` pairs; a bare
    /// `-name` yields an empty value. The first match wins.
    pub fn arg(&self, name: &str) -> Option<&'static str> {
        find_arg(self.cmdline, name)
    }

    /// Total bytes of `Free` memory in the map.
    pub fn free_memory_bytes(&self) -> usize {
        self.memory_map
            .iter()
            .filter(|region| region.kind == MemoryKind::Free)
            .map(|region| region.length)
            .sum()
    }
}

/// The argument scan behind [`BootInfo::arg`], separated out so it can be
/// used on any command-line string.
pub fn find_arg(cmdline: &'static str, name: &str) -> Option<&'static str> {
    for word in cmdline.split_whitespace() {
        let word = word.strip_prefix('-').unwrap_or(word);
        match word.split_once('=') {
            Some((key, value)) if key == name => return Some(value),
            None if word == name => return Some(""),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn arg_lookup() {
        let cmdline = "-loglevel=debug -quiet -root=/dev/nd0";
        assert_eq!(find_arg(cmdline, "loglevel"), Some("debug"));
        assert_eq!(find_arg(cmdline, "quiet"), Some(""));
        assert_eq!(find_arg(cmdline, "root"), Some("/dev/nd0"));
        assert_eq!(find_arg(cmdline, "missing"), None);
    }

    #[test]
    fn free_memory_accounting() {
        static MAP: [MemoryRegion; 3] = [
            MemoryRegion {
                base: PhysicalAddress::zero(),
                length: 640 * 1024,
                kind: MemoryKind::Free,
            },
            MemoryRegion {
                base: PhysicalAddress::new_canonical(0xA0000),
                length: 384 * 1024,
                kind: MemoryKind::Reserved,
            },
            MemoryRegion {
                base: PhysicalAddress::new_canonical(0x100000),
                length: 127 * 1024 * 1024,
                kind: MemoryKind::Free,
            },
        ];
        let info = BootInfo {
            system_name: "test",
            firmware: FirmwareKind::Bios,
            log_buffer: None,
            memory_map: &MAP,
            modules: &[],
            early_pool: (PhysicalAddress::zero(), 0),
            cmdline: "",
            framebuffer: None,
        };
        assert_eq!(info.free_memory_bytes(), (640 + 127 * 1024) * 1024);
    }
}
