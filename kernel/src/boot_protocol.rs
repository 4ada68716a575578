//! Loader hand-off structures
//!
//! The firmware loader passes the kernel a single [`BootInfo`] by
//! reference: the physical memory map, an optional video mode, and the
//! ACPI root. The layout is shared with the loader and must stay
//! `repr(C)`.

/// Classification of a physical memory range in the loader's map.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Unusable = 0,
    Free,
    Loader,
    Preserve,
    AcpiReclaimable,
    Persistent,

    /// Must be present exactly once
    Kernel,
    /// Must be present exactly once
    Initrd,
    /// May be present an arbitrary number of times
    Paging,
    /// Must be present exactly once
    MemoryMap,
    /// Must be present exactly once if video mode information is passed
    Backbuffer,
    /// Must be present exactly once and be exactly 2 MiB in size
    LogBuffer,
    WorkingStack,
}

impl MemoryType {
    /// Human-readable label for the boot memory-map table.
    pub fn description(self) -> &'static str {
        match self {
            Self::Unusable => "unusable",
            Self::Free => "free",
            Self::Loader => "bootloader",
            Self::Preserve => "preserve for runtime",
            Self::AcpiReclaimable => "ACPI-reclaimable",
            Self::Persistent => "persistent",
            Self::Kernel => "kernel",
            Self::Initrd => "initrd",
            Self::Paging => "paging structures",
            Self::MemoryMap => "memory map",
            Self::Backbuffer => "video backbuffer",
            Self::LogBuffer => "boot log buffer",
            Self::WorkingStack => "working stack",
        }
    }

    /// Ranges the loader hands over already occupied, which the frame
    /// accounting counts as used 4 KiB frames.
    pub fn is_kernel_owned(self) -> bool {
        matches!(
            self,
            Self::Loader
                | Self::Kernel
                | Self::Initrd
                | Self::Paging
                | Self::MemoryMap
                | Self::Backbuffer
                | Self::LogBuffer
                | Self::WorkingStack
        )
    }
}

/// One physical range in the loader's memory map.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub physical_start: u64,
    pub length: u64,
    pub kind: MemoryType,
    pub attributes: u32,
}

/// Framebuffer pixel layout.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb = 0,
    Bgr,
    Mask,
}

/// Video mode description, present when the loader set up a framebuffer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VideoMode {
    pub framebuffer_base: u64,
    pub framebuffer_size: u64,
    pub x: u32,
    pub y: u32,
    pub pixels_per_line: u32,
    pub format: PixelFormat,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
}

/// The structure the loader passes to the kernel entry point by register.
#[repr(C)]
pub struct BootInfo {
    /// Physical pointer to the memory-map entries
    pub memory_map: *const MemoryMapEntry,
    /// Number of entries behind `memory_map`
    pub memory_map_size: usize,
    /// Video mode, null if the loader did not set one up
    pub video_mode: *const VideoMode,
    /// ACPI revision reported by the firmware
    pub acpi_revision: u32,
    /// Physical address of the ACPI root table
    pub acpi_root: u64,
}

/// Find the first memory-map entry of the given type.
pub fn find_entry(memmap: &[MemoryMapEntry], kind: MemoryType) -> Option<&MemoryMapEntry> {
    memmap.iter().find(|entry| entry.kind == kind)
}
