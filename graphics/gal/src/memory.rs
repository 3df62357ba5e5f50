//! Buffer-object placement and description
//!
//! This module describes GPU buffer objects as the kernel sees them.

use bitflags::bitflags;

/// Kernel handle of a GPU buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoHandle(pub u32);

/// Memory heap a buffer object is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryDomain {
    /// GPU-local memory
    Vram,
    /// System memory mapped through the GART
    Gtt,
    /// On-chip global data share
    Gds,
    /// Ordered-append counters backing the global data share
    Oa,
}

impl MemoryDomain {
    /// Check if buffers in this domain get a GPU virtual address
    pub fn has_va(&self) -> bool {
        matches!(self, MemoryDomain::Vram | MemoryDomain::Gtt)
    }
}

bitflags! {
    /// Buffer-object creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoFlags: u32 {
        /// Buffer must be CPU accessible
        const CPU_ACCESS = 1 << 0;
        /// Buffer is never touched by the CPU
        const NO_CPU_ACCESS = 1 << 1;
        /// GPU only reads the buffer
        const READ_ONLY = 1 << 2;
        /// Kernel clears the buffer before handing it out
        const ZERO_VRAM = 1 << 3;
        /// Buffer is never exported to another process
        const NO_INTERPROCESS_SHARING = 1 << 4;
    }
}

/// Buffer-object creation info
#[derive(Debug, Clone)]
pub struct BoDescriptor {
    /// Size in bytes
    pub size: u64,
    /// Alignment of the GPU virtual address
    pub alignment: u64,
    /// Placement
    pub domain: MemoryDomain,
    /// Creation flags
    pub flags: BoFlags,
}

impl BoDescriptor {
    /// Create a new descriptor with the default 4 KiB alignment
    pub fn new(size: u64, domain: MemoryDomain) -> Self {
        Self {
            size,
            alignment: 4096,
            domain,
            flags: BoFlags::empty(),
        }
    }

    /// Set alignment
    pub fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set creation flags
    pub fn flags(mut self, flags: BoFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A created buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoInfo {
    pub handle: BoHandle,
    /// GPU virtual address, zero for domains without one
    pub va: u64,
    pub size: u64,
    pub domain: MemoryDomain,
}

/// Round `value` up to a power-of-two `alignment`
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(32768 * 3, 65536), 131072);
    }

    #[test]
    fn test_descriptor_builder() {
        let desc = BoDescriptor::new(8, MemoryDomain::Gtt)
            .alignment(64)
            .flags(BoFlags::CPU_ACCESS | BoFlags::ZERO_VRAM);
        assert_eq!(desc.size, 8);
        assert_eq!(desc.alignment, 64);
        assert!(desc.flags.contains(BoFlags::ZERO_VRAM));
        assert!(!MemoryDomain::Gds.has_va());
    }
}
