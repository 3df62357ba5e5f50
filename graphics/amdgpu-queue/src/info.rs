//! Static GPU facts the submission core depends on
//!
//! Everything here is fixed per chip: graphics IP level, shader-engine
//! count and the ring geometry derived from them.

use gal::align_up;

/// Graphics IP generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GfxLevel {
    Gfx6,
    Gfx7,
    Gfx8,
    Gfx9,
    Gfx10,
    Gfx10_3,
    Gfx11,
    Gfx11_5,
}

/// Buffer-descriptor encoding generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorEncoding {
    /// GFX6 through GFX9: separate numeric and data formats
    Legacy,
    /// GFX10 and GFX10.3: unified format, resource level bit
    Gfx10,
    /// GFX11 and later: narrower format field, two-bit swizzle
    Gfx11,
}

impl GfxLevel {
    pub fn descriptor_encoding(self) -> DescriptorEncoding {
        match self {
            GfxLevel::Gfx6 | GfxLevel::Gfx7 | GfxLevel::Gfx8 | GfxLevel::Gfx9 => {
                DescriptorEncoding::Legacy
            }
            GfxLevel::Gfx10 | GfxLevel::Gfx10_3 => DescriptorEncoding::Gfx10,
            GfxLevel::Gfx11 | GfxLevel::Gfx11_5 => DescriptorEncoding::Gfx11,
        }
    }
}

/// Task ring geometry (entries per ring and entry sizes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRingInfo {
    pub num_entries: u32,
    pub draw_entry_bytes: u32,
    pub payload_entry_bytes: u32,
}

impl TaskRingInfo {
    /// Control block size in bytes
    pub const CONTROL_BLOCK_BYTES: u64 = 9 * 4;

    pub fn draw_ring_offset(&self) -> u64 {
        align_up(Self::CONTROL_BLOCK_BYTES, 256)
    }

    pub fn draw_ring_bytes(&self) -> u64 {
        self.num_entries as u64 * self.draw_entry_bytes as u64
    }

    pub fn payload_ring_offset(&self) -> u64 {
        align_up(self.draw_ring_offset() + self.draw_ring_bytes(), 256)
    }

    pub fn payload_ring_bytes(&self) -> u64 {
        self.num_entries as u64 * self.payload_entry_bytes as u64
    }

    /// Total size of the task-rings buffer
    pub fn bo_size(&self) -> u64 {
        self.payload_ring_offset() + self.payload_ring_bytes()
    }
}

impl Default for TaskRingInfo {
    fn default() -> Self {
        Self {
            num_entries: 256,
            draw_entry_bytes: 16,
            payload_entry_bytes: 16 * 1024,
        }
    }
}

/// Mesh-shader scratch ring entry count
pub const MESH_SCRATCH_NUM_ENTRIES: u64 = 64;
/// Mesh-shader scratch ring entry size in bytes
pub const MESH_SCRATCH_ENTRY_BYTES: u64 = 384;

/// Off-chip tessellation block size in bytes
pub const TESS_OFFCHIP_BLOCK_BYTES: u64 = 32 * 1024;

/// Largest ESGS or GSVS ring one shader engine can address, just under 64 MiB
pub const MAX_GS_RING_BYTES_PER_SE: u32 = 0x3FF_FC00;

/// Hardware description of one GPU
#[derive(Debug, Clone)]
pub struct GpuInfo {
    pub gfx_level: GfxLevel,
    /// Number of shader engines
    pub num_se: u32,
    /// Attribute ring bytes per shader engine (GFX11+)
    pub attribute_ring_size_per_se: u32,
    /// Off-chip tessellation buffers per shader engine
    pub max_offchip_buffers_per_se: u32,
    /// A secondary compute queue can run task work alongside graphics
    pub has_gang_submit: bool,
    pub task: TaskRingInfo,
}

impl GpuInfo {
    /// Describe a four shader-engine part of the given generation
    pub fn new(gfx_level: GfxLevel) -> Self {
        Self {
            gfx_level,
            num_se: 4,
            attribute_ring_size_per_se: 64 * 1024,
            max_offchip_buffers_per_se: 128,
            has_gang_submit: gfx_level >= GfxLevel::Gfx10_3,
            task: TaskRingInfo::default(),
        }
    }

    pub fn with_num_se(mut self, num_se: u32) -> Self {
        self.num_se = num_se.max(1);
        self
    }

    pub fn descriptor_encoding(&self) -> DescriptorEncoding {
        self.gfx_level.descriptor_encoding()
    }

    /// Attribute ring is a GFX11 feature
    pub fn has_attribute_ring(&self) -> bool {
        self.gfx_level >= GfxLevel::Gfx11
    }

    /// Scratch base is programmed through dedicated registers
    pub fn has_scratch_base_registers(&self) -> bool {
        self.gfx_level >= GfxLevel::Gfx11
    }

    /// Bytes of the whole attribute ring
    pub fn attribute_ring_size(&self) -> u32 {
        self.attribute_ring_size_per_se * self.num_se
    }

    pub fn tess_factor_ring_size(&self) -> u64 {
        32768 * self.num_se as u64
    }

    pub fn tess_offchip_blocks(&self) -> u32 {
        self.max_offchip_buffers_per_se * self.num_se
    }

    /// Offset of the off-chip ring inside the tessellation buffer
    pub fn tess_offchip_ring_offset(&self) -> u64 {
        align_up(self.tess_factor_ring_size(), 64 * 1024)
    }

    pub fn tess_offchip_ring_size(&self) -> u64 {
        self.tess_offchip_blocks() as u64 * TESS_OFFCHIP_BLOCK_BYTES
    }

    /// Total size of the tessellation buffer (factor ring then off-chip ring)
    pub fn tess_rings_size(&self) -> u64 {
        self.tess_offchip_ring_offset() + self.tess_offchip_ring_size()
    }

    /// VGT_HS_OFFCHIP_PARAM value for 32 KiB blocks
    pub fn hs_offchip_param(&self) -> u32 {
        let blocks = self.tess_offchip_blocks();
        if self.gfx_level >= GfxLevel::Gfx7 {
            // OFFCHIP_BUFFERING is programmed minus one; granularity 2 = 32K.
            (blocks.saturating_sub(1) & 0x1FF) | (2 << 9)
        } else {
            (blocks.min(127) & 0x7F) | (2 << 7)
        }
    }

    /// Upper bound for the ESGS and GSVS ring sizes
    pub fn max_gs_ring_size(&self) -> u32 {
        MAX_GS_RING_BYTES_PER_SE.saturating_mul(self.num_se)
    }

    pub fn mesh_scratch_ring_size(&self) -> u64 {
        MESH_SCRATCH_NUM_ENTRIES * MESH_SCRATCH_ENTRY_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ring_layout() {
        let task = TaskRingInfo::default();
        assert_eq!(task.draw_ring_offset(), 256);
        assert_eq!(task.draw_ring_bytes(), 4096);
        assert_eq!(task.payload_ring_offset(), 256 + 4096);
        assert_eq!(task.bo_size(), 4352 + 256 * 16384);
    }

    #[test]
    fn test_encoding_per_generation() {
        assert_eq!(GfxLevel::Gfx9.descriptor_encoding(), DescriptorEncoding::Legacy);
        assert_eq!(GfxLevel::Gfx10_3.descriptor_encoding(), DescriptorEncoding::Gfx10);
        assert_eq!(GfxLevel::Gfx11_5.descriptor_encoding(), DescriptorEncoding::Gfx11);
    }

    #[test]
    fn test_tess_layout() {
        let info = GpuInfo::new(GfxLevel::Gfx10_3).with_num_se(2);
        assert_eq!(info.tess_factor_ring_size(), 65536);
        assert_eq!(info.tess_offchip_ring_offset(), 65536);
        assert_eq!(info.tess_offchip_ring_size(), 256 * 32768);
        assert_eq!(info.hs_offchip_param() & 0x1FF, 255);
    }
}
