//! Ring descriptor table
//!
//! Shaders find every ring through one small table of buffer descriptors
//! whose address is loaded into user SGPRs by the preamble. The layout is
//! fixed by the shader ABI: one 16-byte slot per ring view, followed by
//! the standard sample locations.

use gal::Result;

use crate::info::{DescriptorEncoding, GpuInfo};
use crate::resources::GpuBuffer;
use crate::ring_state::QueueRingState;

/// Descriptor slots, in table order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum RingSlot {
    Scratch = 0,
    EsgsVs,
    EsgsGs,
    GsvsVs,
    GsvsGs,
    TessFactor,
    TessOffchip,
    TaskDraw,
    TaskPayload,
    MeshScratch,
    AttrRing,
}

pub const SLOT_BYTES: u64 = 16;
pub const NUM_RING_SLOTS: usize = 11;
/// Byte offset of the 1x/2x/4x/8x sample location block
pub const SAMPLE_POSITIONS_OFFSET: u64 = NUM_RING_SLOTS as u64 * SLOT_BYTES;
pub const SAMPLE_POSITIONS_BYTES: u64 = (1 + 2 + 4 + 8) * 2 * 4;

impl RingSlot {
    pub fn offset(self) -> u64 {
        self as usize as u64 * SLOT_BYTES
    }
}

// word1
const BASE_ADDRESS_HI_MASK: u32 = 0xFFFF;
const STRIDE_SHIFT: u32 = 16;
const STRIDE_MASK: u32 = 0x3FFF;
const SWIZZLE_ENABLE_GFX6: u32 = 1 << 31;
const SWIZZLE_ENABLE_GFX11: u32 = 1 << 30;

// word3
const DST_SEL_XYZW: u32 = 4 | (5 << 3) | (6 << 6) | (7 << 9);
const NUM_FORMAT_FLOAT: u32 = 7 << 12;
const DATA_FORMAT_32: u32 = 4 << 15;
const DATA_FORMAT_32_32_32_32: u32 = 14 << 15;
const ELEMENT_SIZE_4: u32 = 1 << 19;
const INDEX_STRIDE_SHIFT: u32 = 21;
const ADD_TID_ENABLE: u32 = 1 << 23;
const GFX10_FORMAT_32_FLOAT: u32 = 22 << 12;
const GFX10_FORMAT_32_32_32_32_FLOAT: u32 = 77 << 12;
const GFX10_RESOURCE_LEVEL: u32 = 1 << 24;
const GFX11_FORMAT_32_FLOAT: u32 = 20 << 12;
const GFX11_FORMAT_32_32_32_32_FLOAT: u32 = 63 << 12;
const OOB_SELECT_SHIFT: u32 = 28;
const OOB_SELECT_STRUCTURED_WITH_OFFSET: u32 = 2;
const OOB_SELECT_RAW: u32 = 3;

/// Index stride in elements: 8, 16, 32 or 64
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStride {
    X8 = 0,
    X16 = 1,
    X32 = 2,
    X64 = 3,
}

/// Generation-independent view of a buffer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    pub va: u64,
    pub num_records: u32,
    pub stride: u32,
    pub swizzle: bool,
    pub add_tid: bool,
    pub index_stride: IndexStride,
    /// Four-channel elements instead of single dwords
    pub vec4: bool,
}

impl BufferView {
    /// Unswizzled raw view of `size` bytes
    pub fn raw(va: u64, size: u64) -> Self {
        Self {
            va,
            num_records: size.min(u32::MAX as u64) as u32,
            stride: 0,
            swizzle: false,
            add_tid: false,
            index_stride: IndexStride::X8,
            vec4: false,
        }
    }

    /// Per-thread swizzled view with a 64-element index stride
    pub fn swizzled(va: u64, size: u64) -> Self {
        Self {
            swizzle: true,
            add_tid: true,
            index_stride: IndexStride::X64,
            ..Self::raw(va, size)
        }
    }
}

/// Encode a buffer descriptor for the given generation
pub fn encode(encoding: DescriptorEncoding, view: &BufferView) -> [u32; 4] {
    let mut word1 = ((view.va >> 32) as u32 & BASE_ADDRESS_HI_MASK)
        | ((view.stride & STRIDE_MASK) << STRIDE_SHIFT);
    let mut word3 = DST_SEL_XYZW | ((view.index_stride as u32) << INDEX_STRIDE_SHIFT);
    if view.add_tid {
        word3 |= ADD_TID_ENABLE;
    }

    match encoding {
        DescriptorEncoding::Legacy => {
            if view.swizzle {
                word1 |= SWIZZLE_ENABLE_GFX6;
                word3 |= ELEMENT_SIZE_4;
            }
            word3 |= NUM_FORMAT_FLOAT;
            word3 |= if view.vec4 { DATA_FORMAT_32_32_32_32 } else { DATA_FORMAT_32 };
        }
        DescriptorEncoding::Gfx10 => {
            if view.swizzle {
                word1 |= SWIZZLE_ENABLE_GFX6;
            }
            word3 |= if view.vec4 {
                GFX10_FORMAT_32_32_32_32_FLOAT
            } else {
                GFX10_FORMAT_32_FLOAT
            };
            word3 |= GFX10_RESOURCE_LEVEL | (oob_select(view) << OOB_SELECT_SHIFT);
        }
        DescriptorEncoding::Gfx11 => {
            if view.swizzle {
                word1 |= SWIZZLE_ENABLE_GFX11;
            }
            word3 |= if view.vec4 {
                GFX11_FORMAT_32_32_32_32_FLOAT
            } else {
                GFX11_FORMAT_32_FLOAT
            };
            word3 |= oob_select(view) << OOB_SELECT_SHIFT;
        }
    }

    [view.va as u32, word1, view.num_records, word3]
}

fn oob_select(view: &BufferView) -> u32 {
    if view.swizzle || view.stride > 0 {
        OOB_SELECT_STRUCTURED_WITH_OFFSET
    } else {
        OOB_SELECT_RAW
    }
}

/// Scratch slot: only the base address and swizzle enable are consumed
pub fn encode_scratch(encoding: DescriptorEncoding, va: u64) -> [u32; 4] {
    let swizzle = match encoding {
        DescriptorEncoding::Gfx11 => SWIZZLE_ENABLE_GFX11,
        _ => SWIZZLE_ENABLE_GFX6,
    };
    [va as u32, ((va >> 32) as u32 & BASE_ADDRESS_HI_MASK) | swizzle, 0, 0]
}

/// Standard sample locations for 1x, 2x, 4x and 8x, as (x, y) in pixels
pub fn sample_positions() -> [f32; 30] {
    const SAMPLES_8X: [(i32, i32); 8] =
        [(1, -3), (-1, 3), (5, 1), (-3, -5), (-5, 5), (-7, -1), (3, 7), (7, -7)];

    let mut out = [0.0f32; 30];
    out[0] = 0.5;
    out[1] = 0.5;
    out[2..6].copy_from_slice(&[0.75, 0.75, 0.25, 0.25]);
    out[6..14].copy_from_slice(&[0.375, 0.125, 0.875, 0.375, 0.125, 0.625, 0.625, 0.875]);
    for (i, &(x, y)) in SAMPLES_8X.iter().enumerate() {
        out[14 + 2 * i] = 0.5 + x as f32 / 16.0;
        out[15 + 2 * i] = 0.5 + y as f32 / 16.0;
    }
    out
}

/// Table size for the rings in `state`, zero when nothing needs a table
pub fn table_size(state: &QueueRingState, scratch: bool) -> u64 {
    let rings = state.esgs_ring_size > 0
        || state.gsvs_ring_size > 0
        || state.tess_rings
        || state.task_rings
        || state.mesh_scratch_ring
        || state.attr_ring_size > 0;
    if rings || state.sample_positions {
        let mut size = SAMPLE_POSITIONS_OFFSET;
        if state.sample_positions {
            size += SAMPLE_POSITIONS_BYTES;
        }
        size
    } else if scratch {
        SLOT_BYTES
    } else {
        0
    }
}

/// Ring buffers the table points at
pub struct RingBuffers<'a> {
    pub scratch: Option<&'a GpuBuffer>,
    pub esgs: Option<&'a GpuBuffer>,
    pub gsvs: Option<&'a GpuBuffer>,
    pub tess: Option<&'a GpuBuffer>,
    pub task: Option<&'a GpuBuffer>,
    pub mesh_scratch: Option<&'a GpuBuffer>,
    pub attr: Option<&'a GpuBuffer>,
}

fn put_slot(table: &mut [u32], slot: RingSlot, words: [u32; 4]) -> Result<()> {
    let len = table.len();
    let at = (slot.offset() / 4) as usize;
    let dst = table.get_mut(at..at + 4).ok_or_else(|| {
        log::error!("{:?} descriptor does not fit a {}-byte table", slot, len * 4);
        gal::Error::InvalidParameter
    })?;
    dst.copy_from_slice(&words);
    Ok(())
}

/// Fill the whole table in host memory
///
/// `size` must come from [`table_size`] for the same state; a ring that
/// does not fit is an error.
pub fn build_table(
    info: &GpuInfo,
    state: &QueueRingState,
    rings: &RingBuffers<'_>,
    size: u64,
) -> Result<Vec<u32>> {
    let enc = info.descriptor_encoding();
    let mut table = vec![0u32; (size / 4) as usize];
    let mut put = |slot: RingSlot, words: [u32; 4]| put_slot(&mut table, slot, words);

    if let Some(scratch) = rings.scratch {
        put(RingSlot::Scratch, encode_scratch(enc, scratch.va()))?;
    }

    if let Some(esgs) = rings.esgs {
        let size = state.esgs_ring_size as u64;
        put(RingSlot::EsgsVs, encode(enc, &BufferView::swizzled(esgs.va(), size)))?;
        put(RingSlot::EsgsGs, encode(enc, &BufferView::raw(esgs.va(), size)))?;
    }

    if let Some(gsvs) = rings.gsvs {
        let size = state.gsvs_ring_size as u64;
        put(RingSlot::GsvsVs, encode(enc, &BufferView::raw(gsvs.va(), size)))?;
        put(RingSlot::GsvsGs, encode(enc, &BufferView::swizzled(gsvs.va(), size)))?;
    }

    if let Some(tess) = rings.tess {
        let factor = BufferView::raw(tess.va(), info.tess_factor_ring_size());
        let offchip = BufferView::raw(
            tess.va() + info.tess_offchip_ring_offset(),
            info.tess_offchip_ring_size(),
        );
        put(RingSlot::TessFactor, encode(enc, &factor))?;
        put(RingSlot::TessOffchip, encode(enc, &offchip))?;
    }

    if let Some(task) = rings.task {
        let draw = BufferView::raw(
            task.va() + info.task.draw_ring_offset(),
            info.task.draw_ring_bytes(),
        );
        let payload = BufferView::raw(
            task.va() + info.task.payload_ring_offset(),
            info.task.payload_ring_bytes(),
        );
        put(RingSlot::TaskDraw, encode(enc, &draw))?;
        put(RingSlot::TaskPayload, encode(enc, &payload))?;
    }

    if let Some(mesh) = rings.mesh_scratch {
        let view = BufferView::raw(mesh.va(), info.mesh_scratch_ring_size());
        put(RingSlot::MeshScratch, encode(enc, &view))?;
    }

    if let Some(attr) = rings.attr {
        let view = BufferView {
            stride: 16,
            num_records: state.attr_ring_size / 16,
            index_stride: IndexStride::X32,
            vec4: true,
            ..BufferView::swizzled(attr.va(), state.attr_ring_size as u64)
        };
        put(RingSlot::AttrRing, encode(enc, &view))?;
    }

    if state.sample_positions {
        let start = (SAMPLE_POSITIONS_OFFSET / 4) as usize;
        let len = table.len();
        let dst = table.get_mut(start..start + 30).ok_or_else(|| {
            log::error!("Sample positions do not fit a {}-byte table", len * 4);
            gal::Error::InvalidParameter
        })?;
        for (dst, pos) in dst.iter_mut().zip(sample_positions()) {
            *dst = pos.to_bits();
        }
    }

    Ok(table)
}

/// Write the table into its buffer
pub fn write_table(descriptor: &GpuBuffer, table: &[u32]) -> Result<()> {
    descriptor.write(0, table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_offsets() {
        assert_eq!(RingSlot::Scratch.offset(), 0);
        assert_eq!(RingSlot::TessFactor.offset(), 80);
        assert_eq!(RingSlot::AttrRing.offset(), 160);
        assert_eq!(SAMPLE_POSITIONS_OFFSET, 176);
        assert_eq!(SAMPLE_POSITIONS_OFFSET + SAMPLE_POSITIONS_BYTES, 296);
    }

    #[test]
    fn test_swizzle_bits_per_generation() {
        let view = BufferView::swizzled(0x12_3456_7800, 4096);
        let legacy = encode(DescriptorEncoding::Legacy, &view);
        let gfx10 = encode(DescriptorEncoding::Gfx10, &view);
        let gfx11 = encode(DescriptorEncoding::Gfx11, &view);

        assert_eq!(legacy[0], 0x3456_7800);
        assert_eq!(legacy[1] & 0xFFFF, 0x12);
        assert_eq!(legacy[1] >> 31, 1);
        assert_eq!(gfx10[1] >> 31, 1);
        assert_eq!((gfx11[1] >> 30) & 3, 1);
        assert_eq!(legacy[2], 4096);

        assert_ne!(legacy[3] & ELEMENT_SIZE_4, 0);
        assert_ne!(gfx10[3] & GFX10_RESOURCE_LEVEL, 0);
        assert_eq!(gfx11[3] & GFX10_RESOURCE_LEVEL, 0);
        for words in [legacy, gfx10, gfx11] {
            assert_eq!(words[3] & 0xFFF, DST_SEL_XYZW);
            assert_ne!(words[3] & ADD_TID_ENABLE, 0);
            assert_eq!((words[3] >> INDEX_STRIDE_SHIFT) & 3, 3);
        }
    }

    #[test]
    fn test_raw_view_oob_select() {
        let raw = encode(DescriptorEncoding::Gfx11, &BufferView::raw(0x1000, 64));
        assert_eq!(raw[3] >> OOB_SELECT_SHIFT, OOB_SELECT_RAW);
        assert_eq!(raw[1], 0);
    }

    #[test]
    fn test_scratch_slot() {
        let words = encode_scratch(DescriptorEncoding::Legacy, 0x8_0000_1000);
        assert_eq!(words, [0x1000, 0x8 | SWIZZLE_ENABLE_GFX6, 0, 0]);
    }

    #[test]
    fn test_sample_positions() {
        let pos = sample_positions();
        assert_eq!(&pos[0..2], &[0.5, 0.5]);
        assert_eq!(pos[14], 0.5 + 1.0 / 16.0);
        assert_eq!(pos[15], 0.5 - 3.0 / 16.0);
        assert!(pos.iter().all(|p| (0.0..1.0).contains(p)));
    }

    #[test]
    fn test_ring_outside_table_is_rejected() {
        use std::sync::Arc;

        use gal::{BoDescriptor, MemoryDomain, Winsys};

        use crate::gem::GemWinsys;
        use crate::info::GfxLevel;

        let ws: Arc<dyn Winsys> = Arc::new(GemWinsys::new());
        let info = GpuInfo::new(GfxLevel::Gfx10_3);
        let esgs = GpuBuffer::create(&ws, &BoDescriptor::new(4096, MemoryDomain::Vram)).unwrap();
        let state = QueueRingState {
            esgs_ring_size: 4096,
            ..Default::default()
        };
        let rings = RingBuffers {
            scratch: None,
            esgs: Some(&*esgs),
            gsvs: None,
            tess: None,
            task: None,
            mesh_scratch: None,
            attr: None,
        };

        let err = build_table(&info, &state, &rings, SLOT_BYTES).unwrap_err();
        assert_eq!(err, gal::Error::InvalidParameter);
        let table = build_table(&info, &state, &rings, table_size(&state, false)).unwrap();
        assert_eq!(table[4], esgs.va() as u32);
    }

    #[test]
    fn test_table_size() {
        let mut state = QueueRingState::default();
        assert_eq!(table_size(&state, false), 0);
        assert_eq!(table_size(&state, true), 16);
        state.tess_rings = true;
        assert_eq!(table_size(&state, true), 176);
        state.sample_positions = true;
        assert_eq!(table_size(&state, false), 296);
    }
}
