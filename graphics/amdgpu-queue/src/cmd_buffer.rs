//! What the submission core needs from recorded command buffers
//!
//! Recording itself happens elsewhere; a command buffer arrives here
//! finalized, with its peak ring usage already tallied.

use std::sync::Arc;

use bitflags::bitflags;
use gal::{BoHandle, QueueType, Result, Winsys};

use crate::info::GpuInfo;
use crate::pm4::{self, CmdBuilder};
use crate::ring_state::QueueRingState;
use crate::stream::HwStream;

bitflags! {
    /// Command buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsageFlags: u32 {
        const ONE_TIME_SUBMIT = 1 << 0;
        const RENDER_PASS_CONTINUE = 1 << 1;
        /// May be pending on several queues at once, so its stream must
        /// never be patched
        const SIMULTANEOUS_USE = 1 << 2;
    }
}

/// Peak ring and scratch usage of one command buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingUsage {
    pub scratch_size_per_wave: u32,
    pub scratch_waves: u32,
    pub compute_scratch_size_per_wave: u32,
    pub compute_scratch_waves: u32,
    pub esgs_ring_size: u32,
    pub gsvs_ring_size: u32,
    pub tess_rings: bool,
    pub task_rings: bool,
    pub mesh_scratch_ring: bool,
    pub attr_ring: bool,
    pub gds: bool,
    pub gds_oa: bool,
    pub sample_positions: bool,
}

impl RingUsage {
    /// Express this usage as ring requirements on `info`
    ///
    /// Geometry ring sizes above what the hardware can address are clamped.
    pub fn to_ring_state(&self, info: &GpuInfo) -> QueueRingState {
        let max_gs = info.max_gs_ring_size();
        if self.esgs_ring_size > max_gs || self.gsvs_ring_size > max_gs {
            log::warn!(
                "Geometry rings clamped to {:#x} bytes (esgs {:#x}, gsvs {:#x})",
                max_gs,
                self.esgs_ring_size,
                self.gsvs_ring_size
            );
        }

        QueueRingState {
            scratch_size_per_wave: self.scratch_size_per_wave,
            scratch_waves: self.scratch_waves,
            compute_scratch_size_per_wave: self.compute_scratch_size_per_wave,
            compute_scratch_waves: self.compute_scratch_waves,
            esgs_ring_size: self.esgs_ring_size.min(max_gs),
            gsvs_ring_size: self.gsvs_ring_size.min(max_gs),
            tess_rings: self.tess_rings,
            task_rings: self.task_rings,
            mesh_scratch_ring: self.mesh_scratch_ring,
            attr_ring_size: if self.attr_ring && info.has_attribute_ring() {
                info.attribute_ring_size()
            } else {
                0
            },
            gds: self.gds,
            gds_oa: self.gds_oa,
            sample_positions: self.sample_positions,
        }
    }
}

/// A finalized command buffer
pub trait CommandBuffer: Send + Sync {
    /// Queue class the buffer was recorded for
    fn queue_type(&self) -> QueueType;

    fn usage_flags(&self) -> UsageFlags;

    fn ring_usage(&self) -> RingUsage;

    /// Main stream, executed on the submitting queue
    fn stream(&self) -> &HwStream;

    /// Follower stream for task work, executed on the gang compute queue
    fn gang_stream(&self) -> Option<&HwStream> {
        None
    }

    /// Pipelines are bound from GPU memory, so scratch needs are unknown
    fn uses_indirect_pipeline_binds(&self) -> bool {
        false
    }

    /// Newest shader-upload timeline point the buffer's shaders depend on
    fn shader_upload_seq(&self) -> u64 {
        0
    }

    /// Performance-counter pass this buffer samples, if any
    fn perf_counter_pass(&self) -> Option<u32> {
        None
    }
}

/// Plain command buffer built from already-encoded dwords
pub struct RecordedCommandBuffer {
    ip: QueueType,
    usage_flags: UsageFlags,
    ring_usage: RingUsage,
    stream: HwStream,
    gang_stream: Option<HwStream>,
    indirect_pipeline_binds: bool,
    shader_upload_seq: u64,
    perf_counter_pass: Option<u32>,
}

impl RecordedCommandBuffer {
    pub fn builder(ip: QueueType) -> RecordedCommandBufferBuilder {
        RecordedCommandBufferBuilder::new(ip)
    }
}

impl CommandBuffer for RecordedCommandBuffer {
    fn queue_type(&self) -> QueueType {
        self.ip
    }

    fn usage_flags(&self) -> UsageFlags {
        self.usage_flags
    }

    fn ring_usage(&self) -> RingUsage {
        self.ring_usage
    }

    fn stream(&self) -> &HwStream {
        &self.stream
    }

    fn gang_stream(&self) -> Option<&HwStream> {
        self.gang_stream.as_ref()
    }

    fn uses_indirect_pipeline_binds(&self) -> bool {
        self.indirect_pipeline_binds
    }

    fn shader_upload_seq(&self) -> u64 {
        self.shader_upload_seq
    }

    fn perf_counter_pass(&self) -> Option<u32> {
        self.perf_counter_pass
    }
}

/// Builder for [`RecordedCommandBuffer`]
pub struct RecordedCommandBufferBuilder {
    ip: QueueType,
    usage_flags: UsageFlags,
    ring_usage: RingUsage,
    dwords: Vec<u32>,
    buffers: Vec<BoHandle>,
    gang_dwords: Option<Vec<u32>>,
    indirect_pipeline_binds: bool,
    shader_upload_seq: u64,
    perf_counter_pass: Option<u32>,
}

impl RecordedCommandBufferBuilder {
    fn new(ip: QueueType) -> Self {
        Self {
            ip,
            usage_flags: UsageFlags::ONE_TIME_SUBMIT,
            ring_usage: RingUsage::default(),
            dwords: Vec::new(),
            buffers: Vec::new(),
            gang_dwords: None,
            indirect_pipeline_binds: false,
            shader_upload_seq: 0,
            perf_counter_pass: None,
        }
    }

    pub fn usage(mut self, flags: UsageFlags) -> Self {
        self.usage_flags = flags;
        self
    }

    pub fn rings(mut self, usage: RingUsage) -> Self {
        self.ring_usage = usage;
        self
    }

    pub fn dwords(mut self, dwords: &[u32]) -> Self {
        self.dwords.extend_from_slice(dwords);
        self
    }

    pub fn buffer(mut self, bo: BoHandle) -> Self {
        self.buffers.push(bo);
        self
    }

    /// Attach follower work for the gang compute queue
    pub fn gang(mut self, dwords: &[u32]) -> Self {
        self.gang_dwords = Some(dwords.to_vec());
        self
    }

    pub fn indirect_pipeline_binds(mut self) -> Self {
        self.indirect_pipeline_binds = true;
        self
    }

    pub fn shader_upload_seq(mut self, seq: u64) -> Self {
        self.shader_upload_seq = seq;
        self
    }

    pub fn perf_counter_pass(mut self, pass: u32) -> Self {
        self.perf_counter_pass = Some(pass);
        self
    }

    pub fn build(self, ws: &Arc<dyn Winsys>) -> Result<RecordedCommandBuffer> {
        let dwords = if self.dwords.is_empty() {
            nop_body()
        } else {
            self.dwords
        };
        let stream = HwStream::create(ws, self.ip, dwords, self.buffers, true)?;

        let gang_stream = match self.gang_dwords {
            Some(d) => {
                let body = if d.is_empty() { nop_body() } else { d };
                Some(HwStream::create(ws, QueueType::Compute, body, Vec::new(), true)?)
            }
            None => None,
        };

        Ok(RecordedCommandBuffer {
            ip: self.ip,
            usage_flags: self.usage_flags,
            ring_usage: self.ring_usage,
            stream,
            gang_stream,
            indirect_pipeline_binds: self.indirect_pipeline_binds,
            shader_upload_seq: self.shader_upload_seq,
            perf_counter_pass: self.perf_counter_pass,
        })
    }
}

fn nop_body() -> Vec<u32> {
    vec![pm4::pkt3(pm4::PKT3_NOP, 0, false), 0]
}

/// Encode a stream body of plain SH register writes
pub fn sh_reg_stream(ip: QueueType, info: &GpuInfo, regs: &[(u32, u32)]) -> Vec<u32> {
    let mut cs = CmdBuilder::new(ip, info.gfx_level);
    for &(reg, value) in regs {
        cs.set_sh_reg(reg, value);
    }
    cs.finish().1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gem::GemWinsys;
    use crate::info::GfxLevel;

    #[test]
    fn test_attr_ring_only_on_gfx11() {
        let usage = RingUsage {
            attr_ring: true,
            ..Default::default()
        };
        let gfx10 = GpuInfo::new(GfxLevel::Gfx10_3);
        let gfx11 = GpuInfo::new(GfxLevel::Gfx11);
        assert_eq!(usage.to_ring_state(&gfx10).attr_ring_size, 0);
        assert_eq!(usage.to_ring_state(&gfx11).attr_ring_size, gfx11.attribute_ring_size());
    }

    #[test]
    fn test_geometry_rings_clamped_to_hardware_limit() {
        let info = GpuInfo::new(GfxLevel::Gfx9).with_num_se(2);
        let usage = RingUsage {
            esgs_ring_size: u32::MAX,
            gsvs_ring_size: 1 << 20,
            ..Default::default()
        };
        let state = usage.to_ring_state(&info);
        assert_eq!(state.esgs_ring_size, 2 * crate::info::MAX_GS_RING_BYTES_PER_SE);
        assert_eq!(state.gsvs_ring_size, 1 << 20);
        assert_eq!(info.max_gs_ring_size() % 256, 0);
    }

    #[test]
    fn test_builder_creates_gang_stream() {
        let ws: Arc<dyn Winsys> = Arc::new(GemWinsys::new());
        let info = GpuInfo::new(GfxLevel::Gfx10_3);
        let body = sh_reg_stream(QueueType::Graphics, &info, &[(0xB030, 1)]);
        let cb = RecordedCommandBuffer::builder(QueueType::Graphics)
            .dwords(&body)
            .gang(&[])
            .build(&ws)
            .unwrap();

        assert!(cb.stream().is_chainable());
        let gang = cb.gang_stream().unwrap();
        assert_eq!(gang.ip(), QueueType::Compute);
        assert_eq!(cb.usage_flags(), UsageFlags::ONE_TIME_SUBMIT);
    }
}
