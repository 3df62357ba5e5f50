//! Preamble streams
//!
//! Every submission starts with a driver-built stream that invalidates
//! caches and programs the rings a queue owns. Three variants are cached
//! per queue and rebuilt together whenever the ring resources change:
//!
//! - full flush: waits for all earlier shader work, then invalidates caches
//! - plain: invalidates caches only
//! - continue: state only, for the second and later kernel submissions of
//!   one logical submission

use std::sync::Arc;

use gal::{BoDescriptor, BoFlags, CsHandle, MemoryDomain, QueueType, Result, Winsys};

use crate::descriptors;
use crate::info::{GfxLevel, GpuInfo};
use crate::pm4::{self, CmdBuilder};
use crate::resources::{GpuBuffer, RingResourceSet};
use crate::ring_state::QueueRingState;
use crate::stream::HwStream;

// Ring size and tessellation registers, GFX6 config space
const R_0088C8_VGT_ESGS_RING_SIZE: u32 = 0x88C8;
const R_0089B0_VGT_HS_OFFCHIP_PARAM: u32 = 0x89B0;
const R_008988_VGT_TF_RING_SIZE: u32 = 0x8988;
const R_0089B8_VGT_TF_MEMORY_BASE: u32 = 0x89B8;
// GFX7+ uconfig space
const R_030900_VGT_ESGS_RING_SIZE: u32 = 0x30900;
const R_030938_VGT_TF_RING_SIZE: u32 = 0x30938;
const R_03093C_VGT_HS_OFFCHIP_PARAM: u32 = 0x3093C;
const R_030940_VGT_TF_MEMORY_BASE: u32 = 0x30940;
const R_030944_VGT_TF_MEMORY_BASE_HI: u32 = 0x30944;
const R_030984_VGT_TF_MEMORY_BASE_HI_UMD: u32 = 0x30984;
const R_031118_SPI_ATTRIBUTE_RING_BASE: u32 = 0x31118;

const R_0286E8_SPI_TMPRING_SIZE: u32 = 0x286E8;
const R_0287E8_SPI_GFX_SCRATCH_BASE_LO: u32 = 0x287E8;
const R_02820C_PA_SC_CLIPRECT_RULE: u32 = 0x2820C;

const R_00B030_SPI_SHADER_USER_DATA_PS_0: u32 = 0xB030;
const R_00B130_SPI_SHADER_USER_DATA_VS_0: u32 = 0xB130;
const R_00B230_SPI_SHADER_USER_DATA_GS_0: u32 = 0xB230;
const R_00B330_SPI_SHADER_USER_DATA_ES_0: u32 = 0xB330;
const R_00B430_SPI_SHADER_USER_DATA_HS_0: u32 = 0xB430;
const R_00B530_SPI_SHADER_USER_DATA_LS_0: u32 = 0xB530;

const R_00B810_COMPUTE_START_X: u32 = 0xB810;
const R_00B840_COMPUTE_DISPATCH_SCRATCH_BASE_LO: u32 = 0xB840;
const R_00B858_COMPUTE_STATIC_THREAD_MGMT_SE0: u32 = 0xB858;
const R_00B860_COMPUTE_TMPRING_SIZE: u32 = 0xB860;
const R_00B864_COMPUTE_STATIC_THREAD_MGMT_SE2: u32 = 0xB864;
const R_00B900_COMPUTE_USER_DATA_0: u32 = 0xB900;
const R_00B908_COMPUTE_USER_DATA_2: u32 = 0xB908;

const ATTR_RING_BIG_PAGE: u32 = 1 << 20;
const ATTR_RING_L1_POLICY_STREAM: u32 = 3 << 21;

/// Shadow buffer layout: uconfig, SH and context windows
pub const SHADOW_REGS_SIZE: u64 = 64 * 1024;
const SHADOW_UCONFIG_OFFSET: u64 = 0;
const SHADOW_SH_OFFSET: u64 = 16 * 1024;
const SHADOW_CONTEXT_OFFSET: u64 = 32 * 1024;

/// Which cached preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleKind {
    FullFlush,
    Plain,
    Continue,
}

/// Progress of a preamble rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleState {
    NoPreamble,
    BuildingFullFlush,
    BuildingPlain,
    BuildingContinue,
    Ready,
}

/// The three cached preamble streams of a queue
#[derive(Debug)]
pub struct PreambleTriple {
    pub full_flush: HwStream,
    pub plain: HwStream,
    pub continuation: HwStream,
    /// Streams the preambles call into
    pub calls: Vec<CsHandle>,
}

impl PreambleTriple {
    /// Initial preamble for a submission, with or without a full flush
    pub fn initial(&self, full_flush: bool) -> &HwStream {
        if full_flush {
            &self.full_flush
        } else {
            &self.plain
        }
    }
}

/// Register-shadowing buffer and the stream that loads it
pub struct ShadowRegs {
    regs: Arc<GpuBuffer>,
    ib: HwStream,
}

impl ShadowRegs {
    pub fn create(ws: &Arc<dyn Winsys>, info: &GpuInfo) -> Result<Self> {
        let desc = BoDescriptor::new(SHADOW_REGS_SIZE, MemoryDomain::Vram)
            .flags(BoFlags::ZERO_VRAM | BoFlags::NO_CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING);
        let regs = GpuBuffer::create(ws, &desc)?;

        let mut cs = CmdBuilder::new(QueueType::Graphics, info.gfx_level);
        cs.context_control(
            pm4::CC0_LOAD_ENABLE
                | pm4::CC0_LOAD_GLOBAL_UCONFIG
                | pm4::CC0_LOAD_PER_CONTEXT_STATE
                | pm4::CC0_LOAD_CS_SH_REGS,
            pm4::CC1_SHADOW_ENABLE
                | pm4::CC1_SHADOW_GLOBAL_UCONFIG
                | pm4::CC1_SHADOW_PER_CONTEXT_STATE
                | pm4::CC1_SHADOW_CS_SH_REGS,
        );
        let va = regs.va();
        let load = |cs: &mut CmdBuilder, op: u32, offset: u64, bytes: u64| {
            let addr = va + offset;
            cs.emit(pm4::pkt3(op, 3, false));
            cs.emit(addr as u32);
            cs.emit((addr >> 32) as u32);
            cs.emit(0);
            cs.emit((bytes / 4) as u32);
        };
        load(
            &mut cs,
            pm4::PKT3_LOAD_UCONFIG_REG,
            SHADOW_UCONFIG_OFFSET,
            SHADOW_SH_OFFSET - SHADOW_UCONFIG_OFFSET,
        );
        load(
            &mut cs,
            pm4::PKT3_LOAD_SH_REG,
            SHADOW_SH_OFFSET,
            (pm4::SH_REG_END - pm4::SH_REG_OFFSET) as u64,
        );
        load(
            &mut cs,
            pm4::PKT3_LOAD_CONTEXT_REG,
            SHADOW_CONTEXT_OFFSET,
            (pm4::CONTEXT_REG_END - pm4::CONTEXT_REG_OFFSET) as u64,
        );
        cs.add_buffer(regs.handle());

        let ib = HwStream::from_builder(ws, cs, false)?;
        log::info!("Register shadowing enabled, shadow buffer at {:#x}", va);
        Ok(Self { regs, ib })
    }

    pub fn stream(&self) -> &HwStream {
        &self.ib
    }
}

/// Fixed-function graphics state every preamble starts from
pub fn emit_graphics_init_state(cs: &mut CmdBuilder) {
    cs.context_control(pm4::CC0_LOAD_ENABLE, pm4::CC1_SHADOW_ENABLE);
    cs.emit(pm4::pkt3(pm4::PKT3_CLEAR_STATE, 0, false));
    cs.emit(0);
    cs.set_context_reg(R_02820C_PA_SC_CLIPRECT_RULE, 0xFFFF);
    emit_compute_init_state(cs);
}

/// Fixed compute dispatch state
pub fn emit_compute_init_state(cs: &mut CmdBuilder) {
    cs.set_sh_reg_seq(R_00B810_COMPUTE_START_X, 3);
    cs.emit_slice(&[0, 0, 0]);
    cs.set_sh_reg_seq(R_00B858_COMPUTE_STATIC_THREAD_MGMT_SE0, 2);
    cs.emit_slice(&[0xFFFF_FFFF, 0xFFFF_FFFF]);
    if cs.gfx_level() >= GfxLevel::Gfx7 {
        cs.set_sh_reg_seq(R_00B864_COMPUTE_STATIC_THREAD_MGMT_SE2, 2);
        cs.emit_slice(&[0xFFFF_FFFF, 0xFFFF_FFFF]);
    }
}

/// Build the canned graphics init-state stream
pub fn build_init_state_stream(ws: &Arc<dyn Winsys>, info: &GpuInfo) -> Result<HwStream> {
    let mut cs = CmdBuilder::new(QueueType::Graphics, info.gfx_level);
    emit_graphics_init_state(&mut cs);
    HwStream::from_builder(ws, cs, false)
}

/// Everything a preamble is built from
pub struct PreambleInputs<'a> {
    pub ip: QueueType,
    pub info: &'a GpuInfo,
    pub state: &'a QueueRingState,
    pub resources: &'a RingResourceSet,
    pub shadow: Option<&'a ShadowRegs>,
    /// Canned init state to call instead of emitting it inline
    pub init_state: Option<&'a HwStream>,
}

/// Preamble rebuild state machine
#[derive(Debug)]
pub struct PreambleBuilder {
    state: PreambleState,
    triples_built: u64,
}

impl PreambleBuilder {
    pub fn new() -> Self {
        Self {
            state: PreambleState::NoPreamble,
            triples_built: 0,
        }
    }

    pub fn state(&self) -> PreambleState {
        self.state
    }

    /// Number of preamble triples built so far
    pub fn triples_built(&self) -> u64 {
        self.triples_built
    }

    /// Build a fresh triple
    ///
    /// On failure the streams built so far are destroyed and the state
    /// falls back to what it was, so previously installed preambles stay
    /// usable.
    pub fn build(
        &mut self,
        ws: &Arc<dyn Winsys>,
        inputs: &PreambleInputs<'_>,
    ) -> Result<PreambleTriple> {
        let fallback = match self.state {
            PreambleState::NoPreamble => PreambleState::NoPreamble,
            _ => PreambleState::Ready,
        };

        let triple = self
            .step(ws, inputs, PreambleState::BuildingFullFlush, PreambleKind::FullFlush)
            .and_then(|full_flush| {
                let plain =
                    self.step(ws, inputs, PreambleState::BuildingPlain, PreambleKind::Plain)?;
                let continuation =
                    self.step(ws, inputs, PreambleState::BuildingContinue, PreambleKind::Continue)?;
                Ok(PreambleTriple {
                    full_flush,
                    plain,
                    continuation,
                    calls: called_streams(inputs),
                })
            });

        match triple {
            Ok(triple) => {
                self.state = PreambleState::Ready;
                self.triples_built += 1;
                Ok(triple)
            }
            Err(err) => {
                self.state = fallback;
                Err(err)
            }
        }
    }

    fn step(
        &mut self,
        ws: &Arc<dyn Winsys>,
        inputs: &PreambleInputs<'_>,
        state: PreambleState,
        kind: PreambleKind,
    ) -> Result<HwStream> {
        self.state = state;
        HwStream::from_builder(ws, emit_preamble(kind, inputs), false)
    }
}

impl Default for PreambleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn called_streams(inputs: &PreambleInputs<'_>) -> Vec<CsHandle> {
    let mut calls = Vec::new();
    if inputs.ip == QueueType::Graphics {
        if let Some(shadow) = inputs.shadow {
            calls.push(shadow.ib.handle());
        }
        if let Some(init) = inputs.init_state {
            calls.push(init.handle());
        }
    }
    calls
}

/// Encode one preamble variant
pub fn emit_preamble(kind: PreambleKind, inputs: &PreambleInputs<'_>) -> CmdBuilder {
    let mut cs = CmdBuilder::new(inputs.ip, inputs.info.gfx_level);

    if kind == PreambleKind::FullFlush {
        if inputs.ip == QueueType::Graphics {
            cs.partial_flush(pm4::EVENT_PS_PARTIAL_FLUSH);
        }
        cs.partial_flush(pm4::EVENT_CS_PARTIAL_FLUSH);
    }
    if kind != PreambleKind::Continue {
        cs.invalidate_caches();
    }

    match inputs.ip {
        QueueType::Graphics => emit_graphics(&mut cs, inputs),
        QueueType::Compute => emit_compute(&mut cs, inputs),
    }

    for bo in inputs.resources.handles() {
        cs.add_buffer(bo);
    }
    cs
}

fn emit_graphics(cs: &mut CmdBuilder, inputs: &PreambleInputs<'_>) {
    let res = inputs.resources;

    if let Some(shadow) = inputs.shadow {
        cs.call(shadow.ib.va(), shadow.ib.dwords());
        cs.add_buffer(shadow.regs.handle());
    }

    match inputs.init_state {
        Some(init) => cs.call(init.va(), init.dwords()),
        None => emit_graphics_init_state(cs),
    }

    if res.esgs_ring.is_some()
        || res.gsvs_ring.is_some()
        || res.tess_rings.is_some()
        || res.task_rings.is_some()
    {
        cs.partial_flush(pm4::EVENT_VS_PARTIAL_FLUSH);
        cs.event_write(pm4::EVENT_VGT_FLUSH, 0);
    }

    emit_gs_ring_sizes(cs, inputs);
    emit_tess_rings(cs, inputs);
    emit_task_rings(cs, res.task_rings.as_deref(), false);
    emit_attribute_ring(cs, inputs);

    if let Some(desc) = &res.descriptor {
        for &reg in graphics_user_data_regs(inputs.info.gfx_level) {
            cs.set_sh_ptr(reg, desc.va());
        }
    }

    emit_compute_scratch(cs, inputs);
    emit_graphics_scratch(cs, inputs);
}

fn emit_compute(cs: &mut CmdBuilder, inputs: &PreambleInputs<'_>) {
    let res = inputs.resources;

    emit_compute_init_state(cs);

    if res.task_rings.is_some() {
        cs.partial_flush(pm4::EVENT_CS_PARTIAL_FLUSH);
    }
    emit_task_rings(cs, res.task_rings.as_deref(), true);

    if let Some(desc) = &res.descriptor {
        cs.set_sh_ptr(R_00B900_COMPUTE_USER_DATA_0, desc.va());
    }

    emit_compute_scratch(cs, inputs);
}

/// User-data registers receiving the descriptor table pointer, per stage
pub fn graphics_user_data_regs(gfx_level: GfxLevel) -> &'static [u32] {
    match gfx_level {
        GfxLevel::Gfx6 | GfxLevel::Gfx7 | GfxLevel::Gfx8 => &[
            R_00B030_SPI_SHADER_USER_DATA_PS_0,
            R_00B130_SPI_SHADER_USER_DATA_VS_0,
            R_00B230_SPI_SHADER_USER_DATA_GS_0,
            R_00B330_SPI_SHADER_USER_DATA_ES_0,
            R_00B430_SPI_SHADER_USER_DATA_HS_0,
            R_00B530_SPI_SHADER_USER_DATA_LS_0,
        ],
        // Merged stages: ES registers drive GS and HS registers drive LS.
        GfxLevel::Gfx9 => &[
            R_00B130_SPI_SHADER_USER_DATA_VS_0,
            R_00B030_SPI_SHADER_USER_DATA_PS_0,
            R_00B330_SPI_SHADER_USER_DATA_ES_0,
            R_00B430_SPI_SHADER_USER_DATA_HS_0,
        ],
        GfxLevel::Gfx10 | GfxLevel::Gfx10_3 => &[
            R_00B130_SPI_SHADER_USER_DATA_VS_0,
            R_00B030_SPI_SHADER_USER_DATA_PS_0,
            R_00B230_SPI_SHADER_USER_DATA_GS_0,
            R_00B430_SPI_SHADER_USER_DATA_HS_0,
        ],
        GfxLevel::Gfx11 | GfxLevel::Gfx11_5 => &[
            R_00B030_SPI_SHADER_USER_DATA_PS_0,
            R_00B230_SPI_SHADER_USER_DATA_GS_0,
            R_00B430_SPI_SHADER_USER_DATA_HS_0,
        ],
    }
}

fn emit_gs_ring_sizes(cs: &mut CmdBuilder, inputs: &PreambleInputs<'_>) {
    let res = inputs.resources;
    if res.esgs_ring.is_none() && res.gsvs_ring.is_none() {
        return;
    }

    let esgs = inputs.state.esgs_ring_size >> 8;
    let gsvs = inputs.state.gsvs_ring_size >> 8;
    if inputs.info.gfx_level >= GfxLevel::Gfx7 {
        cs.set_uconfig_reg_seq(R_030900_VGT_ESGS_RING_SIZE, 2);
    } else {
        cs.set_config_reg_seq(R_0088C8_VGT_ESGS_RING_SIZE, 2);
    }
    cs.emit(esgs);
    cs.emit(gsvs);
}

fn emit_tess_rings(cs: &mut CmdBuilder, inputs: &PreambleInputs<'_>) {
    let Some(tess) = &inputs.resources.tess_rings else {
        return;
    };

    let info = inputs.info;
    let va = tess.va();
    let size_dw = (info.tess_factor_ring_size() / 4) as u32 & 0x1FFFF;
    let param = info.hs_offchip_param();

    if info.gfx_level >= GfxLevel::Gfx7 {
        cs.set_uconfig_reg(R_030938_VGT_TF_RING_SIZE, size_dw);
        cs.set_uconfig_reg(R_030940_VGT_TF_MEMORY_BASE, (va >> 8) as u32);
        if info.gfx_level >= GfxLevel::Gfx10 {
            cs.set_uconfig_reg(R_030984_VGT_TF_MEMORY_BASE_HI_UMD, (va >> 40) as u32);
        } else if info.gfx_level == GfxLevel::Gfx9 {
            cs.set_uconfig_reg(R_030944_VGT_TF_MEMORY_BASE_HI, (va >> 40) as u32);
        }
        cs.set_uconfig_reg(R_03093C_VGT_HS_OFFCHIP_PARAM, param);
    } else {
        cs.set_config_reg(R_008988_VGT_TF_RING_SIZE, size_dw);
        cs.set_config_reg(R_0089B8_VGT_TF_MEMORY_BASE, (va >> 8) as u32);
        cs.set_config_reg(R_0089B0_VGT_HS_OFFCHIP_PARAM, param);
    }
}

fn emit_task_rings(cs: &mut CmdBuilder, task: Option<&GpuBuffer>, compute: bool) {
    let Some(task) = task else {
        return;
    };

    // The control buffer is 256-byte aligned; the low byte is reserved.
    let va = task.va();
    cs.emit(
        pm4::pkt3(pm4::PKT3_DISPATCH_TASK_STATE_INIT, 1, false) | pm4::pkt3_shader_type(compute),
    );
    cs.emit(va as u32 & 0xFFFF_FF00);
    cs.emit((va >> 32) as u32);
}

fn emit_attribute_ring(cs: &mut CmdBuilder, inputs: &PreambleInputs<'_>) {
    let Some(attr) = &inputs.resources.attr_ring else {
        return;
    };
    if !inputs.info.has_attribute_ring() {
        return;
    }

    // The ring registers must not change under in-flight waves.
    cs.partial_flush(pm4::EVENT_PS_PARTIAL_FLUSH);
    cs.partial_flush(pm4::EVENT_VS_PARTIAL_FLUSH);
    cs.partial_flush(pm4::EVENT_CS_PARTIAL_FLUSH);

    let per_se = inputs.state.attr_ring_size / inputs.info.num_se;
    let mem_size = ((per_se >> 16).max(1) - 1) & 0xFFFFF;
    cs.set_uconfig_reg_seq(R_031118_SPI_ATTRIBUTE_RING_BASE, 2);
    cs.emit((attr.va() >> 16) as u32);
    cs.emit(mem_size | ATTR_RING_BIG_PAGE | ATTR_RING_L1_POLICY_STREAM);
}

/// SPI_TMPRING_SIZE / COMPUTE_TMPRING_SIZE value
pub fn tmpring_size(gfx_level: GfxLevel, waves: u32, size_per_wave: u32) -> u32 {
    if gfx_level >= GfxLevel::Gfx11 {
        (waves & 0xFFF) | ((size_per_wave.div_ceil(256) & 0x7FFF) << 12)
    } else {
        (waves & 0xFFF) | ((size_per_wave.div_ceil(1024) & 0x1FFF) << 12)
    }
}

fn emit_graphics_scratch(cs: &mut CmdBuilder, inputs: &PreambleInputs<'_>) {
    let Some(scratch) = &inputs.resources.scratch else {
        return;
    };

    let gfx_level = inputs.info.gfx_level;
    let state = inputs.state;
    cs.set_context_reg(
        R_0286E8_SPI_TMPRING_SIZE,
        tmpring_size(gfx_level, state.scratch_waves_clamped(), state.scratch_size_per_wave),
    );
    if inputs.info.has_scratch_base_registers() {
        cs.set_context_reg_seq(R_0287E8_SPI_GFX_SCRATCH_BASE_LO, 2);
        cs.emit((scratch.va() >> 8) as u32);
        cs.emit((scratch.va() >> 40) as u32);
    }
}

fn emit_compute_scratch(cs: &mut CmdBuilder, inputs: &PreambleInputs<'_>) {
    let Some(scratch) = &inputs.resources.compute_scratch else {
        return;
    };

    let info = inputs.info;
    let state = inputs.state;
    cs.set_sh_reg(
        R_00B860_COMPUTE_TMPRING_SIZE,
        tmpring_size(
            info.gfx_level,
            state.compute_scratch_waves_clamped(),
            state.compute_scratch_size_per_wave,
        ),
    );
    if info.has_scratch_base_registers() {
        cs.set_sh_reg_seq(R_00B840_COMPUTE_DISPATCH_SCRATCH_BASE_LO, 2);
        cs.emit((scratch.va() >> 8) as u32);
        cs.emit((scratch.va() >> 40) as u32);
    } else {
        // User data 0-1 hold the ring table pointer; the scratch resource follows.
        let words = descriptors::encode_scratch(info.descriptor_encoding(), scratch.va());
        cs.set_sh_reg_seq(R_00B908_COMPUTE_USER_DATA_2, 2);
        cs.emit(words[0]);
        cs.emit(words[1]);
    }
}
