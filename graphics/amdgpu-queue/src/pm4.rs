//! PM4 packet encoding
//!
//! Type-3 packet headers, register windows and the handful of packets the
//! submission core emits itself. Command buffers recorded elsewhere are
//! opaque to this module.

use gal::{BoHandle, QueueType};

use crate::info::GfxLevel;

pub const PKT3_NOP: u32 = 0x10;
pub const PKT3_CLEAR_STATE: u32 = 0x12;
pub const PKT3_ATOMIC_MEM: u32 = 0x1E;
pub const PKT3_CONTEXT_CONTROL: u32 = 0x28;
pub const PKT3_WRITE_DATA: u32 = 0x37;
pub const PKT3_WAIT_REG_MEM: u32 = 0x3C;
pub const PKT3_INDIRECT_BUFFER: u32 = 0x3F;
pub const PKT3_SURFACE_SYNC: u32 = 0x43;
pub const PKT3_EVENT_WRITE: u32 = 0x46;
pub const PKT3_EVENT_WRITE_EOP: u32 = 0x47;
pub const PKT3_RELEASE_MEM: u32 = 0x49;
pub const PKT3_ACQUIRE_MEM: u32 = 0x58;
pub const PKT3_LOAD_UCONFIG_REG: u32 = 0x5E;
pub const PKT3_LOAD_SH_REG: u32 = 0x5F;
pub const PKT3_LOAD_CONTEXT_REG: u32 = 0x61;
pub const PKT3_SET_CONFIG_REG: u32 = 0x68;
pub const PKT3_SET_CONTEXT_REG: u32 = 0x69;
pub const PKT3_SET_SH_REG: u32 = 0x76;
pub const PKT3_SET_UCONFIG_REG: u32 = 0x79;
pub const PKT3_DISPATCH_TASK_STATE_INIT: u32 = 0xA9;

/// Filler dword used to pad graphics IBs
pub const PKT2_NOP_PAD: u32 = 0xFFFF_1000;

pub const CONFIG_REG_OFFSET: u32 = 0x8000;
pub const CONFIG_REG_END: u32 = 0xB000;
pub const SH_REG_OFFSET: u32 = 0xB000;
pub const SH_REG_END: u32 = 0xC000;
pub const CONTEXT_REG_OFFSET: u32 = 0x28000;
pub const CONTEXT_REG_END: u32 = 0x29000;
pub const UCONFIG_REG_OFFSET: u32 = 0x30000;
pub const UCONFIG_REG_END: u32 = 0x40000;

// VGT event types
pub const EVENT_CS_PARTIAL_FLUSH: u32 = 0x07;
pub const EVENT_VS_PARTIAL_FLUSH: u32 = 0x0F;
pub const EVENT_PS_PARTIAL_FLUSH: u32 = 0x10;
pub const EVENT_VGT_FLUSH: u32 = 0x24;
pub const EVENT_BOTTOM_OF_PIPE_TS: u32 = 0x28;

/// INDIRECT_BUFFER control word: the IB is valid
pub const IB_VALID: u32 = 1 << 23;
/// INDIRECT_BUFFER control word: execution continues in the target
pub const IB_CHAIN: u32 = 1 << 20;

// WAIT_REG_MEM
const WAIT_REG_MEM_GREATER_OR_EQUAL: u32 = 5;
const WAIT_REG_MEM_MEM_SPACE: u32 = 1 << 4;

// WRITE_DATA
const WRITE_DATA_DST_SEL_MEM: u32 = 5 << 8;
const WRITE_DATA_WR_CONFIRM: u32 = 1 << 20;

// End-of-pipe data selection: write the low 32 bits
const EOP_DATA_SEL_VALUE_32BIT: u32 = 1 << 29;

// ATOMIC_MEM
const TC_OP_ATOMIC_CMPSWAP_32: u32 = 0x48;
const ATOMIC_COMMAND_LOOP: u32 = 1 << 8;
const ATOMIC_LOOP_INTERVAL: u32 = 10;

// CP_COHER_CNTL (GFX6-GFX9)
pub const CP_COHER_TC_WB_ACTION_ENA: u32 = 1 << 18;
pub const CP_COHER_TCL1_ACTION_ENA: u32 = 1 << 22;
pub const CP_COHER_TC_ACTION_ENA: u32 = 1 << 23;
pub const CP_COHER_SH_KCACHE_ACTION_ENA: u32 = 1 << 27;
pub const CP_COHER_SH_ICACHE_ACTION_ENA: u32 = 1 << 29;

// GCR_CNTL (GFX10+)
pub const GCR_GLI_INV: u32 = 1;
pub const GCR_GLK_INV: u32 = 1 << 7;
pub const GCR_GLV_INV: u32 = 1 << 8;
pub const GCR_GL1_INV: u32 = 1 << 9;
pub const GCR_GL2_INV: u32 = 1 << 14;
pub const GCR_GL2_WB: u32 = 1 << 15;

// CONTEXT_CONTROL
pub const CC0_LOAD_ENABLE: u32 = 1 << 31;
pub const CC0_LOAD_GLOBAL_UCONFIG: u32 = 1 << 15;
pub const CC0_LOAD_PER_CONTEXT_STATE: u32 = 1 << 16;
pub const CC0_LOAD_CS_SH_REGS: u32 = 1 << 24;
pub const CC1_SHADOW_ENABLE: u32 = 1 << 31;
pub const CC1_SHADOW_GLOBAL_UCONFIG: u32 = 1 << 15;
pub const CC1_SHADOW_PER_CONTEXT_STATE: u32 = 1 << 16;
pub const CC1_SHADOW_CS_SH_REGS: u32 = 1 << 24;

/// Build a type-3 packet header
pub const fn pkt3(op: u32, count: u32, predicate: bool) -> u32 {
    (3 << 30) | ((count & 0x3FFF) << 16) | ((op & 0xFF) << 8) | predicate as u32
}

/// Shader-type bit selecting the compute pipe for packets that need it
pub const fn pkt3_shader_type(compute: bool) -> u32 {
    (compute as u32 & 1) << 1
}

/// Opcode of a type-3 header
pub const fn pkt3_opcode(header: u32) -> u32 {
    (header >> 8) & 0xFF
}

/// Four-dword NOP, the size of a chaining INDIRECT_BUFFER
pub const fn nop4() -> [u32; 4] {
    [pkt3(PKT3_NOP, 2, false), 0, 0, 0]
}

/// Four-dword INDIRECT_BUFFER packet
pub const fn indirect_buffer(va: u64, dwords: u32, chain: bool) -> [u32; 4] {
    let mut control = (dwords & 0xF_FFFF) | IB_VALID;
    if chain {
        control |= IB_CHAIN;
    }
    [
        pkt3(PKT3_INDIRECT_BUFFER, 2, false),
        va as u32,
        (va >> 32) as u32,
        control,
    ]
}

/// Packet writer for driver-generated streams
pub struct CmdBuilder {
    ip: QueueType,
    gfx_level: GfxLevel,
    dwords: Vec<u32>,
    buffers: Vec<BoHandle>,
}

impl CmdBuilder {
    pub fn new(ip: QueueType, gfx_level: GfxLevel) -> Self {
        Self {
            ip,
            gfx_level,
            dwords: Vec::with_capacity(256),
            buffers: Vec::new(),
        }
    }

    pub fn ip(&self) -> QueueType {
        self.ip
    }

    pub fn gfx_level(&self) -> GfxLevel {
        self.gfx_level
    }

    pub fn len(&self) -> usize {
        self.dwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dwords.is_empty()
    }

    pub fn dwords(&self) -> &[u32] {
        &self.dwords
    }

    pub fn buffers(&self) -> &[BoHandle] {
        &self.buffers
    }

    pub fn emit(&mut self, dword: u32) {
        self.dwords.push(dword);
    }

    pub fn emit_slice(&mut self, dwords: &[u32]) {
        self.dwords.extend_from_slice(dwords);
    }

    /// Reference a buffer object from this stream
    pub fn add_buffer(&mut self, bo: BoHandle) {
        if !self.buffers.contains(&bo) {
            self.buffers.push(bo);
        }
    }

    fn set_reg_seq(&mut self, op: u32, base: u32, end: u32, reg: u32, num: u32) {
        debug_assert!(reg >= base && reg < end, "register {:#x} outside window", reg);
        debug_assert!(num > 0);
        self.emit(pkt3(op, num, false));
        self.emit((reg - base) >> 2);
    }

    pub fn set_config_reg_seq(&mut self, reg: u32, num: u32) {
        self.set_reg_seq(PKT3_SET_CONFIG_REG, CONFIG_REG_OFFSET, CONFIG_REG_END, reg, num);
    }

    pub fn set_config_reg(&mut self, reg: u32, value: u32) {
        self.set_config_reg_seq(reg, 1);
        self.emit(value);
    }

    pub fn set_uconfig_reg_seq(&mut self, reg: u32, num: u32) {
        self.set_reg_seq(PKT3_SET_UCONFIG_REG, UCONFIG_REG_OFFSET, UCONFIG_REG_END, reg, num);
    }

    pub fn set_uconfig_reg(&mut self, reg: u32, value: u32) {
        self.set_uconfig_reg_seq(reg, 1);
        self.emit(value);
    }

    pub fn set_context_reg_seq(&mut self, reg: u32, num: u32) {
        self.set_reg_seq(PKT3_SET_CONTEXT_REG, CONTEXT_REG_OFFSET, CONTEXT_REG_END, reg, num);
    }

    pub fn set_context_reg(&mut self, reg: u32, value: u32) {
        self.set_context_reg_seq(reg, 1);
        self.emit(value);
    }

    pub fn set_sh_reg_seq(&mut self, reg: u32, num: u32) {
        self.set_reg_seq(PKT3_SET_SH_REG, SH_REG_OFFSET, SH_REG_END, reg, num);
    }

    pub fn set_sh_reg(&mut self, reg: u32, value: u32) {
        self.set_sh_reg_seq(reg, 1);
        self.emit(value);
    }

    /// Write a 64-bit pointer into two consecutive SH registers
    pub fn set_sh_ptr(&mut self, reg: u32, va: u64) {
        self.set_sh_reg_seq(reg, 2);
        self.emit(va as u32);
        self.emit((va >> 32) as u32);
    }

    pub fn event_write(&mut self, event: u32, index: u32) {
        self.emit(pkt3(PKT3_EVENT_WRITE, 0, false));
        self.emit((event & 0x3F) | ((index & 0xF) << 8));
    }

    /// Partial flushes use event index 4
    pub fn partial_flush(&mut self, event: u32) {
        self.event_write(event, 4);
    }

    /// Stall the command processor until the dword at `va` is >= `value`
    pub fn wait_mem_gte(&mut self, va: u64, value: u32) {
        self.emit(pkt3(PKT3_WAIT_REG_MEM, 5, false));
        self.emit(WAIT_REG_MEM_GREATER_OR_EQUAL | WAIT_REG_MEM_MEM_SPACE);
        self.emit(va as u32);
        self.emit((va >> 32) as u32);
        self.emit(value);
        self.emit(0xFFFF_FFFF);
        self.emit(4);
    }

    /// Write dwords to memory from the command processor
    pub fn write_data(&mut self, va: u64, data: &[u32]) {
        self.emit(pkt3(PKT3_WRITE_DATA, 2 + data.len() as u32, false));
        self.emit(WRITE_DATA_DST_SEL_MEM | WRITE_DATA_WR_CONFIRM);
        self.emit(va as u32);
        self.emit((va >> 32) as u32);
        self.emit_slice(data);
    }

    /// Write `value` to `va` once all prior work has reached the end of the pipe
    pub fn release_mem_eop(&mut self, va: u64, value: u32) {
        let event = EVENT_BOTTOM_OF_PIPE_TS | (5 << 8);
        if self.gfx_level >= GfxLevel::Gfx9 || self.ip == QueueType::Compute {
            self.emit(pkt3(PKT3_RELEASE_MEM, 6, false));
            self.emit(event);
            self.emit(EOP_DATA_SEL_VALUE_32BIT);
            self.emit(va as u32);
            self.emit((va >> 32) as u32);
            self.emit(value);
            self.emit(0);
            self.emit(0);
        } else {
            self.emit(pkt3(PKT3_EVENT_WRITE_EOP, 4, false));
            self.emit(event);
            self.emit(va as u32);
            self.emit(((va >> 32) as u32 & 0xFFFF) | EOP_DATA_SEL_VALUE_32BIT);
            self.emit(value);
            self.emit(0);
        }
    }

    /// Spin in the command processor until the dword at `va` swaps from `cmp` to `src`
    pub fn atomic_cmpswap_loop(&mut self, va: u64, cmp: u32, src: u32) {
        self.emit(pkt3(PKT3_ATOMIC_MEM, 7, false));
        self.emit(TC_OP_ATOMIC_CMPSWAP_32 | ATOMIC_COMMAND_LOOP);
        self.emit(va as u32);
        self.emit((va >> 32) as u32);
        self.emit(src);
        self.emit(0);
        self.emit(cmp);
        self.emit(0);
        self.emit(ATOMIC_LOOP_INTERVAL);
    }

    /// Call another stream and return
    pub fn call(&mut self, va: u64, dwords: u32) {
        self.emit_slice(&indirect_buffer(va, dwords, false));
    }

    pub fn context_control(&mut self, load: u32, shadow: u32) {
        self.emit(pkt3(PKT3_CONTEXT_CONTROL, 1, false));
        self.emit(load);
        self.emit(shadow);
    }

    /// Invalidate instruction, scalar, vector and L2 caches
    pub fn invalidate_caches(&mut self) {
        if self.gfx_level >= GfxLevel::Gfx10 {
            let gcr = GCR_GLI_INV
                | GCR_GLK_INV
                | GCR_GLV_INV
                | GCR_GL1_INV
                | GCR_GL2_INV
                | GCR_GL2_WB;
            self.emit(pkt3(PKT3_ACQUIRE_MEM, 6, false));
            self.emit(0);
            self.emit(0xFFFF_FFFF);
            self.emit(0x00FF_FFFF);
            self.emit(0);
            self.emit(0);
            self.emit(0x0A);
            self.emit(gcr);
        } else {
            let mut coher = CP_COHER_SH_ICACHE_ACTION_ENA
                | CP_COHER_SH_KCACHE_ACTION_ENA
                | CP_COHER_TCL1_ACTION_ENA
                | CP_COHER_TC_ACTION_ENA;
            if self.gfx_level >= GfxLevel::Gfx9 {
                coher |= CP_COHER_TC_WB_ACTION_ENA;
            }
            if self.gfx_level >= GfxLevel::Gfx7 {
                self.emit(pkt3(PKT3_ACQUIRE_MEM, 5, false));
                self.emit(coher);
                self.emit(0xFFFF_FFFF);
                self.emit(0x00FF_FFFF);
                self.emit(0);
                self.emit(0);
                self.emit(0x0A);
            } else {
                self.emit(pkt3(PKT3_SURFACE_SYNC, 3, false));
                self.emit(coher);
                self.emit(0xFFFF_FFFF);
                self.emit(0);
                self.emit(0x0A);
            }
        }
    }

    /// Pad so that `reserve` more dwords end the stream on an 8-dword boundary
    pub fn pad(&mut self, reserve: usize) {
        while (self.dwords.len() + reserve) % 8 != 0 {
            self.dwords.push(PKT2_NOP_PAD);
        }
    }

    pub fn finish(self) -> (QueueType, Vec<u32>, Vec<BoHandle>) {
        (self.ip, self.dwords, self.buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkt3_header() {
        let header = pkt3(PKT3_SET_SH_REG, 2, false);
        assert_eq!(header >> 30, 3);
        assert_eq!((header >> 16) & 0x3FFF, 2);
        assert_eq!(pkt3_opcode(header), PKT3_SET_SH_REG);
        assert_eq!(pkt3(PKT3_NOP, 0, true) & 1, 1);
    }

    #[test]
    fn test_set_sh_reg_layout() {
        let mut cs = CmdBuilder::new(QueueType::Compute, GfxLevel::Gfx10_3);
        cs.set_sh_ptr(0xB900, 0x1_2345_6700);
        assert_eq!(
            cs.dwords(),
            &[pkt3(PKT3_SET_SH_REG, 2, false), 0x240, 0x2345_6700, 0x1]
        );
    }

    #[test]
    fn test_indirect_buffer_chain_bits() {
        let ib = indirect_buffer(0xABCD_0000_1000, 64, true);
        assert_eq!(pkt3_opcode(ib[0]), PKT3_INDIRECT_BUFFER);
        assert_eq!(ib[1], 0x1000);
        assert_eq!(ib[2], 0xABCD);
        assert_eq!(ib[3], 64 | IB_VALID | IB_CHAIN);
        assert_eq!(indirect_buffer(0, 8, false)[3] & IB_CHAIN, 0);
        assert_eq!(nop4().len(), ib.len());
    }

    #[test]
    fn test_cache_flush_per_generation() {
        let mut gfx11 = CmdBuilder::new(QueueType::Graphics, GfxLevel::Gfx11);
        gfx11.invalidate_caches();
        assert_eq!(gfx11.dwords()[0], pkt3(PKT3_ACQUIRE_MEM, 6, false));
        assert_eq!(gfx11.dwords()[7] & GCR_GL2_INV, GCR_GL2_INV);

        let mut gfx9 = CmdBuilder::new(QueueType::Graphics, GfxLevel::Gfx9);
        gfx9.invalidate_caches();
        assert_eq!(gfx9.dwords()[0], pkt3(PKT3_ACQUIRE_MEM, 5, false));
        assert_ne!(gfx9.dwords()[1] & CP_COHER_TC_WB_ACTION_ENA, 0);

        let mut gfx6 = CmdBuilder::new(QueueType::Graphics, GfxLevel::Gfx6);
        gfx6.invalidate_caches();
        assert_eq!(pkt3_opcode(gfx6.dwords()[0]), PKT3_SURFACE_SYNC);
    }

    #[test]
    fn test_pad_reserves_tail() {
        let mut cs = CmdBuilder::new(QueueType::Graphics, GfxLevel::Gfx10);
        cs.emit(0);
        cs.pad(4);
        assert_eq!((cs.len() + 4) % 8, 0);
    }
}
