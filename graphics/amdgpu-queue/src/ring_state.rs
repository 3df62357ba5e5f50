//! Ring and scratch requirements
//!
//! [`QueueRingState`] is what a queue has provisioned so far; [`aggregate`]
//! folds a batch of command buffers into the requirements for the next
//! submission. Numeric fields only grow and flags only go false to true.

use gal::QueueType;
use parking_lot::Mutex;

use crate::cmd_buffer::CommandBuffer;
use crate::info::GpuInfo;

/// Provisioned ring and scratch sizes of one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueRingState {
    pub scratch_size_per_wave: u32,
    pub scratch_waves: u32,
    pub compute_scratch_size_per_wave: u32,
    pub compute_scratch_waves: u32,
    pub esgs_ring_size: u32,
    pub gsvs_ring_size: u32,
    pub tess_rings: bool,
    pub task_rings: bool,
    pub mesh_scratch_ring: bool,
    pub attr_ring_size: u32,
    pub gds: bool,
    pub gds_oa: bool,
    pub sample_positions: bool,
}

impl QueueRingState {
    /// Graphics waves backed by scratch, clamped to the current wave size
    ///
    /// The stored count never shrinks, so a wave size that grew after a
    /// large wave count was provisioned can push the raw product past 32 bits.
    pub fn scratch_waves_clamped(&self) -> u32 {
        clamp_waves(self.scratch_size_per_wave, self.scratch_waves)
    }

    pub fn compute_scratch_waves_clamped(&self) -> u32 {
        clamp_waves(self.compute_scratch_size_per_wave, self.compute_scratch_waves)
    }

    pub fn scratch_bytes(&self) -> u64 {
        self.scratch_size_per_wave as u64 * self.scratch_waves_clamped() as u64
    }

    pub fn compute_scratch_bytes(&self) -> u64 {
        self.compute_scratch_size_per_wave as u64 * self.compute_scratch_waves_clamped() as u64
    }

    /// Pointwise maximum with `other`
    pub fn merge(&mut self, other: &QueueRingState) {
        self.scratch_size_per_wave = self.scratch_size_per_wave.max(other.scratch_size_per_wave);
        self.scratch_waves = self.scratch_waves.max(other.scratch_waves);
        self.compute_scratch_size_per_wave = self
            .compute_scratch_size_per_wave
            .max(other.compute_scratch_size_per_wave);
        self.compute_scratch_waves = self.compute_scratch_waves.max(other.compute_scratch_waves);
        self.esgs_ring_size = self.esgs_ring_size.max(other.esgs_ring_size);
        self.gsvs_ring_size = self.gsvs_ring_size.max(other.gsvs_ring_size);
        self.tess_rings |= other.tess_rings;
        self.task_rings |= other.task_rings;
        self.mesh_scratch_ring |= other.mesh_scratch_ring;
        self.attr_ring_size = self.attr_ring_size.max(other.attr_ring_size);
        self.gds |= other.gds;
        self.gds_oa |= other.gds_oa;
        self.sample_positions |= other.sample_positions;
    }

    /// Clamp wave counts so that size * waves fits in 32 bits
    pub fn sanitize(&mut self) {
        self.scratch_waves = clamp_waves(self.scratch_size_per_wave, self.scratch_waves);
        self.compute_scratch_waves =
            clamp_waves(self.compute_scratch_size_per_wave, self.compute_scratch_waves);
    }

    /// Whether every requirement of `other` is already satisfied
    pub fn covers(&self, other: &QueueRingState) -> bool {
        let mut merged = *self;
        merged.merge(other);
        merged == *self
    }
}

fn clamp_waves(size_per_wave: u32, waves: u32) -> u32 {
    if size_per_wave > 0 {
        waves.min(u32::MAX / size_per_wave)
    } else {
        0
    }
}

/// Device-wide scratch worst case over every pipeline that can be bound
/// indirectly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchWorstCase {
    pub size_per_wave: u32,
    pub waves: u32,
    pub compute_size_per_wave: u32,
    pub compute_waves: u32,
}

impl ScratchWorstCase {
    pub fn record(&mut self, ip: QueueType, size_per_wave: u32, waves: u32) {
        match ip {
            QueueType::Graphics => {
                self.size_per_wave = self.size_per_wave.max(size_per_wave);
                self.waves = self.waves.max(waves);
            }
            QueueType::Compute => {
                self.compute_size_per_wave = self.compute_size_per_wave.max(size_per_wave);
                self.compute_waves = self.compute_waves.max(waves);
            }
        }
    }
}

/// Requirements of `cmd_buffers` on top of `current`
pub fn aggregate(
    current: &QueueRingState,
    cmd_buffers: &[&dyn CommandBuffer],
    info: &GpuInfo,
    worst_case: &Mutex<ScratchWorstCase>,
) -> QueueRingState {
    let mut needs = *current;
    let mut indirect_binds = false;

    for cb in cmd_buffers {
        needs.merge(&cb.ring_usage().to_ring_state(info));
        indirect_binds |= cb.uses_indirect_pipeline_binds();
    }

    if indirect_binds {
        let worst = worst_case.lock();
        needs.scratch_size_per_wave = needs.scratch_size_per_wave.max(worst.size_per_wave);
        needs.scratch_waves = needs.scratch_waves.max(worst.waves);
        needs.compute_scratch_size_per_wave =
            needs.compute_scratch_size_per_wave.max(worst.compute_size_per_wave);
        needs.compute_scratch_waves = needs.compute_scratch_waves.max(worst.compute_waves);
    }

    // Merging `current` back may restore a wave count above the clamp;
    // fields stay monotonic and the byte accessors clamp instead.
    needs.sanitize();
    needs.merge(current);
    needs
}

/// Requirements of the gang follower given its current state and the leader's
///
/// Task shaders use the scratch size of the graphics pipeline that launches
/// them, and the task rings are shared with the leader.
pub fn follower_needs(current: &QueueRingState, leader: &QueueRingState) -> QueueRingState {
    let mut needs = *current;
    needs.compute_scratch_size_per_wave = needs
        .compute_scratch_size_per_wave
        .max(leader.scratch_size_per_wave);
    needs.compute_scratch_waves = needs.compute_scratch_waves.max(leader.scratch_waves);
    needs.task_rings |= leader.task_rings;
    needs
}
