//! Ring resource provisioning
//!
//! Ring buffers are replaced, never resized. [`prepare_replacement`] builds
//! a [`Candidate`] holding the buffers the queue would own after growth;
//! buffers created for it are freed automatically if the candidate is
//! dropped, so a failed pass leaves nothing behind. [`commit`] installs it.

use std::sync::Arc;

use gal::{BoDescriptor, BoFlags, BoHandle, BoInfo, MemoryDomain, QueueType, Result, Winsys};

use crate::descriptors::{self, RingBuffers};
use crate::info::GpuInfo;
use crate::ring_state::QueueRingState;

/// Attribute ring alignment
pub const ATTR_RING_ALIGNMENT: u64 = 2 * 1024 * 1024;
/// GDS and OA allocation sizes
pub const GDS_SIZE: u64 = 256;
pub const GDS_OA_SIZE: u64 = 4;

/// A buffer object destroyed on drop
pub struct GpuBuffer {
    ws: Arc<dyn Winsys>,
    info: BoInfo,
    resident: bool,
}

impl GpuBuffer {
    pub fn create(ws: &Arc<dyn Winsys>, desc: &BoDescriptor) -> Result<Arc<Self>> {
        let info = ws.buffer_create(desc)?;
        Ok(Arc::new(Self {
            ws: ws.clone(),
            info,
            resident: false,
        }))
    }

    /// Create and add to the global residency list
    pub fn create_resident(ws: &Arc<dyn Winsys>, desc: &BoDescriptor) -> Result<Arc<Self>> {
        let info = ws.buffer_create(desc)?;
        if let Err(err) = ws.buffer_make_resident(info.handle, true) {
            ws.buffer_destroy(info.handle);
            return Err(err);
        }
        Ok(Arc::new(Self {
            ws: ws.clone(),
            info,
            resident: true,
        }))
    }

    pub fn handle(&self) -> BoHandle {
        self.info.handle
    }

    pub fn va(&self) -> u64 {
        self.info.va
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    pub fn write(&self, offset: u64, data: &[u32]) -> Result<()> {
        self.ws.buffer_write(self.info.handle, offset, data)
    }

    pub fn read(&self, offset: u64, out: &mut [u32]) -> Result<()> {
        self.ws.buffer_read(self.info.handle, offset, out)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if self.resident {
            if let Err(err) = self.ws.buffer_make_resident(self.info.handle, false) {
                log::warn!("Failed to evict {:?}: {}", self.info.handle, err);
            }
        }
        self.ws.buffer_destroy(self.info.handle);
    }
}

/// Buffers backing a queue's [`QueueRingState`]
#[derive(Clone, Default)]
pub struct RingResourceSet {
    pub scratch: Option<Arc<GpuBuffer>>,
    pub compute_scratch: Option<Arc<GpuBuffer>>,
    pub descriptor: Option<Arc<GpuBuffer>>,
    pub esgs_ring: Option<Arc<GpuBuffer>>,
    pub gsvs_ring: Option<Arc<GpuBuffer>>,
    pub tess_rings: Option<Arc<GpuBuffer>>,
    pub task_rings: Option<Arc<GpuBuffer>>,
    pub mesh_scratch_ring: Option<Arc<GpuBuffer>>,
    pub attr_ring: Option<Arc<GpuBuffer>>,
    pub gds: Option<Arc<GpuBuffer>>,
    pub gds_oa: Option<Arc<GpuBuffer>>,
}

impl RingResourceSet {
    fn all(&self) -> [&Option<Arc<GpuBuffer>>; 11] {
        [
            &self.scratch,
            &self.compute_scratch,
            &self.descriptor,
            &self.esgs_ring,
            &self.gsvs_ring,
            &self.tess_rings,
            &self.task_rings,
            &self.mesh_scratch_ring,
            &self.attr_ring,
            &self.gds,
            &self.gds_oa,
        ]
    }

    /// Handles of every buffer in the set
    pub fn handles(&self) -> Vec<BoHandle> {
        self.all()
            .into_iter()
            .flatten()
            .map(|bo| bo.handle())
            .collect()
    }

    /// Whether both sets hold exactly the same buffer objects
    pub fn same_identity(&self, other: &RingResourceSet) -> bool {
        self.all()
            .into_iter()
            .zip(other.all())
            .all(|(a, b)| match (a, b) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            })
    }
}

/// Replacement resources built by [`prepare_replacement`]
pub struct Candidate {
    pub state: QueueRingState,
    pub resources: RingResourceSet,
    /// Buffers created by this pass
    pub allocated: usize,
}

fn vram(size: u64) -> BoDescriptor {
    BoDescriptor::new(size, MemoryDomain::Vram)
        .flags(BoFlags::NO_CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING)
}

/// Allocate whatever `needs` has beyond `current`
///
/// Buffers that do not grow are shared with `current_res`. When
/// `shared_task_rings` is given it is used instead of a new task-rings
/// buffer. Any failure drops the partially built candidate.
pub fn prepare_replacement(
    ws: &Arc<dyn Winsys>,
    info: &GpuInfo,
    ip: QueueType,
    current: &QueueRingState,
    current_res: &RingResourceSet,
    needs: &QueueRingState,
    shared_task_rings: Option<&Arc<GpuBuffer>>,
) -> Result<Candidate> {
    let mut res = current_res.clone();
    let mut allocated = 0;

    if needs.scratch_bytes() > current.scratch_bytes() {
        res.scratch = Some(GpuBuffer::create(ws, &vram(needs.scratch_bytes()))?);
        allocated += 1;
    }

    if needs.compute_scratch_bytes() > current.compute_scratch_bytes() {
        res.compute_scratch = Some(GpuBuffer::create(ws, &vram(needs.compute_scratch_bytes()))?);
        allocated += 1;
    }

    if needs.esgs_ring_size > current.esgs_ring_size {
        res.esgs_ring = Some(GpuBuffer::create(ws, &vram(needs.esgs_ring_size as u64))?);
        allocated += 1;
    }

    if needs.gsvs_ring_size > current.gsvs_ring_size {
        res.gsvs_ring = Some(GpuBuffer::create(ws, &vram(needs.gsvs_ring_size as u64))?);
        allocated += 1;
    }

    if needs.tess_rings && !current.tess_rings {
        res.tess_rings = Some(GpuBuffer::create(ws, &vram(info.tess_rings_size()))?);
        allocated += 1;
    }

    if needs.task_rings && res.task_rings.is_none() {
        if let Some(shared) = shared_task_rings {
            res.task_rings = Some(shared.clone());
        } else {
            // Consumers poll ready bits in the rings, so they must start zeroed.
            let desc = BoDescriptor::new(info.task.bo_size(), MemoryDomain::Vram)
                .alignment(256)
                .flags(BoFlags::CPU_ACCESS | BoFlags::ZERO_VRAM | BoFlags::NO_INTERPROCESS_SHARING);
            let task = GpuBuffer::create(ws, &desc)?;
            allocated += 1;
            init_task_control_block(info, &task)?;
            res.task_rings = Some(task);
        }
    }

    if needs.mesh_scratch_ring && !current.mesh_scratch_ring {
        let desc = vram(info.mesh_scratch_ring_size()).alignment(256);
        res.mesh_scratch_ring = Some(GpuBuffer::create(ws, &desc)?);
        allocated += 1;
    }

    if needs.attr_ring_size > current.attr_ring_size {
        let desc = vram(needs.attr_ring_size as u64).alignment(ATTR_RING_ALIGNMENT);
        res.attr_ring = Some(GpuBuffer::create(ws, &desc)?);
        allocated += 1;
    }

    if needs.gds && !current.gds {
        let desc = BoDescriptor::new(GDS_SIZE, MemoryDomain::Gds).alignment(4);
        res.gds = Some(GpuBuffer::create_resident(ws, &desc)?);
        allocated += 1;
    }

    if needs.gds_oa && !current.gds_oa {
        let desc = BoDescriptor::new(GDS_OA_SIZE, MemoryDomain::Oa).alignment(1);
        res.gds_oa = Some(GpuBuffer::create_resident(ws, &desc)?);
        allocated += 1;
    }

    let rings_changed = !rings_identity_eq(&res, current_res);
    let samples_added = needs.sample_positions && !current.sample_positions;
    let missing_descriptor = res.descriptor.is_none() && needs_descriptor(needs, &res, ip);
    if rings_changed || samples_added || missing_descriptor {
        res.descriptor = build_descriptor(ws, info, needs, &res, ip)?;
        allocated += res.descriptor.is_some() as usize;
    }

    Ok(Candidate {
        state: *needs,
        resources: res,
        allocated,
    })
}

/// Compare the buffers the descriptor table points at
fn rings_identity_eq(a: &RingResourceSet, b: &RingResourceSet) -> bool {
    let same = |x: &Option<Arc<GpuBuffer>>, y: &Option<Arc<GpuBuffer>>| match (x, y) {
        (Some(x), Some(y)) => Arc::ptr_eq(x, y),
        (None, None) => true,
        _ => false,
    };
    same(&a.scratch, &b.scratch)
        && same(&a.esgs_ring, &b.esgs_ring)
        && same(&a.gsvs_ring, &b.gsvs_ring)
        && same(&a.tess_rings, &b.tess_rings)
        && same(&a.task_rings, &b.task_rings)
        && same(&a.mesh_scratch_ring, &b.mesh_scratch_ring)
        && same(&a.attr_ring, &b.attr_ring)
}

fn needs_descriptor(needs: &QueueRingState, res: &RingResourceSet, ip: QueueType) -> bool {
    let scratch = ip == QueueType::Graphics && res.scratch.is_some();
    descriptors::table_size(needs, scratch) > 0
}

fn build_descriptor(
    ws: &Arc<dyn Winsys>,
    info: &GpuInfo,
    needs: &QueueRingState,
    res: &RingResourceSet,
    ip: QueueType,
) -> Result<Option<Arc<GpuBuffer>>> {
    let scratch = if ip == QueueType::Graphics { res.scratch.as_deref() } else { None };
    let size = descriptors::table_size(needs, scratch.is_some());
    if size == 0 {
        return Ok(None);
    }

    let desc = BoDescriptor::new(size, MemoryDomain::Vram)
        .alignment(256)
        .flags(BoFlags::CPU_ACCESS | BoFlags::READ_ONLY | BoFlags::NO_INTERPROCESS_SHARING);
    let bo = GpuBuffer::create(ws, &desc)?;

    let rings = RingBuffers {
        scratch,
        esgs: res.esgs_ring.as_deref(),
        gsvs: res.gsvs_ring.as_deref(),
        tess: res.tess_rings.as_deref(),
        task: res.task_rings.as_deref(),
        mesh_scratch: res.mesh_scratch_ring.as_deref(),
        attr: res.attr_ring.as_deref(),
    };
    let table = descriptors::build_table(info, needs, &rings, size)?;
    descriptors::write_table(&bo, &table)?;
    Ok(Some(bo))
}

/// Write the task-ring control block: write, read and dealloc positions,
/// the entry count and the draw ring address
fn init_task_control_block(info: &GpuInfo, task: &GpuBuffer) -> Result<()> {
    let entries = info.task.num_entries;
    let draw_va = task.va() + info.task.draw_ring_offset();
    let block = [
        entries,
        0,
        entries,
        0,
        entries,
        0,
        entries,
        draw_va as u32,
        (draw_va >> 32) as u32,
    ];
    task.write(0, &block)
}

/// Install `candidate`, returning the resources it replaces
///
/// The caller drops the returned set only after every stream that still
/// references it is gone.
pub fn commit(
    state: &mut QueueRingState,
    resources: &mut RingResourceSet,
    candidate: Candidate,
) -> RingResourceSet {
    *state = candidate.state;
    std::mem::replace(resources, candidate.resources)
}
