//! GEM (Graphics Execution Manager) software winsys
//!
//! An in-process implementation of [`Winsys`] that keeps buffer contents
//! and command streams in host memory and records every kernel
//! submission. It backs the tests and any bring-up without a kernel
//! driver, and carries fault-injection knobs for the error paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use gal::{
    align_up, BoDescriptor, BoFlags, BoHandle, BoInfo, CsHandle, CsInfo, Error, GpuFault,
    MemoryDomain, QueueType, Result, SubmitRequest, SyncObjHandle, Winsys,
};
use parking_lot::Mutex;

/// GEM buffer object
pub struct GemObject {
    pub handle: BoHandle,
    pub size: u64,
    /// GPU virtual address
    pub gpu_addr: u64,
    pub domain: MemoryDomain,
    pub flags: BoFlags,
    /// Host copy of the contents, only kept for CPU-visible objects
    data: Vec<u32>,
}

/// Uploaded command stream
struct GemStream {
    ip: QueueType,
    dwords: Vec<u32>,
    buffers: Vec<BoHandle>,
}

/// Software GEM winsys
pub struct GemWinsys {
    objects: Mutex<HashMap<BoHandle, GemObject>>,
    streams: Mutex<HashMap<CsHandle, GemStream>>,
    next_handle: AtomicU32,
    vram_allocator: Mutex<VaAllocator>,
    gtt_allocator: Mutex<VaAllocator>,
    gds_allocator: Mutex<VaAllocator>,
    resident: Mutex<HashSet<BoHandle>>,
    syncobjs: Mutex<HashSet<SyncObjHandle>>,
    submissions: Mutex<Vec<SubmitRequest>>,
    destroyed: Mutex<Vec<BoHandle>>,
    premature_frees: Mutex<Vec<BoHandle>>,
    /// Remaining successful buffer allocations before failing
    alloc_budget: Mutex<Option<usize>>,
    reject_next_submit: AtomicBool,
    pending_fault: Mutex<Option<GpuFault>>,
}

const VRAM_BASE: u64 = 0x8_0000_0000;
const GTT_BASE: u64 = 0x40_0000_0000;

impl GemWinsys {
    /// 4 GiB of VRAM and 8 GiB of GTT address space
    pub fn new() -> Self {
        Self::with_sizes(4 << 30, 8 << 30)
    }

    pub fn with_sizes(vram_size: u64, gtt_size: u64) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            vram_allocator: Mutex::new(VaAllocator::new(VRAM_BASE, vram_size)),
            gtt_allocator: Mutex::new(VaAllocator::new(GTT_BASE, gtt_size)),
            gds_allocator: Mutex::new(VaAllocator::new(0, 64 * 1024)),
            resident: Mutex::new(HashSet::new()),
            syncobjs: Mutex::new(HashSet::new()),
            submissions: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            premature_frees: Mutex::new(Vec::new()),
            alloc_budget: Mutex::new(None),
            reject_next_submit: AtomicBool::new(false),
            pending_fault: Mutex::new(None),
        }
    }

    fn next_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Let `count` more buffer allocations succeed, then fail every one
    pub fn fail_allocations_after(&self, count: usize) {
        *self.alloc_budget.lock() = Some(count);
    }

    pub fn clear_allocation_failures(&self) {
        *self.alloc_budget.lock() = None;
    }

    /// Make the next `cs_submit` fail
    pub fn reject_next_submit(&self) {
        self.reject_next_submit.store(true, Ordering::SeqCst);
    }

    /// Report `fault` on the next poll of its queue
    pub fn inject_fault(&self, fault: GpuFault) {
        *self.pending_fault.lock() = Some(fault);
    }

    /// Every accepted submission so far
    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions.lock().clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn live_streams(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn live_syncobjs(&self) -> usize {
        self.syncobjs.lock().len()
    }

    pub fn is_live(&self, bo: BoHandle) -> bool {
        self.objects.lock().contains_key(&bo)
    }

    pub fn is_resident(&self, bo: BoHandle) -> bool {
        self.resident.lock().contains(&bo)
    }

    pub fn buffer_size(&self, bo: BoHandle) -> Option<u64> {
        self.objects.lock().get(&bo).map(|obj| obj.size)
    }

    /// Buffers destroyed so far, in order
    pub fn destroyed_buffers(&self) -> Vec<BoHandle> {
        self.destroyed.lock().clone()
    }

    /// Buffers destroyed while a live stream still referenced them
    pub fn premature_frees(&self) -> Vec<BoHandle> {
        self.premature_frees.lock().clone()
    }

    pub fn cs_dwords(&self, cs: CsHandle) -> Option<Vec<u32>> {
        self.streams.lock().get(&cs).map(|s| s.dwords.clone())
    }

    pub fn cs_buffers(&self, cs: CsHandle) -> Option<Vec<BoHandle>> {
        self.streams.lock().get(&cs).map(|s| s.buffers.clone())
    }

    pub fn cs_ip(&self, cs: CsHandle) -> Option<QueueType> {
        self.streams.lock().get(&cs).map(|s| s.ip)
    }

    fn take_alloc_budget(&self) -> Result<()> {
        let mut budget = self.alloc_budget.lock();
        match budget.as_mut() {
            Some(0) => Err(Error::OutOfDeviceMemory),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Default for GemWinsys {
    fn default() -> Self {
        Self::new()
    }
}

impl Winsys for GemWinsys {
    fn buffer_create(&self, desc: &BoDescriptor) -> Result<BoInfo> {
        if desc.size == 0 || !desc.alignment.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        self.take_alloc_budget()?;

        let va = match desc.domain {
            MemoryDomain::Vram => self.vram_allocator.lock().alloc(desc.size, desc.alignment)?,
            MemoryDomain::Gtt => self.gtt_allocator.lock().alloc(desc.size, desc.alignment)?,
            MemoryDomain::Gds | MemoryDomain::Oa => {
                self.gds_allocator.lock().alloc(desc.size, 4)?;
                0
            }
        };

        let handle = BoHandle(self.next_handle());
        let data = if desc.flags.contains(BoFlags::CPU_ACCESS) {
            vec![0; desc.size.div_ceil(4) as usize]
        } else {
            Vec::new()
        };

        self.objects.lock().insert(
            handle,
            GemObject {
                handle,
                size: desc.size,
                gpu_addr: va,
                domain: desc.domain,
                flags: desc.flags,
                data,
            },
        );

        Ok(BoInfo {
            handle,
            va,
            size: desc.size,
            domain: desc.domain,
        })
    }

    fn buffer_destroy(&self, bo: BoHandle) {
        if self.objects.lock().remove(&bo).is_none() {
            log::warn!("Destroying unknown buffer {:?}", bo);
            return;
        }
        self.resident.lock().remove(&bo);
        self.destroyed.lock().push(bo);

        let referenced = self
            .streams
            .lock()
            .values()
            .any(|s| s.buffers.contains(&bo));
        if referenced {
            log::warn!("Buffer {:?} freed while a live stream references it", bo);
            self.premature_frees.lock().push(bo);
        }
    }

    fn buffer_write(&self, bo: BoHandle, offset: u64, data: &[u32]) -> Result<()> {
        let mut objects = self.objects.lock();
        let obj = objects.get_mut(&bo).ok_or(Error::InvalidHandle)?;
        if !obj.flags.contains(BoFlags::CPU_ACCESS) || offset % 4 != 0 {
            return Err(Error::InvalidParameter);
        }

        let start = (offset / 4) as usize;
        let end = start + data.len();
        if end > obj.data.len() {
            return Err(Error::InvalidParameter);
        }
        obj.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn buffer_read(&self, bo: BoHandle, offset: u64, out: &mut [u32]) -> Result<()> {
        let objects = self.objects.lock();
        let obj = objects.get(&bo).ok_or(Error::InvalidHandle)?;
        if !obj.flags.contains(BoFlags::CPU_ACCESS) || offset % 4 != 0 {
            return Err(Error::InvalidParameter);
        }

        let start = (offset / 4) as usize;
        let end = start + out.len();
        if end > obj.data.len() {
            return Err(Error::InvalidParameter);
        }
        out.copy_from_slice(&obj.data[start..end]);
        Ok(())
    }

    fn buffer_make_resident(&self, bo: BoHandle, resident: bool) -> Result<()> {
        if !self.objects.lock().contains_key(&bo) {
            return Err(Error::InvalidHandle);
        }
        let mut set = self.resident.lock();
        if resident {
            set.insert(bo);
        } else {
            set.remove(&bo);
        }
        Ok(())
    }

    fn cs_create(&self, ip: QueueType, dwords: &[u32], buffers: &[BoHandle]) -> Result<CsInfo> {
        if dwords.is_empty() {
            return Err(Error::InvalidParameter);
        }
        {
            let objects = self.objects.lock();
            if let Some(bo) = buffers.iter().find(|bo| !objects.contains_key(bo)) {
                log::error!("Stream references dead buffer {:?}", bo);
                return Err(Error::InvalidHandle);
            }
        }

        let bytes = dwords.len() as u64 * 4;
        let va = self.gtt_allocator.lock().alloc(bytes, 256)?;
        let handle = CsHandle(self.next_handle());
        self.streams.lock().insert(
            handle,
            GemStream {
                ip,
                dwords: dwords.to_vec(),
                buffers: buffers.to_vec(),
            },
        );

        Ok(CsInfo {
            handle,
            va,
            dwords: dwords.len() as u32,
        })
    }

    fn cs_patch(&self, cs: CsHandle, dword_offset: u32, dwords: &[u32]) -> Result<()> {
        let mut streams = self.streams.lock();
        let stream = streams.get_mut(&cs).ok_or(Error::InvalidHandle)?;
        let start = dword_offset as usize;
        let end = start + dwords.len();
        if end > stream.dwords.len() {
            return Err(Error::InvalidParameter);
        }
        stream.dwords[start..end].copy_from_slice(dwords);
        Ok(())
    }

    fn cs_destroy(&self, cs: CsHandle) {
        if self.streams.lock().remove(&cs).is_none() {
            log::warn!("Destroying unknown stream {:?}", cs);
        }
    }

    fn cs_submit(&self, request: &SubmitRequest) -> Result<()> {
        if self.reject_next_submit.swap(false, Ordering::SeqCst) {
            return Err(Error::SubmitFailed("kernel rejected the submission".into()));
        }

        {
            let streams = self.streams.lock();
            let missing = request
                .entries
                .iter()
                .map(|e| e.cs)
                .chain(request.streams.iter().copied())
                .find(|cs| !streams.contains_key(cs));
            if let Some(cs) = missing {
                log::error!("Submission references dead stream {:?}", cs);
                return Err(Error::InvalidHandle);
            }
        }

        self.submissions.lock().push(request.clone());
        Ok(())
    }

    fn query_fault(&self, ip: QueueType, queue_index: u32) -> Option<GpuFault> {
        let mut pending = self.pending_fault.lock();
        let hit = matches!(*pending, Some(f) if f.ip == ip && f.queue_index == queue_index);
        if hit {
            pending.take()
        } else {
            None
        }
    }

    fn syncobj_create(&self) -> Result<SyncObjHandle> {
        let handle = SyncObjHandle(self.next_handle());
        self.syncobjs.lock().insert(handle);
        Ok(handle)
    }

    fn syncobj_destroy(&self, syncobj: SyncObjHandle) {
        self.syncobjs.lock().remove(&syncobj);
    }
}

/// Virtual-address bump allocator
struct VaAllocator {
    base: u64,
    size: u64,
    next: u64,
}

impl VaAllocator {
    fn new(base: u64, size: u64) -> Self {
        Self { base, size, next: 0 }
    }

    fn alloc(&mut self, size: u64, alignment: u64) -> Result<u64> {
        let offset = align_up(self.next, alignment.max(4));
        let end = offset.checked_add(align_up(size, 4)).ok_or(Error::OutOfDeviceMemory)?;
        if end > self.size {
            return Err(Error::OutOfDeviceMemory);
        }

        self.next = end;
        Ok(self.base + offset)
    }
}
