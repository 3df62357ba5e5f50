//! Kernel winsys interface
//!
//! Everything the submission core asks of the kernel goes through
//! [`Winsys`]. Calls are blocking and made on the submitting thread.

use core::fmt;

use crate::{BoDescriptor, BoHandle, BoInfo, QueueType, Result, SubmitRequest, SyncObjHandle};

/// Kernel handle of a finalized command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CsHandle(pub u32);

/// A finalized command stream resident in GPU memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsInfo {
    pub handle: CsHandle,
    pub va: u64,
    pub dwords: u32,
}

/// GPU fault report gathered from the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuFault {
    pub ip: QueueType,
    pub queue_index: u32,
    /// Faulting virtual address, zero for hangs
    pub addr: u64,
    pub status: u32,
}

impl fmt::Display for GpuFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} queue {}: fault at {:#x} (status {:#x})",
            self.ip, self.queue_index, self.addr, self.status
        )
    }
}

/// Kernel GPU memory and submission backend
pub trait Winsys: Send + Sync {
    /// Create a buffer object
    fn buffer_create(&self, desc: &BoDescriptor) -> Result<BoInfo>;

    /// Destroy a buffer object
    fn buffer_destroy(&self, bo: BoHandle);

    /// Write dwords at a byte offset of a CPU-accessible buffer
    fn buffer_write(&self, bo: BoHandle, offset: u64, data: &[u32]) -> Result<()>;

    /// Read dwords at a byte offset of a CPU-accessible buffer
    fn buffer_read(&self, bo: BoHandle, offset: u64, out: &mut [u32]) -> Result<()>;

    /// Add or remove a buffer from the global residency list
    fn buffer_make_resident(&self, bo: BoHandle, resident: bool) -> Result<()>;

    /// Upload a command stream referencing `buffers`
    fn cs_create(&self, ip: QueueType, dwords: &[u32], buffers: &[BoHandle]) -> Result<CsInfo>;

    /// Overwrite dwords of an uploaded command stream
    fn cs_patch(&self, cs: CsHandle, dword_offset: u32, dwords: &[u32]) -> Result<()>;

    /// Destroy a command stream
    fn cs_destroy(&self, cs: CsHandle);

    /// Submit a request to the kernel
    fn cs_submit(&self, request: &SubmitRequest) -> Result<()>;

    /// Poll the kernel for a fault on a hardware queue
    fn query_fault(&self, ip: QueueType, queue_index: u32) -> Option<GpuFault>;

    /// Create a timeline synchronization object
    fn syncobj_create(&self) -> Result<SyncObjHandle>;

    /// Destroy a synchronization object
    fn syncobj_destroy(&self, syncobj: SyncObjHandle);
}
