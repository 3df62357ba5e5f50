//! Queue classes and kernel submission requests

use alloc::vec::Vec;

use crate::{CsHandle, SyncOp};

/// Hardware queue class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// Graphics queue (supports all operations)
    Graphics,
    /// Asynchronous compute queue
    Compute,
}

impl QueueType {
    /// Check if this queue supports graphics operations
    pub fn supports_graphics(&self) -> bool {
        matches!(self, QueueType::Graphics)
    }

    /// Check if this queue supports compute operations
    pub fn supports_compute(&self) -> bool {
        true
    }
}

/// One indirect buffer handed to the command processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEntry {
    pub ip: QueueType,
    pub queue_index: u32,
    /// Stream the entry starts executing
    pub cs: CsHandle,
    pub va: u64,
    pub dwords: u32,
    /// The kernel may patch the stream tail
    pub can_patch: bool,
}

/// A single kernel command submission
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Ordered indirect buffers
    pub entries: Vec<StreamEntry>,
    /// Every stream reached by this request, chained ones included.
    /// The kernel makes their buffer lists resident.
    pub streams: Vec<CsHandle>,
    pub waits: Vec<SyncOp>,
    pub signals: Vec<SyncOp>,
    /// The graphics preamble loads state from a shadow-register buffer
    pub uses_shadow_regs: bool,
}

impl SubmitRequest {
    /// Check whether this request carries no command streams
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
