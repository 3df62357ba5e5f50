//! Kernel synchronization objects

/// Kernel handle of a synchronization object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncObjHandle(pub u32);

/// A wait or signal on a synchronization object
///
/// A `point` of zero addresses a binary object, anything else a timeline
/// point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOp {
    pub syncobj: SyncObjHandle,
    pub point: u64,
}

impl SyncOp {
    pub const fn binary(syncobj: SyncObjHandle) -> Self {
        Self { syncobj, point: 0 }
    }

    pub const fn timeline(syncobj: SyncObjHandle, point: u64) -> Self {
        Self { syncobj, point }
    }

    /// Check if this operation targets a timeline point
    pub fn is_timeline(&self) -> bool {
        self.point != 0
    }
}
