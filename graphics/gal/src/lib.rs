//! Graphics Abstraction Layer (GAL)
//!
//! This crate describes the contract between a GPU driver's submission core
//! and the kernel-side GPU memory and command-submission interface (the
//! "winsys"). It carries no hardware knowledge of its own.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │  driver submission core  │   builds command streams, rings, preambles
//! └────────────┬─────────────┘
//!              │ Winsys trait
//! ┌────────────▼─────────────┐
//! │  kernel winsys backend   │   buffer objects, command streams, syncobjs
//! └──────────────────────────┘
//! ```
//!
//! The GAL provides:
//!
//! - Buffer-object descriptors, handles and placement flags
//! - Queue classes and the shape of a kernel submission request
//! - Kernel synchronization-object operations (binary and timeline)
//! - The [`Winsys`] trait implemented by kernel backends
//!
//! # Usage
//!
//! ```ignore
//! use gal::{BoDescriptor, BoFlags, MemoryDomain, Winsys};
//!
//! let bo = ws.buffer_create(
//!     &BoDescriptor::new(4096, MemoryDomain::Gtt).flags(BoFlags::CPU_ACCESS),
//! )?;
//! ws.buffer_write(bo.handle, 0, &[0xdead_beef])?;
//! ```

#![no_std]

extern crate alloc;

pub mod memory;
pub mod queue;
pub mod sync;
pub mod winsys;

// Re-exports
pub use memory::{align_up, BoDescriptor, BoFlags, BoHandle, BoInfo, MemoryDomain};
pub use queue::{QueueType, StreamEntry, SubmitRequest};
pub use sync::{SyncObjHandle, SyncOp};
pub use winsys::{CsHandle, CsInfo, GpuFault, Winsys};

use alloc::string::String;

/// GAL version
pub const GAL_VERSION: (u32, u32, u32) = (0, 2, 0);

/// Result type for GAL operations
pub type Result<T> = core::result::Result<T, Error>;

/// GAL error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Out of host memory
    OutOfMemory,
    /// Out of device memory
    OutOfDeviceMemory,
    /// Invalid parameter
    InvalidParameter,
    /// Handle does not name a live object
    InvalidHandle,
    /// Feature not supported
    NotSupported,
    /// The kernel refused a command submission
    SubmitFailed(String),
    /// Device lost
    DeviceLost,
}

impl Error {
    /// Whether the error is an allocation failure the caller may recover from
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory | Error::OutOfDeviceMemory)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::OutOfDeviceMemory => write!(f, "Out of device memory"),
            Error::InvalidParameter => write!(f, "Invalid parameter"),
            Error::InvalidHandle => write!(f, "Invalid handle"),
            Error::NotSupported => write!(f, "Not supported"),
            Error::SubmitFailed(msg) => write!(f, "Submission failed: {}", msg),
            Error::DeviceLost => write!(f, "Device lost"),
        }
    }
}
