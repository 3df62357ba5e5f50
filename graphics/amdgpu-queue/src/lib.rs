//! AMD GPU command submission core
//!
//! Turns finalized command buffers into kernel submissions: provisions the
//! shared rings and scratch their shaders use, keeps the preambles that
//! program those rings, coordinates the gang compute queue used for task
//! work and chains user streams where that is legal.
//!
//! ```text
//!  submit(cmd buffers, waits, signals)
//!        │
//!        ▼
//!  aggregate ──► prepare_replacement ──► preambles ──► commit
//!        │                                               │
//!        ▼                                               ▼
//!  gang follower (same steps, shared task rings)   old preambles, then
//!        │                                         old buffers, dropped
//!        ▼
//!  chain + window + split ──► Winsys::cs_submit ──► fault poll
//! ```

pub mod cmd_buffer;
pub mod config;
pub mod descriptors;
pub mod device;
pub mod gang;
pub mod gem;
pub mod info;
pub mod perf_lock;
pub mod pm4;
pub mod preamble;
pub mod queue;
pub mod resources;
pub mod ring_state;
pub mod stream;
pub mod submit;

pub use cmd_buffer::{CommandBuffer, RecordedCommandBuffer, RingUsage, UsageFlags};
pub use config::{DebugFlags, DeviceConfig};
pub use device::AmdDevice;
pub use gem::GemWinsys;
pub use info::{GfxLevel, GpuInfo};
pub use queue::Queue;
pub use ring_state::QueueRingState;
pub use stream::HwStream;
pub use submit::{SubmissionPlan, SubmitInfo};
