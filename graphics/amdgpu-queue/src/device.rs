//! AMD GPU device state shared by its queues

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gal::{QueueType, Result, SyncObjHandle, Winsys};
use parking_lot::Mutex;

use crate::config::DeviceConfig;
use crate::info::GpuInfo;
use crate::perf_lock::PerfCounterLock;
use crate::preamble::build_init_state_stream;
use crate::queue::Queue;
use crate::ring_state::ScratchWorstCase;
use crate::stream::HwStream;

pub(crate) struct DeviceShared {
    pub(crate) ws: Arc<dyn Winsys>,
    pub(crate) info: GpuInfo,
    pub(crate) config: DeviceConfig,
    lost: AtomicBool,
    pub(crate) pipeline_scratch: Mutex<ScratchWorstCase>,
    pub(crate) init_state: Option<HwStream>,
    perf_lock: Mutex<Option<Arc<PerfCounterLock>>>,
    shader_upload: Option<SyncObjHandle>,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        if let Some(syncobj) = self.shader_upload.take() {
            self.ws.syncobj_destroy(syncobj);
        }
    }
}

/// Handle to an AMD GPU device
///
/// Cheap to clone; every queue keeps the device alive.
#[derive(Clone)]
pub struct AmdDevice {
    shared: Arc<DeviceShared>,
}

impl AmdDevice {
    /// Create a device on top of `ws`
    pub fn new(ws: Arc<dyn Winsys>, info: GpuInfo, config: DeviceConfig) -> Result<Self> {
        let init_state = if config.cache_init_state {
            Some(build_init_state_stream(&ws, &info)?)
        } else {
            None
        };

        let shader_upload = if config.async_shader_upload {
            Some(ws.syncobj_create()?)
        } else {
            None
        };

        log::info!(
            "AMD device initialized: {:?}, {} SEs, gang submit {}, debug {:?}",
            info.gfx_level,
            info.num_se,
            if info.has_gang_submit { "on" } else { "off" },
            config.debug
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                ws,
                info,
                config,
                lost: AtomicBool::new(false),
                pipeline_scratch: Mutex::new(ScratchWorstCase::default()),
                init_state,
                perf_lock: Mutex::new(None),
                shader_upload,
            }),
        })
    }

    /// Create a queue of class `ip`
    pub fn create_queue(&self, ip: QueueType, index: u32) -> Result<Queue> {
        Queue::new(self.clone(), ip, index)
    }

    /// Record the scratch needs of a pipeline that may be bound indirectly
    pub fn register_pipeline_scratch(&self, ip: QueueType, size_per_wave: u32, waves: u32) {
        self.shared.pipeline_scratch.lock().record(ip, size_per_wave, waves);
    }

    /// A submission failed or the GPU faulted; all later submissions fail
    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::Acquire)
    }

    pub(crate) fn mark_lost(&self) {
        if !self.shared.lost.swap(true, Ordering::AcqRel) {
            log::error!("AMD device lost");
        }
    }

    pub fn winsys(&self) -> &Arc<dyn Winsys> {
        &self.shared.ws
    }

    pub fn info(&self) -> &GpuInfo {
        &self.shared.info
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    /// Timeline syncobj signalled by asynchronous shader uploads
    pub fn shader_upload_syncobj(&self) -> Option<SyncObjHandle> {
        self.shared.shader_upload
    }

    pub(crate) fn shared(&self) -> &DeviceShared {
        &self.shared
    }

    /// Performance-counter lock, created on first use
    pub(crate) fn perf_lock(&self) -> Result<Arc<PerfCounterLock>> {
        let mut lock = self.shared.perf_lock.lock();
        if let Some(perf) = lock.as_ref() {
            return Ok(perf.clone());
        }
        let perf = Arc::new(PerfCounterLock::create(&self.shared.ws)?);
        *lock = Some(perf.clone());
        Ok(perf)
    }
}
