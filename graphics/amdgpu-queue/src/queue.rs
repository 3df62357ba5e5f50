//! Hardware queues
//!
//! A queue owns its ring state, the resources backing it and the cached
//! preambles built from them, all behind one lock. Graphics queues also own
//! the state of their gang follower.

use std::sync::Arc;

use gal::{QueueType, Result, SyncOp, Winsys};
use parking_lot::Mutex;

use crate::device::AmdDevice;
use crate::gang::GangState;
use crate::info::GfxLevel;
use crate::preamble::{PreambleBuilder, PreambleInputs, PreambleTriple, ShadowRegs};
use crate::resources::{commit, prepare_replacement, RingResourceSet};
use crate::ring_state::{aggregate, follower_needs, QueueRingState};
use crate::submit::{build_plan, PlanInputs, SubmissionPlan, SubmitInfo};

/// Field order is drop order: streams go before the buffers they use.
struct QueueInner {
    preambles: Option<PreambleTriple>,
    gang: GangState,
    shadow: Option<ShadowRegs>,
    builder: PreambleBuilder,
    state: QueueRingState,
    resources: RingResourceSet,
    last_shader_upload_seq: u64,
}

pub struct Queue {
    inner: Mutex<QueueInner>,
    device: AmdDevice,
    ip: QueueType,
    index: u32,
}

impl Queue {
    pub(crate) fn new(device: AmdDevice, ip: QueueType, index: u32) -> Result<Self> {
        let shared = device.shared();
        let shadow = if ip == QueueType::Graphics
            && shared.config.shadow_regs
            && shared.info.gfx_level >= GfxLevel::Gfx11
        {
            Some(ShadowRegs::create(&shared.ws, &shared.info)?)
        } else {
            None
        };

        log::debug!("Created {:?} queue {}", ip, index);

        Ok(Self {
            inner: Mutex::new(QueueInner {
                preambles: None,
                gang: GangState::new(),
                shadow,
                builder: PreambleBuilder::new(),
                state: QueueRingState::default(),
                resources: RingResourceSet::default(),
                last_shader_upload_seq: 0,
            }),
            device,
            ip,
            index,
        })
    }

    pub fn ip(&self) -> QueueType {
        self.ip
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn device(&self) -> &AmdDevice {
        &self.device
    }

    /// Current ring state
    pub fn ring_state(&self) -> QueueRingState {
        self.inner.lock().state
    }

    /// Ring state of the gang follower
    pub fn follower_ring_state(&self) -> QueueRingState {
        self.inner.lock().gang.state
    }

    /// Preamble triples built for this queue so far
    pub fn preamble_builds(&self) -> u64 {
        self.inner.lock().builder.triples_built()
    }

    /// Gang submissions issued so far
    pub fn gang_issued(&self) -> u32 {
        self.inner.lock().gang.semaphore.as_ref().map_or(0, |s| s.issued())
    }

    /// Buffers backing the current ring state
    pub fn ring_resources(&self) -> RingResourceSet {
        self.inner.lock().resources.clone()
    }

    /// Grow the queue's rings to cover `needs`
    ///
    /// Returns whether anything changed. On failure the queue keeps its
    /// previous resources and preambles.
    pub fn reconcile(&self, needs: &QueueRingState) -> Result<bool> {
        let mut inner = self.inner.lock();
        self.reconcile_leader(&mut inner, needs)
    }

    fn reconcile_leader(&self, inner: &mut QueueInner, needs: &QueueRingState) -> Result<bool> {
        let mut merged = inner.state;
        merged.merge(needs);
        if merged == inner.state && inner.preambles.is_some() {
            return Ok(false);
        }

        let shared = self.device.shared();
        let candidate = prepare_replacement(
            &shared.ws,
            &shared.info,
            self.ip,
            &inner.state,
            &inner.resources,
            &merged,
            None,
        )?;
        let inputs = PreambleInputs {
            ip: self.ip,
            info: &shared.info,
            state: &candidate.state,
            resources: &candidate.resources,
            shadow: inner.shadow.as_ref(),
            init_state: shared.init_state.as_ref(),
        };
        let triple = inner.builder.build(&shared.ws, &inputs)?;

        if !candidate.resources.same_identity(&inner.resources) {
            log::info!(
                "{:?} queue {}: rings grown ({} new buffers), scratch {} bytes, esgs {}, gsvs {}",
                self.ip,
                self.index,
                candidate.allocated,
                candidate.state.scratch_bytes(),
                candidate.state.esgs_ring_size,
                candidate.state.gsvs_ring_size
            );
        }

        let old_preambles = inner.preambles.replace(triple);
        let old_resources = commit(&mut inner.state, &mut inner.resources, candidate);
        drop(old_preambles);
        drop(old_resources);
        Ok(true)
    }

    fn reconcile_follower(&self, inner: &mut QueueInner) -> Result<bool> {
        let needs = follower_needs(&inner.gang.state, &inner.state);
        let gang = &mut inner.gang;
        if needs == gang.state && gang.preambles.is_some() {
            return Ok(false);
        }

        let shared = self.device.shared();
        let candidate = prepare_replacement(
            &shared.ws,
            &shared.info,
            QueueType::Compute,
            &gang.state,
            &gang.resources,
            &needs,
            inner.resources.task_rings.as_ref(),
        )?;
        let inputs = PreambleInputs {
            ip: QueueType::Compute,
            info: &shared.info,
            state: &candidate.state,
            resources: &candidate.resources,
            shadow: None,
            init_state: None,
        };
        let triple = gang.builder.build(&shared.ws, &inputs)?;

        log::info!(
            "{:?} queue {}: gang follower rings updated, compute scratch {} bytes",
            self.ip,
            self.index,
            candidate.state.compute_scratch_bytes()
        );

        let old_preambles = gang.preambles.replace(triple);
        let old_resources = commit(&mut gang.state, &mut gang.resources, candidate);
        drop(old_preambles);
        drop(old_resources);
        Ok(true)
    }

    /// Submit command buffers to the queue
    ///
    /// Returns once the kernel accepted every stream. A rejected submission
    /// or a GPU fault found while polling marks the device lost.
    pub fn submit(&self, submit: &SubmitInfo<'_>) -> Result<()> {
        if self.device.is_lost() {
            return Err(gal::Error::DeviceLost);
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let shared = self.device.shared();

        if submit.command_buffers.is_empty() {
            return self.submit_empty(submit);
        }

        let needs = aggregate(
            &inner.state,
            submit.command_buffers,
            &shared.info,
            &shared.pipeline_scratch,
        );
        self.reconcile_leader(inner, &needs)?;

        let has_gang = submit.has_gang();
        if has_gang {
            if !shared.info.has_gang_submit {
                log::warn!("Gang work submitted on a device without gang submit support");
                return Err(gal::Error::NotSupported);
            }
            self.reconcile_follower(inner)?;
            inner.gang.prepare_waits(&shared.ws, &shared.info, self.ip)?;
        }

        let perf = match submit.command_buffers.iter().find_map(|cb| cb.perf_counter_pass()) {
            Some(pass) => {
                let lock = self.device.perf_lock()?;
                Some(lock.streams(&shared.ws, &shared.info, self.ip, pass)?)
            }
            None => None,
        };

        let mut waits = submit.waits.to_vec();
        let upload_seq = submit
            .command_buffers
            .iter()
            .map(|cb| cb.shader_upload_seq())
            .max()
            .unwrap_or(0);
        if upload_seq > inner.last_shader_upload_seq {
            if let Some(syncobj) = self.device.shader_upload_syncobj() {
                waits.push(SyncOp::timeline(syncobj, upload_seq));
            }
        }

        let leader = inner.preambles.as_ref().ok_or(gal::Error::InvalidParameter)?;
        let follower = if has_gang {
            let triple = inner.gang.preambles.as_ref().ok_or(gal::Error::InvalidParameter)?;
            let waits = inner.gang.pending().ok_or(gal::Error::InvalidParameter)?;
            Some((triple, waits))
        } else {
            None
        };

        let config = &shared.config;
        let window_size = if config.fault_detection() {
            1
        } else {
            submit.command_buffers.len()
        };
        let inputs = PlanInputs {
            queue_index: self.index,
            chaining: config.chaining(),
            window_size,
            max_ibs: config.max_ibs_per_submit,
            leader,
            follower,
            perf: perf.as_deref(),
            waits,
            signals: submit.signals,
            uses_shadow_regs: inner.shadow.is_some(),
        };
        let plan = build_plan(submit.command_buffers, &inputs)?;
        log::debug!(
            "{:?} queue {}: {} command buffers in {} kernel submissions, {} entries{}",
            self.ip,
            self.index,
            submit.command_buffers.len(),
            plan.subs.len(),
            plan.user_entries(),
            if plan.has_gang { ", gang" } else { "" }
        );

        self.submit_plan(&plan)?;
        if has_gang {
            inner.gang.commit_waits()?;
        }
        inner.last_shader_upload_seq = inner.last_shader_upload_seq.max(upload_seq);
        Ok(())
    }

    fn submit_empty(&self, submit: &SubmitInfo<'_>) -> Result<()> {
        if submit.waits.is_empty() && submit.signals.is_empty() {
            return Ok(());
        }

        let plan = SubmissionPlan {
            subs: vec![crate::submit::SubSubmission {
                request: gal::SubmitRequest {
                    waits: submit.waits.to_vec(),
                    signals: submit.signals.to_vec(),
                    ..gal::SubmitRequest::default()
                },
                window: 0,
                ends_window: true,
                preambles: 0,
                postambles: 0,
            }],
            has_gang: false,
        };
        self.submit_plan(&plan)
    }

    fn submit_plan(&self, plan: &SubmissionPlan) -> Result<()> {
        let ws = self.device.winsys();
        let fault_detection = self.device.config().fault_detection();

        for sub in &plan.subs {
            #[cfg(feature = "debug-logging")]
            crate::submit::trace_request(&sub.request);

            if let Err(err) = ws.cs_submit(&sub.request) {
                log::error!("{:?} queue {}: submission rejected: {}", self.ip, self.index, err);
                self.report_fault(ws, plan.has_gang);
                self.device.mark_lost();
                return Err(gal::Error::DeviceLost);
            }

            if fault_detection && sub.ends_window && self.report_fault(ws, plan.has_gang) {
                log::error!(
                    "{:?} queue {}: GPU fault after window {}",
                    self.ip,
                    self.index,
                    sub.window
                );
                self.device.mark_lost();
                return Err(gal::Error::DeviceLost);
            }
        }
        Ok(())
    }

    /// Poll the kernel for a fault on this queue and its follower
    fn report_fault(&self, ws: &Arc<dyn Winsys>, gang: bool) -> bool {
        let mut faulted = false;
        let mut poll = |ip: QueueType| {
            if let Some(fault) = ws.query_fault(ip, self.index) {
                log::error!("{}", fault);
                faulted = true;
            }
        };
        poll(self.ip);
        if gang {
            poll(QueueType::Compute);
        }
        faulted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_buffer::{CommandBuffer, RecordedCommandBuffer, RingUsage};
    use crate::config::DeviceConfig;
    use crate::gem::GemWinsys;
    use crate::info::GpuInfo;

    fn device(gem: &Arc<GemWinsys>, gfx_level: GfxLevel, config: DeviceConfig) -> AmdDevice {
        AmdDevice::new(gem.clone(), GpuInfo::new(gfx_level), config).unwrap()
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let gem = Arc::new(GemWinsys::new());
        let queue = device(&gem, GfxLevel::Gfx10_3, DeviceConfig::default())
            .create_queue(QueueType::Graphics, 0)
            .unwrap();

        let needs = QueueRingState {
            esgs_ring_size: 64 * 1024,
            ..QueueRingState::default()
        };
        assert!(queue.reconcile(&needs).unwrap());
        assert!(!queue.reconcile(&needs).unwrap());
        assert!(!queue.reconcile(&QueueRingState::default()).unwrap());
        assert_eq!(queue.preamble_builds(), 1);
    }

    #[test]
    fn test_first_reconcile_builds_preambles() {
        let gem = Arc::new(GemWinsys::new());
        let queue = device(&gem, GfxLevel::Gfx9, DeviceConfig::default())
            .create_queue(QueueType::Compute, 1)
            .unwrap();
        assert!(queue.reconcile(&QueueRingState::default()).unwrap());
        assert_eq!(queue.preamble_builds(), 1);
    }

    #[test]
    fn test_shadow_regs_on_gfx11_graphics() {
        let gem = Arc::new(GemWinsys::new());
        let config = DeviceConfig::default().with_debug(crate::config::DebugFlags::SHADOW_REGS);
        let dev = device(&gem, GfxLevel::Gfx11, config);
        let ws = dev.winsys().clone();
        let gfx = dev.create_queue(QueueType::Graphics, 0).unwrap();
        let compute = dev.create_queue(QueueType::Compute, 0).unwrap();

        let cb = RecordedCommandBuffer::builder(QueueType::Graphics).build(&ws).unwrap();
        let cbs: [&dyn CommandBuffer; 1] = [&cb];
        gfx.submit(&SubmitInfo {
            command_buffers: &cbs,
            ..SubmitInfo::default()
        })
        .unwrap();
        assert!(gem.submissions()[0].uses_shadow_regs);

        let ccb = RecordedCommandBuffer::builder(QueueType::Compute).build(&ws).unwrap();
        let ccbs: [&dyn CommandBuffer; 1] = [&ccb];
        compute
            .submit(&SubmitInfo {
                command_buffers: &ccbs,
                ..SubmitInfo::default()
            })
            .unwrap();
        assert!(!gem.submissions()[1].uses_shadow_regs);
    }

    #[test]
    fn test_gang_needs_support() {
        let gem = Arc::new(GemWinsys::new());
        let dev = device(&gem, GfxLevel::Gfx10, DeviceConfig::default());
        let ws = dev.winsys().clone();
        let queue = dev.create_queue(QueueType::Graphics, 0).unwrap();

        let cb = RecordedCommandBuffer::builder(QueueType::Graphics)
            .gang(&[])
            .rings(RingUsage {
                task_rings: true,
                ..RingUsage::default()
            })
            .build(&ws)
            .unwrap();
        let cbs: [&dyn CommandBuffer; 1] = [&cb];
        let err = queue
            .submit(&SubmitInfo {
                command_buffers: &cbs,
                ..SubmitInfo::default()
            })
            .unwrap_err();
        assert_eq!(err, gal::Error::NotSupported);
        assert!(!dev.is_lost());
    }

    #[test]
    fn test_shader_upload_wait_added_once() {
        let gem = Arc::new(GemWinsys::new());
        let config = DeviceConfig {
            async_shader_upload: true,
            ..DeviceConfig::default()
        };
        let dev = device(&gem, GfxLevel::Gfx10_3, config);
        let ws = dev.winsys().clone();
        let syncobj = dev.shader_upload_syncobj().unwrap();
        let queue = dev.create_queue(QueueType::Graphics, 0).unwrap();

        let cb = RecordedCommandBuffer::builder(QueueType::Graphics)
            .usage(crate::cmd_buffer::UsageFlags::SIMULTANEOUS_USE)
            .shader_upload_seq(5)
            .build(&ws)
            .unwrap();
        let cbs: [&dyn CommandBuffer; 1] = [&cb];
        let info = SubmitInfo {
            command_buffers: &cbs,
            ..SubmitInfo::default()
        };
        queue.submit(&info).unwrap();
        queue.submit(&info).unwrap();

        let subs = gem.submissions();
        assert_eq!(subs[0].waits, vec![SyncOp::timeline(syncobj, 5)]);
        assert!(subs[1].waits.is_empty());
        // The synthesized wait selects the full-flush preamble.
        assert_ne!(subs[0].entries[0].cs, subs[1].entries[0].cs);
    }
}
