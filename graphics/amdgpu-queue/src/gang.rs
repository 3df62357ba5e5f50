//! Gang submission between a leader queue and its compute follower
//!
//! The two queues synchronize through a pair of monotonic 32-bit counters
//! in one small GPU buffer. Each queue writes only its own counter and
//! waits on the other's with a greater-or-equal compare, so no host lock
//! is involved.
//!
//! For the n-th gang submission (`v = n`):
//!
//! ```text
//! leader  pre : wait done >= v - 1, write started = v
//! follower pre: wait started >= v
//! follower post: end of pipe, write done = v
//! leader  post: wait done >= v
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use gal::{BoDescriptor, BoFlags, MemoryDomain, QueueType, Result, Winsys};

use crate::info::GpuInfo;
use crate::pm4::CmdBuilder;
use crate::preamble::{PreambleBuilder, PreambleTriple};
use crate::resources::{GpuBuffer, RingResourceSet};
use crate::ring_state::QueueRingState;
use crate::stream::HwStream;

/// A monotonic counter living in GPU memory
///
/// Only ever read or written by command-processor packets.
#[derive(Debug, Clone, Copy)]
pub struct GangCounter {
    va: u64,
}

impl GangCounter {
    /// Stall until the counter reaches `value`
    pub fn wait_at_least(&self, cs: &mut CmdBuilder, value: u32) {
        cs.wait_mem_gte(self.va, value);
    }

    /// Store `value` when the command processor reaches this point
    pub fn signal(&self, cs: &mut CmdBuilder, value: u32) {
        cs.write_data(self.va, &[value]);
    }

    /// Store `value` once all prior work on the queue has retired
    pub fn signal_at_end_of_pipe(&self, cs: &mut CmdBuilder, value: u32) {
        cs.release_mem_eop(self.va, value);
    }
}

/// Byte offsets of the two counters
const STARTED_OFFSET: u64 = 0;
const DONE_OFFSET: u64 = 4;

/// Counter pair shared by leader and follower
pub struct GangSemaphore {
    bo: Arc<GpuBuffer>,
    /// Leader to follower: the leader reached submission `v`
    started: GangCounter,
    /// Follower to leader: the follower finished submission `v`
    done: GangCounter,
    issued: u32,
}

impl GangSemaphore {
    pub fn create(ws: &Arc<dyn Winsys>) -> Result<Self> {
        let desc = BoDescriptor::new(8, MemoryDomain::Gtt)
            .alignment(8)
            .flags(BoFlags::CPU_ACCESS | BoFlags::ZERO_VRAM | BoFlags::NO_INTERPROCESS_SHARING);
        let bo = GpuBuffer::create(ws, &desc)?;
        bo.write(0, &[0, 0])?;

        let va = bo.va();
        log::info!("Gang semaphore created at {:#x}", va);
        Ok(Self {
            started: GangCounter { va: va + STARTED_OFFSET },
            done: GangCounter { va: va + DONE_OFFSET },
            bo,
            issued: 0,
        })
    }

    /// Value for the next gang submission
    pub fn next_value(&mut self) -> u32 {
        self.issued = self.issued.wrapping_add(1);
        self.issued
    }

    /// Number of gang submissions issued so far
    pub fn issued(&self) -> u32 {
        self.issued
    }

    /// Last value the follower reported done, read from the host
    pub fn read_done(&self) -> Result<u32> {
        let mut out = [0u32; 1];
        self.bo.read(DONE_OFFSET, &mut out)?;
        Ok(out[0])
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.bo
    }
}

/// Gang wait preambles and postambles for one submission
pub struct GangWaitStreams {
    pub value: u32,
    pub leader_pre: HwStream,
    pub follower_pre: HwStream,
    pub follower_post: HwStream,
    pub leader_post: HwStream,
}

impl GangWaitStreams {
    pub fn build(
        ws: &Arc<dyn Winsys>,
        info: &GpuInfo,
        leader_ip: QueueType,
        sem: &GangSemaphore,
        value: u32,
    ) -> Result<Self> {
        let handle = sem.bo.handle();
        let new_cs = |ip: QueueType| {
            let mut cs = CmdBuilder::new(ip, info.gfx_level);
            cs.add_buffer(handle);
            cs
        };

        let mut leader_pre = new_cs(leader_ip);
        sem.done.wait_at_least(&mut leader_pre, value.wrapping_sub(1));
        sem.started.signal(&mut leader_pre, value);

        let mut follower_pre = new_cs(QueueType::Compute);
        sem.started.wait_at_least(&mut follower_pre, value);

        let mut follower_post = new_cs(QueueType::Compute);
        sem.done.signal_at_end_of_pipe(&mut follower_post, value);

        let mut leader_post = new_cs(leader_ip);
        sem.done.wait_at_least(&mut leader_post, value);

        Ok(Self {
            value,
            leader_pre: HwStream::from_builder(ws, leader_pre, false)?,
            follower_pre: HwStream::from_builder(ws, follower_pre, false)?,
            follower_post: HwStream::from_builder(ws, follower_post, false)?,
            leader_post: HwStream::from_builder(ws, leader_post, false)?,
        })
    }
}

/// Follower queue state owned by the leader queue
///
/// Field order is drop order: streams go before the buffers they use.
pub struct GangState {
    pub preambles: Option<PreambleTriple>,
    /// Streams built for `issued + 1` that no kernel submission has taken yet
    pending: Option<GangWaitStreams>,
    in_flight: VecDeque<GangWaitStreams>,
    pub semaphore: Option<GangSemaphore>,
    pub builder: PreambleBuilder,
    pub state: QueueRingState,
    pub resources: RingResourceSet,
}

impl GangState {
    pub fn new() -> Self {
        Self {
            preambles: None,
            pending: None,
            in_flight: VecDeque::new(),
            semaphore: None,
            builder: PreambleBuilder::new(),
            state: QueueRingState::default(),
            resources: RingResourceSet::default(),
        }
    }

    /// Create the semaphore on first use
    pub fn semaphore(&mut self, ws: &Arc<dyn Winsys>) -> Result<&mut GangSemaphore> {
        if self.semaphore.is_none() {
            self.semaphore = Some(GangSemaphore::create(ws)?);
        }
        self.semaphore.as_mut().ok_or(gal::Error::InvalidParameter)
    }

    /// Drop wait streams of submissions the follower has finished
    pub fn reclaim(&mut self) -> Result<()> {
        let Some(sem) = &self.semaphore else {
            return Ok(());
        };
        let done = sem.read_done()?;
        while self.in_flight.front().is_some_and(|s| s.value <= done) {
            self.in_flight.pop_front();
        }
        Ok(())
    }

    /// Build the wait streams for the next gang submission
    ///
    /// The counter does not move until [`GangState::commit_waits`]. Streams
    /// left over from a submission that failed before reaching the kernel are
    /// replaced, so the next attempt reuses the same value.
    pub fn prepare_waits(
        &mut self,
        ws: &Arc<dyn Winsys>,
        info: &GpuInfo,
        leader_ip: QueueType,
    ) -> Result<&GangWaitStreams> {
        self.reclaim()?;
        self.pending = None;
        let sem = self.semaphore(ws)?;
        let value = sem.issued().wrapping_add(1);
        let streams = GangWaitStreams::build(ws, info, leader_ip, sem, value)?;
        Ok(&*self.pending.insert(streams))
    }

    /// Consume the pending value once the kernel accepted the submission
    pub fn commit_waits(&mut self) -> Result<u32> {
        let streams = self.pending.take().ok_or(gal::Error::InvalidParameter)?;
        let Some(sem) = self.semaphore.as_mut() else {
            return Err(gal::Error::InvalidParameter);
        };
        let value = sem.next_value();
        debug_assert_eq!(value, streams.value);
        self.in_flight.push_back(streams);
        Ok(value)
    }

    /// Wait streams prepared for the submission being built
    pub fn pending(&self) -> Option<&GangWaitStreams> {
        self.pending.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl Default for GangState {
    fn default() -> Self {
        Self::new()
    }
}
