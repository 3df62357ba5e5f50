//! Submission planning
//!
//! A submission is cut into windows (one command buffer per window when
//! fault detection is on, otherwise everything at once). Inside a window
//! consecutive streams are chained in place, and the resulting entries are
//! split into kernel submissions no larger than the IB limit, each framed
//! by preambles and, for the very last one, postambles.

use gal::{CsHandle, Result, SubmitRequest, SyncOp};

use crate::cmd_buffer::{CommandBuffer, UsageFlags};
use crate::gang::GangWaitStreams;
use crate::perf_lock::PassStreams;
use crate::preamble::PreambleTriple;
use crate::stream::HwStream;

/// One submission as handed to [`Queue::submit`](crate::Queue::submit)
#[derive(Clone, Copy, Default)]
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [&'a dyn CommandBuffer],
    pub waits: &'a [SyncOp],
    pub signals: &'a [SyncOp],
}

impl SubmitInfo<'_> {
    /// Submission needing gang follower work
    pub fn has_gang(&self) -> bool {
        self.command_buffers.iter().any(|cb| cb.gang_stream().is_some())
    }
}

/// One kernel submission of a plan
#[derive(Debug, Clone)]
pub struct SubSubmission {
    pub request: SubmitRequest,
    /// Window the submission belongs to
    pub window: usize,
    /// Last kernel submission of its window
    pub ends_window: bool,
    pub preambles: usize,
    pub postambles: usize,
}

/// Ordered kernel submissions for one `submit` call
#[derive(Debug, Clone, Default)]
pub struct SubmissionPlan {
    pub subs: Vec<SubSubmission>,
    pub has_gang: bool,
}

impl SubmissionPlan {
    /// Number of user stream entries left after chaining
    pub fn user_entries(&self) -> usize {
        self.subs
            .iter()
            .map(|s| s.request.entries.len() - s.preambles - s.postambles)
            .sum()
    }
}

/// Everything besides the command buffers a plan is built from
pub struct PlanInputs<'a> {
    pub queue_index: u32,
    pub chaining: bool,
    pub window_size: usize,
    pub max_ibs: usize,
    pub leader: &'a PreambleTriple,
    pub follower: Option<(&'a PreambleTriple, &'a GangWaitStreams)>,
    pub perf: Option<&'a PassStreams>,
    pub waits: Vec<SyncOp>,
    pub signals: &'a [SyncOp],
    pub uses_shadow_regs: bool,
}

/// A chain head and the streams chained after it
struct PlannedEntry<'a> {
    head: &'a HwStream,
    chained: Vec<CsHandle>,
    can_patch: bool,
}

/// Chain the streams of one window
///
/// Follower entries go before the leader entry of the same command
/// buffer. A follower stream that starts a new entry also breaks the
/// leader chain so execution order between the two queues is kept.
fn chain_window<'a>(
    cmd_buffers: &[&'a dyn CommandBuffer],
    chaining: bool,
) -> Result<Vec<PlannedEntry<'a>>> {
    for &cb in cmd_buffers {
        cb.stream().unchain()?;
        if let Some(follower) = cb.gang_stream() {
            follower.unchain()?;
        }
    }

    let mut entries: Vec<PlannedEntry<'a>> = Vec::new();
    // Index of the entry whose chain may continue, with its tail stream
    let mut leader_tail: Option<(usize, &'a HwStream)> = None;
    let mut follower_tail: Option<(usize, &'a HwStream)> = None;

    for &cb in cmd_buffers {
        let can_chain_next = chaining && !cb.usage_flags().contains(UsageFlags::SIMULTANEOUS_USE);
        let mut leader_break = false;

        if let Some(follower) = cb.gang_stream() {
            match follower_tail {
                Some((idx, tail)) if tail.is_chainable() => {
                    tail.chain_to(follower)?;
                    entries[idx].chained.push(follower.handle());
                    follower_tail = can_chain_next.then_some((idx, follower));
                }
                _ => {
                    entries.push(PlannedEntry {
                        head: follower,
                        chained: Vec::new(),
                        can_patch: can_chain_next,
                    });
                    leader_break = true;
                    follower_tail = can_chain_next.then_some((entries.len() - 1, follower));
                }
            }
        }

        let stream = cb.stream();
        match leader_tail {
            Some((idx, tail)) if !leader_break && tail.is_chainable() => {
                tail.chain_to(stream)?;
                entries[idx].chained.push(stream.handle());
                leader_tail = can_chain_next.then_some((idx, stream));
            }
            _ => {
                entries.push(PlannedEntry {
                    head: stream,
                    chained: Vec::new(),
                    can_patch: can_chain_next,
                });
                leader_tail = can_chain_next.then_some((entries.len() - 1, stream));
            }
        }
    }

    Ok(entries)
}

/// Build the kernel submissions for `cmd_buffers`
pub fn build_plan(
    cmd_buffers: &[&dyn CommandBuffer],
    inputs: &PlanInputs<'_>,
) -> Result<SubmissionPlan> {
    let full_flush = !inputs.waits.is_empty();

    let mut initial: Vec<&HwStream> = Vec::new();
    let mut continuation: Vec<&HwStream> = Vec::new();
    let mut postambles: Vec<&HwStream> = Vec::new();

    if let Some(perf) = inputs.perf {
        initial.push(&perf.lock);
        postambles.push(&perf.unlock);
    }
    initial.push(inputs.leader.initial(full_flush));
    continuation.push(&inputs.leader.continuation);
    if let Some((follower, waits)) = inputs.follower {
        for list in [&mut initial, &mut continuation] {
            list.push(&waits.leader_pre);
            list.push(&waits.follower_pre);
        }
        initial.push(follower.initial(full_flush));
        continuation.push(&follower.continuation);
        postambles.push(&waits.follower_post);
        postambles.push(&waits.leader_post);
    }

    let reserved = initial.len().max(continuation.len()) + postambles.len();
    if inputs.max_ibs <= reserved {
        log::error!(
            "IB limit {} leaves no room next to {} preambles and postambles",
            inputs.max_ibs,
            reserved
        );
        return Err(gal::Error::InvalidParameter);
    }
    let capacity = inputs.max_ibs - reserved;

    let mut calls = inputs.leader.calls.clone();
    if let Some((follower, _)) = inputs.follower {
        calls.extend_from_slice(&follower.calls);
    }

    let window_size = inputs.window_size.max(1);
    let num_windows = cmd_buffers.len().div_ceil(window_size);
    let mut plan = SubmissionPlan {
        subs: Vec::new(),
        has_gang: inputs.follower.is_some(),
    };

    for (window, cbs) in cmd_buffers.chunks(window_size).enumerate() {
        let entries = chain_window(cbs, inputs.chaining)?;
        let num_chunks = entries.len().div_ceil(capacity);

        for (c, chunk) in entries.chunks(capacity).enumerate() {
            let first = window == 0 && c == 0;
            let last = window + 1 == num_windows && c + 1 == num_chunks;
            let pre = if first { &initial } else { &continuation };
            let post: &[&HwStream] = if last { &postambles } else { &[] };

            let mut request = SubmitRequest {
                uses_shadow_regs: inputs.uses_shadow_regs,
                ..SubmitRequest::default()
            };
            request
                .entries
                .extend(pre.iter().map(|s| s.entry(inputs.queue_index, false)));
            for entry in chunk {
                request.entries.push(entry.head.entry(inputs.queue_index, entry.can_patch));
                request.streams.extend_from_slice(&entry.chained);
            }
            request
                .entries
                .extend(post.iter().map(|s| s.entry(inputs.queue_index, false)));
            request.streams.extend_from_slice(&calls);
            if first {
                request.waits = inputs.waits.clone();
            }
            if last {
                request.signals = inputs.signals.to_vec();
            }

            plan.subs.push(SubSubmission {
                request,
                window,
                ends_window: c + 1 == num_chunks,
                preambles: pre.len(),
                postambles: post.len(),
            });
        }
    }

    Ok(plan)
}

/// Trace every entry of a kernel submission
#[cfg(feature = "debug-logging")]
pub(crate) fn trace_request(request: &SubmitRequest) {
    for (i, entry) in request.entries.iter().enumerate() {
        log::trace!(
            "  ib {}: {:?}[{}] {:?} va {:#x} {} dw{}",
            i,
            entry.ip,
            entry.queue_index,
            entry.cs,
            entry.va,
            entry.dwords,
            if entry.can_patch { " patchable" } else { "" }
        );
    }
}
