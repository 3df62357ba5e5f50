use std::sync::Arc;

use amdgpu_queue::pm4;
use amdgpu_queue::{
    AmdDevice, CommandBuffer, DebugFlags, DeviceConfig, GemWinsys, GfxLevel, GpuInfo, Queue,
    RecordedCommandBuffer, RingUsage, SubmitInfo, UsageFlags,
};
use gal::{CsHandle, GpuFault, QueueType, SyncObjHandle, SyncOp, Winsys};

fn setup(
    gfx_level: GfxLevel,
    config: DeviceConfig,
) -> (Arc<GemWinsys>, Arc<dyn Winsys>, AmdDevice) {
    let gem = Arc::new(GemWinsys::new());
    let ws: Arc<dyn Winsys> = gem.clone();
    let device = AmdDevice::new(ws.clone(), GpuInfo::new(gfx_level), config).unwrap();
    (gem, ws, device)
}

fn graphics_cb(ws: &Arc<dyn Winsys>, usage: UsageFlags, rings: RingUsage) -> RecordedCommandBuffer {
    RecordedCommandBuffer::builder(QueueType::Graphics)
        .usage(usage)
        .rings(rings)
        .build(ws)
        .unwrap()
}

fn submit(
    queue: &Queue,
    cbs: &[&dyn CommandBuffer],
    waits: &[SyncOp],
    signals: &[SyncOp],
) -> gal::Result<()> {
    queue.submit(&SubmitInfo {
        command_buffers: cbs,
        waits,
        signals,
    })
}

/// Reference value of the first WAIT_REG_MEM in a stream
fn wait_ref(gem: &GemWinsys, cs: CsHandle) -> u32 {
    let dwords = gem.cs_dwords(cs).unwrap();
    let at = dwords
        .iter()
        .position(|&d| d == pm4::pkt3(pm4::PKT3_WAIT_REG_MEM, 5, false))
        .unwrap();
    dwords[at + 4]
}

#[test]
fn test_ring_state_never_shrinks() {
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    let big = graphics_cb(
        &ws,
        UsageFlags::ONE_TIME_SUBMIT,
        RingUsage {
            scratch_size_per_wave: 1024,
            scratch_waves: 32,
            esgs_ring_size: 64 * 1024,
            ..RingUsage::default()
        },
    );
    submit(&queue, &[&big], &[], &[]).unwrap();
    let after_big = queue.ring_state();
    let buffers = gem.live_buffers();

    let small = graphics_cb(
        &ws,
        UsageFlags::ONE_TIME_SUBMIT,
        RingUsage {
            scratch_size_per_wave: 512,
            scratch_waves: 16,
            esgs_ring_size: 32 * 1024,
            ..RingUsage::default()
        },
    );
    submit(&queue, &[&small], &[], &[]).unwrap();
    assert_eq!(queue.ring_state(), after_big);
    assert_eq!(gem.live_buffers(), buffers);
    assert_eq!(queue.preamble_builds(), 1);

    let gsvs = graphics_cb(
        &ws,
        UsageFlags::ONE_TIME_SUBMIT,
        RingUsage {
            gsvs_ring_size: 16 * 1024,
            ..RingUsage::default()
        },
    );
    submit(&queue, &[&gsvs], &[], &[]).unwrap();
    let grown = queue.ring_state();
    assert!(grown.covers(&after_big));
    assert_eq!(grown.esgs_ring_size, 64 * 1024);
    assert_eq!(grown.gsvs_ring_size, 16 * 1024);
    assert_eq!(grown.scratch_size_per_wave, 1024);
    assert_eq!(queue.preamble_builds(), 2);
}

#[test]
fn test_replaced_buffers_outlive_their_preambles() {
    let (gem, ws, device) = setup(GfxLevel::Gfx9, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    let rings = |esgs| RingUsage {
        esgs_ring_size: esgs,
        ..RingUsage::default()
    };
    let first = graphics_cb(&ws, UsageFlags::ONE_TIME_SUBMIT, rings(64 * 1024));
    submit(&queue, &[&first], &[], &[]).unwrap();
    let old_esgs = queue.ring_resources().esgs_ring.as_ref().unwrap().handle();
    let old_desc = queue.ring_resources().descriptor.as_ref().unwrap().handle();

    let second = graphics_cb(&ws, UsageFlags::ONE_TIME_SUBMIT, rings(128 * 1024));
    submit(&queue, &[&second], &[], &[]).unwrap();

    assert!(!gem.is_live(old_esgs));
    assert!(!gem.is_live(old_desc));
    assert!(gem.premature_frees().is_empty());
    let new_esgs = queue.ring_resources().esgs_ring.as_ref().unwrap().handle();
    assert_eq!(gem.buffer_size(new_esgs), Some(128 * 1024));
}

#[test]
fn test_unchanged_rings_reuse_preambles() {
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();
    let cb = graphics_cb(
        &ws,
        UsageFlags::SIMULTANEOUS_USE,
        RingUsage {
            tess_rings: true,
            ..RingUsage::default()
        },
    );

    submit(&queue, &[&cb], &[], &[]).unwrap();
    let streams = gem.live_streams();
    submit(&queue, &[&cb], &[], &[]).unwrap();
    submit(&queue, &[&cb], &[], &[]).unwrap();

    assert_eq!(queue.preamble_builds(), 1);
    assert_eq!(gem.live_streams(), streams);
    let subs = gem.submissions();
    assert_eq!(subs[1].entries[0].cs, subs[2].entries[0].cs);
}

#[test]
fn test_chaining_follows_simultaneous_use() {
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    for mask in 0u32..16 {
        let cbs: Vec<RecordedCommandBuffer> = (0..4)
            .map(|i| {
                let usage = if mask & (1 << i) != 0 {
                    UsageFlags::SIMULTANEOUS_USE
                } else {
                    UsageFlags::ONE_TIME_SUBMIT
                };
                graphics_cb(&ws, usage, RingUsage::default())
            })
            .collect();
        let refs: Vec<&dyn CommandBuffer> = cbs.iter().map(|cb| cb as &dyn CommandBuffer).collect();
        submit(&queue, &refs, &[], &[]).unwrap();

        let chainable_pairs = (0..3).filter(|i| mask & (1 << i) == 0).count();
        let user: Vec<CsHandle> = cbs.iter().map(|cb| cb.stream().handle()).collect();
        let request = gem.submissions().pop().unwrap();
        let entries = request.entries.iter().filter(|e| user.contains(&e.cs)).count();
        assert_eq!(entries, 4 - chainable_pairs, "flags {:#06b}", mask);

        for (i, cb) in cbs.iter().enumerate().take(3) {
            let expected = (mask & (1 << i) == 0).then(|| cbs[i + 1].stream().handle());
            assert_eq!(cb.stream().chained_to(), expected, "flags {:#06b}", mask);
        }
        assert_eq!(cbs[3].stream().chained_to(), None);
    }
}

#[test]
fn test_no_chaining_debug_flag() {
    let config = DeviceConfig::default().with_debug(DebugFlags::NO_CHAINING);
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, config);
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    let a = graphics_cb(&ws, UsageFlags::ONE_TIME_SUBMIT, RingUsage::default());
    let b = graphics_cb(&ws, UsageFlags::ONE_TIME_SUBMIT, RingUsage::default());
    submit(&queue, &[&a, &b], &[], &[]).unwrap();

    let request = gem.submissions().pop().unwrap();
    assert_eq!(request.entries.len(), 3);
    assert!(request.entries.iter().all(|e| !e.can_patch));
    assert_eq!(a.stream().chained_to(), None);
}

#[test]
fn test_gang_wait_thresholds() {
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    let cb = RecordedCommandBuffer::builder(QueueType::Graphics)
        .usage(UsageFlags::SIMULTANEOUS_USE)
        .rings(RingUsage {
            scratch_size_per_wave: 2048,
            scratch_waves: 16,
            task_rings: true,
            mesh_scratch_ring: true,
            ..RingUsage::default()
        })
        .gang(&[])
        .build(&ws)
        .unwrap();

    for value in 1..=3u32 {
        submit(&queue, &[&cb], &[], &[]).unwrap();
        let request = gem.submissions().pop().unwrap();
        let ips: Vec<QueueType> = request.entries.iter().map(|e| e.ip).collect();
        assert_eq!(
            ips,
            vec![
                QueueType::Graphics,
                QueueType::Graphics,
                QueueType::Compute,
                QueueType::Compute,
                QueueType::Compute,
                QueueType::Graphics,
                QueueType::Compute,
                QueueType::Graphics,
            ]
        );
        assert_eq!(request.entries[4].cs, cb.gang_stream().unwrap().handle());
        assert_eq!(request.entries[5].cs, cb.stream().handle());

        let leader_pre = request.entries[1].cs;
        assert_eq!(wait_ref(&gem, leader_pre), value - 1);
        let dwords = gem.cs_dwords(leader_pre).unwrap();
        let write = dwords
            .iter()
            .position(|&d| d == pm4::pkt3(pm4::PKT3_WRITE_DATA, 3, false))
            .unwrap();
        assert_eq!(dwords[write + 4], value);

        assert_eq!(wait_ref(&gem, request.entries[2].cs), value);

        let follower_post = gem.cs_dwords(request.entries[6].cs).unwrap();
        assert_eq!(pm4::pkt3_opcode(follower_post[0]), pm4::PKT3_RELEASE_MEM);
        assert_eq!(follower_post[5], value);

        assert_eq!(wait_ref(&gem, request.entries[7].cs), value);
    }
    assert_eq!(queue.gang_issued(), 3);

    let follower = queue.follower_ring_state();
    assert!(follower.task_rings);
    assert_eq!(follower.compute_scratch_size_per_wave, 2048);
    assert_eq!(follower.compute_scratch_waves, 16);
}

#[test]
fn test_failed_gang_submit_keeps_counter() {
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    let rings = RingUsage {
        scratch_size_per_wave: 1024,
        scratch_waves: 16,
        task_rings: true,
        ..RingUsage::default()
    };
    let gang = RecordedCommandBuffer::builder(QueueType::Graphics)
        .usage(UsageFlags::SIMULTANEOUS_USE)
        .rings(rings)
        .gang(&[])
        .build(&ws)
        .unwrap();
    let sampled = RecordedCommandBuffer::builder(QueueType::Graphics)
        .usage(UsageFlags::SIMULTANEOUS_USE)
        .rings(rings)
        .perf_counter_pass(0)
        .gang(&[])
        .build(&ws)
        .unwrap();

    submit(&queue, &[&gang], &[], &[]).unwrap();
    assert_eq!(queue.gang_issued(), 1);
    let accepted = gem.submissions().len();

    // The perf-counter buffer cannot be allocated.
    gem.fail_allocations_after(0);
    let err = submit(&queue, &[&sampled], &[], &[]).unwrap_err();
    assert_eq!(err, gal::Error::OutOfDeviceMemory);
    assert!(!device.is_lost());
    assert_eq!(gem.submissions().len(), accepted);
    assert_eq!(queue.gang_issued(), 1);
    gem.clear_allocation_failures();

    submit(&queue, &[&gang], &[], &[]).unwrap();
    assert_eq!(queue.gang_issued(), 2);
    let request = gem.submissions().pop().unwrap();
    assert_eq!(wait_ref(&gem, request.entries[1].cs), 1);
    let follower_post = gem.cs_dwords(request.entries[6].cs).unwrap();
    assert_eq!(pm4::pkt3_opcode(follower_post[0]), pm4::PKT3_RELEASE_MEM);
    assert_eq!(follower_post[5], 2);
}

#[test]
fn test_three_buffers_with_esgs_ring() {
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    let first = graphics_cb(
        &ws,
        UsageFlags::ONE_TIME_SUBMIT,
        RingUsage {
            esgs_ring_size: 64 * 1024,
            ..RingUsage::default()
        },
    );
    let second = graphics_cb(&ws, UsageFlags::ONE_TIME_SUBMIT, RingUsage::default());
    let third = graphics_cb(&ws, UsageFlags::ONE_TIME_SUBMIT, RingUsage::default());
    let signal = [SyncOp::binary(SyncObjHandle(42))];

    submit(&queue, &[&first, &second, &third], &[], &signal).unwrap();

    assert_eq!(queue.preamble_builds(), 1);
    // The ring and its descriptor table
    assert_eq!(gem.live_buffers(), 2);
    let esgs = queue.ring_resources().esgs_ring.as_ref().unwrap().handle();
    assert_eq!(gem.buffer_size(esgs), Some(64 * 1024));

    let subs = gem.submissions();
    assert_eq!(subs.len(), 1);
    let request = &subs[0];
    assert_eq!(request.entries.len(), 2);
    assert_eq!(request.entries[1].cs, first.stream().handle());
    assert!(request.streams.contains(&second.stream().handle()));
    assert!(request.streams.contains(&third.stream().handle()));
    assert_eq!(request.signals, signal.to_vec());
    assert_eq!(first.stream().chained_to(), Some(second.stream().handle()));
    assert_eq!(second.stream().chained_to(), Some(third.stream().handle()));
}

#[test]
fn test_gds_resident_until_queue_teardown() {
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    let cb = graphics_cb(
        &ws,
        UsageFlags::ONE_TIME_SUBMIT,
        RingUsage {
            gds: true,
            ..RingUsage::default()
        },
    );
    submit(&queue, &[&cb], &[], &[]).unwrap();
    let gds = queue.ring_resources().gds.as_ref().unwrap().handle();
    assert_eq!(gem.buffer_size(gds), Some(256));
    assert!(gem.is_resident(gds));

    let grow = graphics_cb(
        &ws,
        UsageFlags::ONE_TIME_SUBMIT,
        RingUsage {
            esgs_ring_size: 64 * 1024,
            gsvs_ring_size: 64 * 1024,
            ..RingUsage::default()
        },
    );
    submit(&queue, &[&grow], &[], &[]).unwrap();
    assert!(gem.is_live(gds));
    assert_eq!(queue.ring_resources().gds.as_ref().unwrap().handle(), gds);

    drop(queue);
    assert!(!gem.is_live(gds));
    assert!(!gem.is_resident(gds));
    assert!(gem.premature_frees().is_empty());
}

#[test]
fn test_failed_growth_rolls_back() {
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    let first = graphics_cb(
        &ws,
        UsageFlags::ONE_TIME_SUBMIT,
        RingUsage {
            esgs_ring_size: 64 * 1024,
            ..RingUsage::default()
        },
    );
    submit(&queue, &[&first], &[], &[]).unwrap();
    let state = queue.ring_state();
    let buffers = gem.live_buffers();
    let esgs = queue.ring_resources().esgs_ring.as_ref().unwrap().handle();

    let grow = graphics_cb(
        &ws,
        UsageFlags::ONE_TIME_SUBMIT,
        RingUsage {
            esgs_ring_size: 128 * 1024,
            gsvs_ring_size: 64 * 1024,
            tess_rings: true,
            ..RingUsage::default()
        },
    );
    gem.fail_allocations_after(1);
    let err = submit(&queue, &[&grow], &[], &[]).unwrap_err();
    assert!(err.is_out_of_memory());

    assert_eq!(queue.ring_state(), state);
    assert_eq!(gem.live_buffers(), buffers);
    assert!(gem.is_live(esgs));
    assert_eq!(queue.preamble_builds(), 1);
    assert!(!device.is_lost());
    assert_eq!(gem.submissions().len(), 1);

    gem.clear_allocation_failures();
    submit(&queue, &[&grow], &[], &[]).unwrap();
    assert_eq!(queue.ring_state().esgs_ring_size, 128 * 1024);
    assert!(gem.premature_frees().is_empty());
}

#[test]
fn test_empty_submission_forwards_sync() {
    let (gem, _ws, device) = setup(GfxLevel::Gfx10_3, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Compute, 0).unwrap();

    let waits = [SyncOp::timeline(SyncObjHandle(3), 10)];
    let signals = [SyncOp::binary(SyncObjHandle(4))];
    submit(&queue, &[], &waits, &signals).unwrap();

    let subs = gem.submissions();
    assert_eq!(subs.len(), 1);
    assert!(subs[0].is_empty());
    assert_eq!(subs[0].waits, waits.to_vec());
    assert_eq!(subs[0].signals, signals.to_vec());
    assert_eq!(queue.preamble_builds(), 0);

    submit(&queue, &[], &[], &[]).unwrap();
    assert_eq!(gem.submissions().len(), 1);
}

#[test]
fn test_gpu_fault_loses_device() {
    let config = DeviceConfig::default().with_debug(DebugFlags::HANG);
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, config);
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    let a = graphics_cb(&ws, UsageFlags::ONE_TIME_SUBMIT, RingUsage::default());
    let b = graphics_cb(&ws, UsageFlags::ONE_TIME_SUBMIT, RingUsage::default());
    let signal = [SyncOp::binary(SyncObjHandle(9))];

    // One kernel submission per command buffer while fault detection is on
    submit(&queue, &[&a, &b], &[], &signal).unwrap();
    let subs = gem.submissions();
    assert_eq!(subs.len(), 2);
    assert!(subs[0].signals.is_empty());
    assert_eq!(subs[1].signals, signal.to_vec());
    assert_eq!(a.stream().chained_to(), None);

    gem.inject_fault(GpuFault {
        ip: QueueType::Graphics,
        queue_index: 0,
        addr: 0xdead_0000,
        status: 0x3,
    });
    let err = submit(&queue, &[&a, &b], &[], &[]).unwrap_err();
    assert_eq!(err, gal::Error::DeviceLost);
    assert!(device.is_lost());
    assert_eq!(gem.submissions().len(), 3);

    assert_eq!(submit(&queue, &[&a], &[], &[]).unwrap_err(), gal::Error::DeviceLost);
    assert_eq!(gem.submissions().len(), 3);
}

#[test]
fn test_rejected_submission_loses_device() {
    let (gem, ws, device) = setup(GfxLevel::Gfx9, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();
    let other = device.create_queue(QueueType::Compute, 0).unwrap();
    let cb = graphics_cb(&ws, UsageFlags::ONE_TIME_SUBMIT, RingUsage::default());

    gem.reject_next_submit();
    assert_eq!(submit(&queue, &[&cb], &[], &[]).unwrap_err(), gal::Error::DeviceLost);
    assert!(device.is_lost());
    assert_eq!(
        other.submit(&SubmitInfo::default()).unwrap_err(),
        gal::Error::DeviceLost
    );
}

#[test]
fn test_perf_counter_lock_wraps_submission() {
    let config = DeviceConfig::default().with_debug(DebugFlags::HANG);
    let (gem, ws, device) = setup(GfxLevel::Gfx10_3, config);
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();

    let sampled = RecordedCommandBuffer::builder(QueueType::Graphics)
        .perf_counter_pass(2)
        .build(&ws)
        .unwrap();
    let plain = graphics_cb(&ws, UsageFlags::ONE_TIME_SUBMIT, RingUsage::default());
    submit(&queue, &[&sampled, &plain], &[], &[]).unwrap();

    let subs = gem.submissions();
    assert_eq!(subs.len(), 2);
    let lock = gem.cs_dwords(subs[0].entries[0].cs).unwrap();
    assert_eq!(pm4::pkt3_opcode(lock[0]), pm4::PKT3_ATOMIC_MEM);
    assert_eq!(subs[0].entries.len(), 3);

    let last = subs[1].entries.last().unwrap();
    let unlock = gem.cs_dwords(last.cs).unwrap();
    assert_eq!(pm4::pkt3_opcode(unlock[0]), pm4::PKT3_RELEASE_MEM);
    assert_eq!(subs[1].entries.len(), 3);
}

#[test]
fn test_indirect_binds_use_registered_scratch() {
    let (_gem, ws, device) = setup(GfxLevel::Gfx10_3, DeviceConfig::default());
    let queue = device.create_queue(QueueType::Graphics, 0).unwrap();
    device.register_pipeline_scratch(QueueType::Graphics, 4096, 64);

    let cb = RecordedCommandBuffer::builder(QueueType::Graphics)
        .indirect_pipeline_binds()
        .build(&ws)
        .unwrap();
    submit(&queue, &[&cb], &[], &[]).unwrap();

    let state = queue.ring_state();
    assert_eq!(state.scratch_size_per_wave, 4096);
    assert_eq!(state.scratch_waves, 64);
    assert!(queue.ring_resources().scratch.is_some());
}
