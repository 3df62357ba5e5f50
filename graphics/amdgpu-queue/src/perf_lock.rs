//! Performance-counter pass lock
//!
//! Counter passes from different submissions must not interleave. The lock
//! is a dword in GPU memory taken by a compare-and-swap loop executed by
//! the command processor and released by an end-of-pipe write.

use std::collections::HashMap;
use std::sync::Arc;

use gal::{BoDescriptor, BoFlags, MemoryDomain, QueueType, Result, Winsys};
use parking_lot::Mutex;

use crate::info::GpuInfo;
use crate::pm4::CmdBuilder;
use crate::resources::GpuBuffer;
use crate::stream::HwStream;

const LOCK_OFFSET: u64 = 0;
const PASS_OFFSET: u64 = 4;

/// Lock and unlock streams of one pass
pub struct PassStreams {
    pub lock: HwStream,
    pub unlock: HwStream,
}

/// Field order is drop order: the streams reference the lock buffer.
pub struct PerfCounterLock {
    passes: Mutex<HashMap<(QueueType, u32), Arc<PassStreams>>>,
    bo: Arc<GpuBuffer>,
}

impl PerfCounterLock {
    pub fn create(ws: &Arc<dyn Winsys>) -> Result<Self> {
        let desc = BoDescriptor::new(8, MemoryDomain::Gtt)
            .alignment(8)
            .flags(BoFlags::CPU_ACCESS | BoFlags::ZERO_VRAM | BoFlags::NO_INTERPROCESS_SHARING);
        let bo = GpuBuffer::create(ws, &desc)?;
        bo.write(0, &[0, 0])?;
        Ok(Self {
            passes: Mutex::new(HashMap::new()),
            bo,
        })
    }

    /// Streams for `pass` on `ip`, built on first use
    pub fn streams(
        &self,
        ws: &Arc<dyn Winsys>,
        info: &GpuInfo,
        ip: QueueType,
        pass: u32,
    ) -> Result<Arc<PassStreams>> {
        let mut passes = self.passes.lock();
        if let Some(streams) = passes.get(&(ip, pass)) {
            return Ok(streams.clone());
        }

        let lock_va = self.bo.va() + LOCK_OFFSET;

        let mut lock = CmdBuilder::new(ip, info.gfx_level);
        lock.add_buffer(self.bo.handle());
        lock.atomic_cmpswap_loop(lock_va, 0, 1);
        lock.write_data(self.bo.va() + PASS_OFFSET, &[pass]);

        let mut unlock = CmdBuilder::new(ip, info.gfx_level);
        unlock.add_buffer(self.bo.handle());
        unlock.release_mem_eop(lock_va, 0);

        let streams = Arc::new(PassStreams {
            lock: HwStream::from_builder(ws, lock, false)?,
            unlock: HwStream::from_builder(ws, unlock, false)?,
        });
        log::debug!("Built perf-counter lock streams for pass {} on {:?}", pass, ip);
        passes.insert((ip, pass), streams.clone());
        Ok(streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gem::GemWinsys;
    use crate::info::GfxLevel;
    use crate::pm4;

    #[test]
    fn test_lock_streams_cached_per_pass() {
        let gem = Arc::new(GemWinsys::new());
        let ws: Arc<dyn Winsys> = gem.clone();
        let info = GpuInfo::new(GfxLevel::Gfx10_3);
        let perf = PerfCounterLock::create(&ws).unwrap();

        let a = perf.streams(&ws, &info, QueueType::Graphics, 0).unwrap();
        let b = perf.streams(&ws, &info, QueueType::Graphics, 0).unwrap();
        let c = perf.streams(&ws, &info, QueueType::Graphics, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let lock = gem.cs_dwords(c.lock.handle()).unwrap();
        assert_eq!(pm4::pkt3_opcode(lock[0]), pm4::PKT3_ATOMIC_MEM);
        // cmp 0, swap in 1
        assert_eq!(lock[4], 1);
        assert_eq!(lock[6], 0);
        let write = pm4::pkt3(pm4::PKT3_WRITE_DATA, 3, false);
        let at = lock.iter().position(|&d| d == write).unwrap();
        assert_eq!(lock[at + 4], 1);

        assert_eq!(gem.cs_buffers(c.lock.handle()).unwrap(), vec![perf.bo.handle()]);
        assert_eq!(gem.cs_ip(c.lock.handle()), Some(QueueType::Graphics));

        let unlock = gem.cs_dwords(c.unlock.handle()).unwrap();
        assert_eq!(pm4::pkt3_opcode(unlock[0]), pm4::PKT3_RELEASE_MEM);

        drop((a, b, c));
        drop(perf);
        assert!(gem.premature_frees().is_empty());
        assert_eq!(gem.live_buffers(), 0);
    }
}
