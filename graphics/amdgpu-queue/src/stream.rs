//! Finalized hardware command streams

use std::sync::Arc;

use gal::{BoHandle, CsHandle, CsInfo, QueueType, Result, StreamEntry, Winsys};
use spin::Mutex as SpinMutex;

use crate::pm4::{self, CmdBuilder};

/// Dwords kept at the tail of chainable streams for an INDIRECT_BUFFER
pub const CHAIN_RESERVE_DWORDS: usize = 4;

/// A command stream uploaded through the winsys
///
/// Chainable streams end in a four-dword NOP that can be patched into an
/// INDIRECT_BUFFER jumping to the next stream. The kernel stream is
/// destroyed on drop.
pub struct HwStream {
    ws: Arc<dyn Winsys>,
    ip: QueueType,
    info: CsInfo,
    buffers: Vec<BoHandle>,
    /// Dword offset of the chain tail
    chain_offset: Option<u32>,
    /// Stream the tail currently jumps to
    chained_to: SpinMutex<Option<CsHandle>>,
}

impl HwStream {
    /// Upload raw dwords
    pub fn create(
        ws: &Arc<dyn Winsys>,
        ip: QueueType,
        mut dwords: Vec<u32>,
        buffers: Vec<BoHandle>,
        chainable: bool,
    ) -> Result<Self> {
        let chain_offset = if chainable {
            while (dwords.len() + CHAIN_RESERVE_DWORDS) % 8 != 0 {
                dwords.push(pm4::PKT2_NOP_PAD);
            }
            let offset = dwords.len() as u32;
            dwords.extend_from_slice(&pm4::nop4());
            Some(offset)
        } else {
            if ip == QueueType::Graphics {
                while dwords.len() % 8 != 0 {
                    dwords.push(pm4::PKT2_NOP_PAD);
                }
            }
            None
        };

        let info = ws.cs_create(ip, &dwords, &buffers)?;
        Ok(Self {
            ws: ws.clone(),
            ip,
            info,
            buffers,
            chain_offset,
            chained_to: SpinMutex::new(None),
        })
    }

    /// Upload the contents of a builder
    pub fn from_builder(
        ws: &Arc<dyn Winsys>,
        builder: CmdBuilder,
        chainable: bool,
    ) -> Result<Self> {
        let (ip, dwords, buffers) = builder.finish();
        Self::create(ws, ip, dwords, buffers, chainable)
    }

    pub fn handle(&self) -> CsHandle {
        self.info.handle
    }

    pub fn ip(&self) -> QueueType {
        self.ip
    }

    pub fn va(&self) -> u64 {
        self.info.va
    }

    pub fn dwords(&self) -> u32 {
        self.info.dwords
    }

    pub fn buffers(&self) -> &[BoHandle] {
        &self.buffers
    }

    pub fn is_chainable(&self) -> bool {
        self.chain_offset.is_some()
    }

    pub fn chained_to(&self) -> Option<CsHandle> {
        *self.chained_to.lock()
    }

    /// Patch the tail so execution continues in `next`
    pub fn chain_to(&self, next: &HwStream) -> Result<()> {
        let offset = self.chain_offset.ok_or(gal::Error::InvalidParameter)?;
        if next.ip != self.ip {
            return Err(gal::Error::InvalidParameter);
        }

        let mut chained = self.chained_to.lock();
        if *chained == Some(next.handle()) {
            return Ok(());
        }
        let ib = pm4::indirect_buffer(next.va(), next.dwords(), true);
        self.ws.cs_patch(self.info.handle, offset, &ib)?;
        *chained = Some(next.handle());
        Ok(())
    }

    /// Restore the NOP tail if the stream is chained
    pub fn unchain(&self) -> Result<()> {
        let Some(offset) = self.chain_offset else {
            return Ok(());
        };

        let mut chained = self.chained_to.lock();
        if chained.is_some() {
            self.ws.cs_patch(self.info.handle, offset, &pm4::nop4())?;
            *chained = None;
        }
        Ok(())
    }

    /// Submission entry starting this stream
    pub fn entry(&self, queue_index: u32, can_patch: bool) -> StreamEntry {
        StreamEntry {
            ip: self.ip,
            queue_index,
            cs: self.info.handle,
            va: self.info.va,
            dwords: self.info.dwords,
            can_patch: can_patch && self.is_chainable(),
        }
    }
}

impl Drop for HwStream {
    fn drop(&mut self) {
        self.ws.cs_destroy(self.info.handle);
    }
}

impl std::fmt::Debug for HwStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwStream")
            .field("ip", &self.ip)
            .field("handle", &self.info.handle)
            .field("va", &format_args!("{:#x}", self.info.va))
            .field("dwords", &self.info.dwords)
            .finish()
    }
}
