use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use kestrel_mem::GraphicsAllocation;

use crate::cmd::decode::{parse_one, DecodeError, HwCommand};
use crate::cmd::{PipeControlFlags, PostSyncWrite, TAG_PARTITION_STRIDE};

/// The span of a command-buffer allocation handed to hardware. Execution
/// begins at `start_offset`; `end_offset` bounds the recorded content (the
/// hardware finds its own end marker, the bound exists for diagnostics).
#[derive(Clone, Debug)]
pub struct BatchBuffer {
    pub allocation: Arc<GraphicsAllocation>,
    pub start_offset: usize,
    pub end_offset: usize,
}

impl BatchBuffer {
    pub fn start_gpu_address(&self) -> u64 {
        self.allocation.gpu_address() + self.start_offset as u64
    }

    pub fn len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.end_offset == self.start_offset
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("device rejected the submission")]
    Rejected,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("gpu address {0:#x} does not map to a submitted allocation")]
    UnresolvedAddress(u64),
    #[error("allocation at {0:#x} has no CPU mapping")]
    NotMapped(u64),
    #[error("batch chain exceeded {0} links")]
    ChainTooDeep(usize),
    #[error("batch ran past the end of its allocation without an end marker")]
    MissingEndMarker,
}

/// Hardware-queue submission primitive.
///
/// One call means one real hardware flush; the receiver advances its flush
/// stamp by exactly one per successful call. `surfaces` is the resident set
/// the submission may touch.
pub trait Submitter {
    fn submit(
        &mut self,
        batch: &BatchBuffer,
        surfaces: &[Arc<GraphicsAllocation>],
    ) -> Result<(), SubmitError>;

    fn is_gpu_hung(&self) -> bool {
        false
    }
}

/// Longest batch-buffer-start chain a submission may carry. The drain keeps
/// its packages within this bound so every package it produces is executable.
pub const MAX_CHAIN_LINKS: usize = 64;

/// Reference submitter that executes the software command format.
///
/// Walks the batch from its start offset, follows batch-buffer-start chains
/// through the submitted surfaces, and applies pipe-control post-sync writes
/// to CPU-visible memory so tag polling completes. A pipe control carrying
/// the workload-partition-id-offset flag writes once per tile at the fixed
/// partition stride, the way partitioned hardware fans out the tag update.
pub struct SoftSubmitter {
    tile_count: u32,
    submit_count: u32,
    gpu_hung: bool,
}

impl SoftSubmitter {
    pub fn new(tile_count: u32) -> Self {
        Self {
            tile_count: tile_count.max(1),
            submit_count: 0,
            gpu_hung: false,
        }
    }

    /// Number of successful hardware flush calls so far.
    pub fn submit_count(&self) -> u32 {
        self.submit_count
    }

    pub fn set_gpu_hung(&mut self, hung: bool) {
        self.gpu_hung = hung;
    }

    fn resolve(
        batch: &BatchBuffer,
        surfaces: &[Arc<GraphicsAllocation>],
        address: u64,
    ) -> Result<Arc<GraphicsAllocation>, SubmitError> {
        surfaces
            .iter()
            .chain(std::iter::once(&batch.allocation))
            .find(|a| a.contains_gpu_address(address))
            .cloned()
            .ok_or(SubmitError::UnresolvedAddress(address))
    }

    fn apply_post_sync(
        &self,
        batch: &BatchBuffer,
        surfaces: &[Arc<GraphicsAllocation>],
        write: PostSyncWrite,
        flags: PipeControlFlags,
    ) -> Result<(), SubmitError> {
        let target = Self::resolve(batch, surfaces, write.address)?;
        let cpu = target
            .cpu()
            .ok_or(SubmitError::NotMapped(write.address))?;
        let base = (write.address - target.gpu_address()) as usize;
        let fanout = if flags.contains(PipeControlFlags::WORKLOAD_PARTITION_ID_OFFSET) {
            self.tile_count
        } else {
            1
        };
        for tile in 0..fanout {
            let offset = base + (tile as u64 * TAG_PARTITION_STRIDE) as usize;
            if offset + 8 > target.size() {
                return Err(SubmitError::UnresolvedAddress(write.address));
            }
            cpu.write_bytes(offset, &write.data.to_le_bytes());
        }
        trace!(address = write.address, data = write.data, fanout, "post-sync write");
        Ok(())
    }

    fn execute(
        &self,
        batch: &BatchBuffer,
        surfaces: &[Arc<GraphicsAllocation>],
    ) -> Result<(), SubmitError> {
        let mut current = Arc::clone(&batch.allocation);
        let mut pos = batch.start_offset;
        let mut links = 0usize;
        loop {
            let bytes = current
                .cpu()
                .ok_or(SubmitError::NotMapped(current.gpu_address()))?
                .snapshot();
            loop {
                match parse_one(&bytes, pos)? {
                    None => return Err(SubmitError::MissingEndMarker),
                    Some((HwCommand::BatchBufferEnd, _)) => return Ok(()),
                    Some((HwCommand::BatchBufferStart { address }, _)) => {
                        links += 1;
                        if links > MAX_CHAIN_LINKS {
                            return Err(SubmitError::ChainTooDeep(MAX_CHAIN_LINKS));
                        }
                        let target = Self::resolve(batch, surfaces, address)?;
                        pos = (address - target.gpu_address()) as usize;
                        current = target;
                        break;
                    }
                    Some((HwCommand::PipeControl { flags, post_sync }, next)) => {
                        if let Some(write) = post_sync {
                            self.apply_post_sync(batch, surfaces, write, flags)?;
                        }
                        pos = next;
                    }
                    Some((_, next)) => pos = next,
                }
            }
        }
    }
}

impl Submitter for SoftSubmitter {
    fn submit(
        &mut self,
        batch: &BatchBuffer,
        surfaces: &[Arc<GraphicsAllocation>],
    ) -> Result<(), SubmitError> {
        self.execute(batch, surfaces)?;
        self.submit_count += 1;
        Ok(())
    }

    fn is_gpu_hung(&self) -> bool {
        self.gpu_hung
    }
}
