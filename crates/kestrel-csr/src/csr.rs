use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use kestrel_mem::{
    align_up, AllocationProperties, AllocationType, ContextId, GraphicsAllocation, MemoryManager,
    CACHE_LINE_SIZE, PAGE_SIZE_64K,
};

use crate::aggregator::{CommandBuffer, SubmissionAggregator};
use crate::cmd::{
    CommandEncoder, PipeControlArgs, PipeControlFlags, PostSyncWrite, StateBaseAddress,
    L3_CONFIG_REGISTER, PARTITION_ADDRESS_OFFSET_REGISTER, PREAMBLE_PIPELINE_REGISTER,
    PREEMPTION_CONFIG_REGISTER, TAG_PARTITION_STRIDE, WPARID_REGISTER,
};
use crate::flush_stamp::FlushStamp;
use crate::residency::ResidencyTracker;
use crate::reuse::ReusePool;
use crate::scratch::ScratchSpaceController;
use crate::stream::LinearStream;
use crate::submit::{BatchBuffer, SubmitError, Submitter, MAX_CHAIN_LINKS};

const MIN_COMMAND_BUFFER_SIZE: usize = 64 * 1024;

/// Extra bytes kept free past the last command so command-streamer prefetch
/// never reads unmapped memory.
const COMMAND_BUFFER_OVERFETCH: usize = CACHE_LINE_SIZE as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Every flush submits to hardware before returning.
    Immediate,
    /// Flushes are recorded and coalesced by `flush_batched_submissions`.
    Batched,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreemptionMode {
    Disabled,
    MidBatch,
    ThreadGroup,
    MidThread,
}

impl PreemptionMode {
    fn register_value(self) -> u32 {
        match self {
            PreemptionMode::Disabled => 1 << 0,
            PreemptionMode::MidBatch => 1 << 1,
            PreemptionMode::ThreadGroup => 1 << 2,
            PreemptionMode::MidThread => 1 << 3,
        }
    }
}

/// Sampler-cache flush progression. A request moves the receiver to
/// `FlushBefore`; the next two flushes each emit a texture-cache invalidation
/// and step the state back to `NotRequired`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SamplerCacheFlushState {
    #[default]
    NotRequired,
    FlushBefore,
    FlushAfter,
}

/// Per-dispatch requirements handed to [`CommandStreamReceiver::flush_task`].
#[derive(Clone, Copy, Debug)]
pub struct DispatchFlags {
    pub required_scratch_slot0_size: u32,
    pub required_scratch_slot1_size: u32,
    pub preemption_mode: PreemptionMode,
    pub l3_config: u32,
    pub active_partitions: u32,
    pub blocking: bool,
    pub dc_flush_enable: bool,
    pub guard_command_buffer_with_pipe_control: bool,
    pub out_of_order_execution_allowed: bool,
    pub implicit_flush: bool,
}

impl Default for DispatchFlags {
    fn default() -> Self {
        Self {
            required_scratch_slot0_size: 0,
            required_scratch_slot1_size: 0,
            preemption_mode: PreemptionMode::ThreadGroup,
            l3_config: 0x8000_0121,
            active_partitions: 1,
            blocking: false,
            dc_flush_enable: false,
            guard_command_buffer_with_pipe_control: false,
            out_of_order_execution_allowed: false,
            implicit_flush: false,
        }
    }
}

/// Counters returned to the caller after a flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionStamp {
    pub task_count: u32,
    pub task_level: u32,
    pub flush_stamp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    NotReady,
    GpuHang,
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("out of device memory")]
    OutOfMemory,
    #[error("hardware submission failed: {0}")]
    Submission(#[from] SubmitError),
}

#[derive(Debug, Error)]
pub enum CsrError {
    #[error("out of device memory creating receiver allocations")]
    OutOfMemory,
}

/// Receiver construction parameters; owned by the device/context object
/// rather than read from process-global state.
#[derive(Clone, Debug)]
pub struct CsrConfig {
    pub context_id: ContextId,
    pub root_device_index: u32,
    pub dispatch_mode: DispatchMode,
    /// Hardware tiles behind this receiver; sizes the tag and work-partition
    /// allocations.
    pub tile_count: u32,
    /// Hardware threads the per-thread scratch sizes scale by.
    pub thread_count: u32,
    pub local_memory: bool,
    /// Program the scratch pointer relative to the general-state base.
    pub scratch_base_offset: bool,
    /// First aggregator drain issues one extra implicit flush for state
    /// initialization.
    pub heapless_state_init: bool,
    /// Skip the epilogue tag write at flush time; a wait emits a standalone
    /// tag update instead.
    pub update_tag_from_wait: bool,
    /// Force a drain whenever a never-before-seen allocation was made
    /// resident since the last submission.
    pub implicit_flush_on_new_resources: bool,
    /// Unique-surface footprint a chained submission may accumulate.
    pub aggregation_budget_bytes: usize,
    pub command_buffer_size: usize,
}

impl Default for CsrConfig {
    fn default() -> Self {
        Self {
            context_id: 0,
            root_device_index: 0,
            dispatch_mode: DispatchMode::Immediate,
            tile_count: 1,
            thread_count: 64,
            local_memory: false,
            scratch_base_offset: true,
            heapless_state_init: false,
            update_tag_from_wait: false,
            implicit_flush_on_new_resources: false,
            aggregation_budget_bytes: 16 * 1024 * 1024,
            command_buffer_size: MIN_COMMAND_BUFFER_SIZE,
        }
    }
}

/// Per-engine submission state machine.
///
/// Owns the command stream, the scratch controller, the tag and fence
/// allocations, and all dirty-state tracking. A flush emits only the state
/// commands invalidated since the previous flush, appends the workload, ties
/// completion to a new task count via the epilogue pipe control, and either
/// submits immediately or records for a batched drain. One CPU thread owns a
/// receiver; independent receivers share only the memory manager.
pub struct CommandStreamReceiver<E: CommandEncoder, S: Submitter> {
    config: CsrConfig,
    encoder: E,
    submitter: S,
    memory: Arc<dyn MemoryManager>,

    stream: LinearStream,
    scratch: ScratchSpaceController,
    residency: ResidencyTracker,
    aggregator: SubmissionAggregator,
    reuse: ReusePool,

    tag_allocation: Arc<GraphicsAllocation>,
    global_fence_allocation: Arc<GraphicsAllocation>,
    preemption_allocation: Arc<GraphicsAllocation>,
    work_partition_allocation: Option<Arc<GraphicsAllocation>>,

    task_count: u32,
    task_level: u32,
    latest_sent_task_count: u32,
    latest_flushed_task_count: u32,
    flush_stamp: FlushStamp,

    required_scratch_slot0: u32,
    required_scratch_slot1: u32,

    state_base_address_dirty: bool,
    media_vfe_state_dirty: bool,
    preamble_sent: bool,
    last_l3_config: Option<u32>,
    last_preemption_mode: Option<PreemptionMode>,
    sampler_cache_flush: SamplerCacheFlushState,
    active_partitions: u32,
    active_partitions_config: u32,
    heapless_init_flushed: bool,
}

impl<E: CommandEncoder, S: Submitter> CommandStreamReceiver<E, S> {
    pub fn new(
        config: CsrConfig,
        memory: Arc<dyn MemoryManager>,
        encoder: E,
        submitter: S,
    ) -> Result<Self, CsrError> {
        let tile_count = config.tile_count.max(1);
        let allocate = |ty, size| {
            memory
                .allocate_graphics_memory_with_properties(AllocationProperties::new(
                    config.root_device_index,
                    size,
                    ty,
                ))
                .ok_or(CsrError::OutOfMemory)
        };

        let tag_allocation = allocate(
            AllocationType::Tag,
            (tile_count as u64 * TAG_PARTITION_STRIDE) as usize,
        )?;
        let global_fence_allocation =
            allocate(AllocationType::GlobalFence, CACHE_LINE_SIZE as usize)?;
        let preemption_allocation =
            allocate(AllocationType::Preemption, PAGE_SIZE_64K as usize)?;
        let work_partition_allocation = if tile_count > 1 {
            let allocation = allocate(
                AllocationType::WorkPartition,
                (tile_count as u64 * TAG_PARTITION_STRIDE) as usize,
            )?;
            if let Some(cpu) = allocation.cpu() {
                for tile in 0..tile_count {
                    cpu.write_u32((tile as u64 * TAG_PARTITION_STRIDE) as usize, tile);
                }
            }
            Some(allocation)
        } else {
            None
        };
        let stream_backing = allocate(
            AllocationType::CommandBuffer,
            config.command_buffer_size.max(MIN_COMMAND_BUFFER_SIZE),
        )?;

        let scratch = ScratchSpaceController::new(
            Arc::clone(&memory),
            config.root_device_index,
            config.thread_count,
            config.scratch_base_offset,
        );
        let residency = ResidencyTracker::new(config.context_id);

        Ok(Self {
            scratch,
            residency,
            aggregator: SubmissionAggregator::new(),
            reuse: ReusePool::new(),
            stream: LinearStream::new(stream_backing),
            tag_allocation,
            global_fence_allocation,
            preemption_allocation,
            work_partition_allocation,
            task_count: 0,
            task_level: 0,
            latest_sent_task_count: 0,
            latest_flushed_task_count: 0,
            flush_stamp: FlushStamp::new(),
            required_scratch_slot0: 0,
            required_scratch_slot1: 0,
            state_base_address_dirty: true,
            media_vfe_state_dirty: true,
            preamble_sent: false,
            last_l3_config: None,
            last_preemption_mode: None,
            sampler_cache_flush: SamplerCacheFlushState::NotRequired,
            active_partitions: 1,
            active_partitions_config: 1,
            heapless_init_flushed: false,
            config,
            encoder,
            submitter,
            memory,
        })
    }

    pub fn peek_task_count(&self) -> u32 {
        self.task_count
    }

    pub fn peek_task_level(&self) -> u32 {
        self.task_level
    }

    pub fn peek_latest_sent_task_count(&self) -> u32 {
        self.latest_sent_task_count
    }

    pub fn peek_latest_flushed_task_count(&self) -> u32 {
        self.latest_flushed_task_count
    }

    /// Shared hardware-flush ordinal; clones observe later drains.
    pub fn flush_stamp(&self) -> FlushStamp {
        self.flush_stamp.clone()
    }

    pub fn tag_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.tag_allocation
    }

    /// Fence allocation other engines synchronize against.
    pub fn global_fence_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.global_fence_allocation
    }

    pub fn scratch_space_controller(&self) -> &ScratchSpaceController {
        &self.scratch
    }

    pub fn command_stream(&self) -> &LinearStream {
        &self.stream
    }

    pub fn aggregator(&self) -> &SubmissionAggregator {
        &self.aggregator
    }

    pub fn submitter(&self) -> &S {
        &self.submitter
    }

    pub fn submitter_mut(&mut self) -> &mut S {
        &mut self.submitter
    }

    /// Add a workload surface to the next submission's resident set.
    pub fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) {
        self.residency.make_resident(allocation, self.task_count + 1);
    }

    /// Record required per-thread scratch; only the running maxima are kept
    /// and applied on the next flush.
    pub fn set_required_scratch_sizes(&mut self, slot0: u32, slot1: u32) {
        self.required_scratch_slot0 = self.required_scratch_slot0.max(slot0);
        self.required_scratch_slot1 = self.required_scratch_slot1.max(slot1);
    }

    pub fn set_sampler_cache_flush_required(&mut self) {
        if self.sampler_cache_flush == SamplerCacheFlushState::NotRequired {
            self.sampler_cache_flush = SamplerCacheFlushState::FlushBefore;
        }
    }

    /// Reset all dirty tracking to the context-creation state, forcing the
    /// next flush to reprogram everything.
    pub fn init_programming_flags(&mut self) {
        self.state_base_address_dirty = true;
        self.media_vfe_state_dirty = true;
        self.preamble_sent = false;
        self.last_l3_config = None;
        self.last_preemption_mode = None;
        self.sampler_cache_flush = SamplerCacheFlushState::NotRequired;
        self.active_partitions_config = 1;
    }

    fn completion_stamp(&self) -> CompletionStamp {
        CompletionStamp {
            task_count: self.task_count,
            task_level: self.task_level,
            flush_stamp: self.flush_stamp.peek(),
        }
    }

    /// Minimum tag value every active tile has reached.
    fn read_hw_tag(&self) -> u32 {
        let cpu = self
            .tag_allocation
            .cpu()
            .expect("tag allocation is CPU-visible");
        (0..self.active_partitions.max(1))
            .map(|tile| cpu.read_u32((tile as u64 * TAG_PARTITION_STRIDE) as usize))
            .min()
            .unwrap_or(0)
    }

    fn required_stream_size(&self, workload_len: usize) -> usize {
        let e = &self.encoder;
        4 * e.pipe_control_size()
            + 3 * e.load_register_imm_size()
            + e.load_register_mem_size()
            + e.state_base_address_size()
            + e.binding_table_pool_alloc_size()
            + e.media_vfe_state_size()
            + e.batch_buffer_start_size()
            + e.batch_buffer_end_size()
            + workload_len
            + CACHE_LINE_SIZE as usize
    }

    /// Rotate the command-buffer backing store when the current one lacks
    /// room, preferring a parked allocation whose task count has completed.
    fn ensure_command_stream_capacity(&mut self, required: usize) -> Result<(), FlushError> {
        if self.stream.available_space() >= required {
            return Ok(());
        }
        let completed = self.read_hw_tag();
        let backing = match self.reuse.obtain_reusable(
            required,
            AllocationType::CommandBuffer,
            completed,
        ) {
            Some(reused) => reused,
            None => {
                let size = align_up(
                    (required + COMMAND_BUFFER_OVERFETCH) as u64,
                    PAGE_SIZE_64K,
                )
                .max(MIN_COMMAND_BUFFER_SIZE as u64) as usize;
                self.memory
                    .allocate_graphics_memory_with_properties(AllocationProperties::new(
                        self.config.root_device_index,
                        size,
                        AllocationType::CommandBuffer,
                    ))
                    .ok_or(FlushError::OutOfMemory)?
            }
        };
        // A reused backing may carry stale commands.
        if let Some(cpu) = backing.cpu() {
            cpu.fill_zero(0, backing.size());
        }
        let old = self.stream.replace_allocation(backing);
        trace!(
            old = old.id(),
            new = self.stream.allocation().id(),
            "rotated command-buffer backing"
        );
        self.reuse.store(old, self.task_count);
        Ok(())
    }

    fn make_owned_allocations_resident(&mut self, pending_task_count: u32) {
        let owned = [
            Some(Arc::clone(self.stream.allocation())),
            Some(Arc::clone(&self.tag_allocation)),
            Some(Arc::clone(&self.global_fence_allocation)),
            Some(Arc::clone(&self.preemption_allocation)),
            self.work_partition_allocation.clone(),
            self.scratch.slot0_allocation().cloned(),
            self.scratch.slot1_allocation().cloned(),
        ];
        for allocation in owned.into_iter().flatten() {
            self.residency.make_resident(&allocation, pending_task_count);
        }
    }

    /// Emit the minimal state preamble plus workload plus tag epilogue for
    /// one dispatch, then submit or record depending on dispatch mode.
    ///
    /// `workload` is appended verbatim between the state commands and the
    /// epilogue. A flush with nothing to do (no workload, no dirty state, no
    /// guarding flags) returns the current counters untouched; every other
    /// successful flush raises the task count by exactly one.
    pub fn flush_task(
        &mut self,
        workload: &[u8],
        task_level: u32,
        flags: &DispatchFlags,
    ) -> Result<CompletionStamp, FlushError> {
        self.task_level = self.task_level.max(task_level);

        // Commit the running maxima only once the backing exists, so an OOM
        // leaves the controller and the maxima untouched.
        let slot0 = self
            .required_scratch_slot0
            .max(flags.required_scratch_slot0_size);
        let slot1 = self
            .required_scratch_slot1
            .max(flags.required_scratch_slot1_size);
        let grown = self
            .scratch
            .set_required_scratch_space(slot0, slot1, self.task_count, &mut self.reuse)
            .map_err(|_| FlushError::OutOfMemory)?;
        self.required_scratch_slot0 = slot0;
        self.required_scratch_slot1 = slot1;
        self.state_base_address_dirty |= grown.state_base_address;
        self.media_vfe_state_dirty |= grown.vfe_state;

        let l3_dirty = self.last_l3_config != Some(flags.l3_config);
        let preemption_dirty = self.last_preemption_mode != Some(flags.preemption_mode);
        let requested_partitions = flags.active_partitions.max(1);
        let partition_dirty =
            requested_partitions > 1 && requested_partitions != self.active_partitions_config;
        let sampler_flush = self.sampler_cache_flush != SamplerCacheFlushState::NotRequired;
        let guarded = flags.blocking
            || flags.dc_flush_enable
            || flags.guard_command_buffer_with_pipe_control;

        let any_dirty = self.state_base_address_dirty
            || self.media_vfe_state_dirty
            || !self.preamble_sent
            || l3_dirty
            || preemption_dirty
            || partition_dirty
            || sampler_flush;

        if workload.is_empty() && !any_dirty && !guarded && !flags.implicit_flush {
            debug!(task_count = self.task_count, "flush_task: nothing to submit");
            return Ok(self.completion_stamp());
        }

        self.ensure_command_stream_capacity(self.required_stream_size(workload.len()))?;

        let next_task_count = self.task_count + 1;
        let chunk_start = self.stream.used();
        self.make_owned_allocations_resident(next_task_count);

        match self.sampler_cache_flush {
            SamplerCacheFlushState::NotRequired => {}
            SamplerCacheFlushState::FlushBefore => {
                self.emit_sampler_cache_flush();
                self.sampler_cache_flush = SamplerCacheFlushState::FlushAfter;
            }
            SamplerCacheFlushState::FlushAfter => {
                self.emit_sampler_cache_flush();
                self.sampler_cache_flush = SamplerCacheFlushState::NotRequired;
            }
        }

        // In-flight work may still read the heaps about to be rebased.
        if self.state_base_address_dirty {
            self.encoder.pipe_control(
                &mut self.stream,
                &PipeControlArgs {
                    flags: PipeControlFlags::CS_STALL
                        | PipeControlFlags::DC_FLUSH
                        | PipeControlFlags::TEXTURE_CACHE_INVALIDATE
                        | PipeControlFlags::CONSTANT_CACHE_INVALIDATE
                        | PipeControlFlags::STATE_CACHE_INVALIDATE
                        | PipeControlFlags::INSTRUCTION_CACHE_INVALIDATE,
                    post_sync: None,
                },
            );
        }

        if !self.preamble_sent {
            self.encoder
                .load_register_imm(&mut self.stream, PREAMBLE_PIPELINE_REGISTER, 1);
            self.preamble_sent = true;
        }
        if l3_dirty {
            self.encoder
                .load_register_imm(&mut self.stream, L3_CONFIG_REGISTER, flags.l3_config);
            self.last_l3_config = Some(flags.l3_config);
        }
        if preemption_dirty {
            self.encoder.load_register_imm(
                &mut self.stream,
                PREEMPTION_CONFIG_REGISTER,
                flags.preemption_mode.register_value(),
            );
            self.last_preemption_mode = Some(flags.preemption_mode);
        }

        if self.state_base_address_dirty {
            let heap_base = self
                .memory
                .internal_heap_base_address(self.config.root_device_index, self.config.local_memory);
            let general_state_base = if self.scratch.slot0_allocation().is_some() {
                self.scratch.general_state_base()
            } else {
                heap_base
            };
            self.encoder.state_base_address(
                &mut self.stream,
                &StateBaseAddress {
                    general_state_base,
                    surface_state_base: heap_base,
                    dynamic_state_base: heap_base,
                    instruction_base: heap_base,
                },
            );
            // The surface-state pool register is only ever reprogrammed
            // together with state-base-address.
            self.encoder.binding_table_pool_alloc(
                &mut self.stream,
                heap_base,
                PAGE_SIZE_64K as u32,
            );
            self.state_base_address_dirty = false;
        }

        if self.media_vfe_state_dirty {
            self.encoder.media_vfe_state(
                &mut self.stream,
                self.scratch.scratch_patch_address(),
                self.scratch.per_thread_slot0_size(),
                self.scratch.per_thread_slot1_size(),
                self.config.thread_count,
            );
            self.media_vfe_state_dirty = false;
        }

        if partition_dirty {
            if let Some(work_partition) = &self.work_partition_allocation {
                self.encoder.load_register_mem(
                    &mut self.stream,
                    WPARID_REGISTER,
                    work_partition.gpu_address(),
                );
            }
            self.encoder.load_register_imm(
                &mut self.stream,
                PARTITION_ADDRESS_OFFSET_REGISTER,
                TAG_PARTITION_STRIDE as u32,
            );
        }
        self.active_partitions_config = requested_partitions;
        self.active_partitions = requested_partitions;

        if !workload.is_empty() {
            self.stream.write(workload);
        }

        let batched = self.config.dispatch_mode == DispatchMode::Batched;
        let mut erasable_pipe_control = None;
        if batched
            && !flags.dc_flush_enable
            && (flags.out_of_order_execution_allowed
                || flags.guard_command_buffer_with_pipe_control)
        {
            let location = self.stream.cursor_location();
            self.encoder
                .pipe_control(&mut self.stream, &PipeControlArgs::with_dc_flush(false));
            erasable_pipe_control = Some(location);
        } else if !batched && flags.guard_command_buffer_with_pipe_control {
            self.encoder
                .pipe_control(&mut self.stream, &PipeControlArgs::with_dc_flush(false));
        }

        let mut epilogue_flags = PipeControlFlags::CS_STALL;
        if flags.dc_flush_enable {
            epilogue_flags |= PipeControlFlags::DC_FLUSH;
        }
        if flags.blocking {
            epilogue_flags |= PipeControlFlags::NOTIFY;
        }
        if self.active_partitions > 1 {
            epilogue_flags |= PipeControlFlags::WORKLOAD_PARTITION_ID_OFFSET;
        }
        let post_sync = (!self.config.update_tag_from_wait).then(|| PostSyncWrite {
            address: self.tag_allocation.gpu_address(),
            data: next_task_count as u64,
        });
        let epilogue_location = self.stream.cursor_location();
        self.encoder.pipe_control(
            &mut self.stream,
            &PipeControlArgs {
                flags: epilogue_flags,
                post_sync,
            },
        );

        let end_marker = self.stream.cursor_location();
        self.encoder.batch_buffer_end(&mut self.stream);
        if batched {
            // Reserve room for the end marker to be patched into a
            // batch-buffer start when a successor is chained.
            self.stream.write_noop(
                self.encoder.batch_buffer_start_size() - self.encoder.batch_buffer_end_size(),
            );
        }
        let chunk_end = self.stream.used();
        self.stream.align_to_cache_line();

        let batch = BatchBuffer {
            allocation: Arc::clone(self.stream.allocation()),
            start_offset: chunk_start,
            end_offset: chunk_end,
        };
        self.latest_sent_task_count = next_task_count;

        if !batched {
            let pack = self.residency.take_pending();
            self.residency.take_new_resources();
            match self.submitter.submit(&batch, &pack) {
                Ok(()) => {
                    self.flush_stamp.advance();
                    self.task_count = next_task_count;
                    self.latest_flushed_task_count = next_task_count;
                    self.residency.make_pack_non_resident(&pack);
                    if guarded {
                        self.task_level += 1;
                    }
                    debug!(
                        task_count = self.task_count,
                        task_level = self.task_level,
                        flush_stamp = self.flush_stamp.peek(),
                        "flush_task: submitted"
                    );
                    Ok(self.completion_stamp())
                }
                Err(err) => {
                    self.latest_sent_task_count = self.task_count;
                    self.residency.restore_pending(pack);
                    Err(FlushError::Submission(err))
                }
            }
        } else {
            self.task_count = next_task_count;
            let new_resources = self.residency.take_new_resources();
            let surfaces = self.residency.take_pending();
            self.aggregator.record(CommandBuffer {
                batch,
                surfaces,
                task_count: next_task_count,
                flush_stamp: self.flush_stamp.clone(),
                erasable_pipe_control,
                epilogue_pipe_control: Some(epilogue_location),
                end_marker,
            });
            debug!(
                task_count = self.task_count,
                recorded = self.aggregator.len(),
                "flush_task: recorded for batched submission"
            );

            let over_budget = self.aggregator.recorded_surface_bytes()
                >= self.config.aggregation_budget_bytes;
            if flags.blocking
                || flags.implicit_flush
                || over_budget
                || (new_resources && self.config.implicit_flush_on_new_resources)
            {
                self.flush_batched_submissions()?;
            }
            Ok(self.completion_stamp())
        }
    }

    fn emit_sampler_cache_flush(&mut self) {
        self.encoder.pipe_control(
            &mut self.stream,
            &PipeControlArgs {
                flags: PipeControlFlags::CS_STALL | PipeControlFlags::TEXTURE_CACHE_INVALIDATE,
                post_sync: None,
            },
        );
    }

    /// Chain everything recorded since the last drain into as few hardware
    /// submissions as the memory budget allows.
    ///
    /// Each buffer's end marker is patched into a batch-buffer start aimed
    /// at its successor; the final buffer keeps its true end marker. A
    /// superseded ordering pipe control is nooped; the tag epilogue of each
    /// buffer is preserved, with the final one upgraded to a dc-flushing
    /// write.
    pub fn flush_batched_submissions(&mut self) -> Result<(), FlushError> {
        if self.aggregator.is_empty() {
            return Ok(());
        }
        if self.config.heapless_state_init && !self.heapless_init_flushed {
            self.flush_heapless_init()?;
            self.heapless_init_flushed = true;
        }

        while let Some(mut package) = self
            .aggregator
            .pop_package(self.config.aggregation_budget_bytes, MAX_CHAIN_LINKS)
        {
            for i in 0..package.len().saturating_sub(1) {
                let next_start = package[i + 1].batch.start_gpu_address();
                let current = &mut package[i];
                self.encoder
                    .patch_batch_buffer_start(&current.end_marker, next_start);
                if let Some(location) = current.erasable_pipe_control.take() {
                    self.encoder.noop_pipe_control(&location);
                }
            }
            if let Some(last) = package.last() {
                if let Some(location) = &last.epilogue_pipe_control {
                    self.encoder.patch_pipe_control_dc_flush(location, true);
                }
            }

            let mut seen = std::collections::BTreeSet::new();
            let mut combined: Vec<Arc<GraphicsAllocation>> = Vec::new();
            for buffer in &package {
                for surface in &buffer.surfaces {
                    if seen.insert(surface.id()) {
                        combined.push(Arc::clone(surface));
                    }
                }
            }

            let batch = package[0].batch.clone();
            match self.submitter.submit(&batch, &combined) {
                Ok(()) => {
                    let stamp = self.flush_stamp.advance();
                    for buffer in &package {
                        buffer.flush_stamp.set(stamp);
                    }
                    self.task_level += 1;
                    if let Some(last) = package.last() {
                        self.latest_flushed_task_count = last.task_count;
                    }
                    self.residency.make_pack_non_resident(&combined);
                    debug!(
                        chained = package.len(),
                        flush_stamp = stamp,
                        latest_flushed = self.latest_flushed_task_count,
                        "drained batched submissions"
                    );
                }
                Err(err) => {
                    self.aggregator.reinsert_front(package);
                    return Err(FlushError::Submission(err));
                }
            }
        }
        Ok(())
    }

    /// One-off state-initialization submission issued before the first
    /// batched drain in heapless mode.
    fn flush_heapless_init(&mut self) -> Result<(), FlushError> {
        let required = self.encoder.batch_buffer_end_size() + CACHE_LINE_SIZE as usize;
        self.ensure_command_stream_capacity(required)?;
        let start = self.stream.used();
        self.encoder.batch_buffer_end(&mut self.stream);
        let end = self.stream.used();
        self.stream.align_to_cache_line();

        let batch = BatchBuffer {
            allocation: Arc::clone(self.stream.allocation()),
            start_offset: start,
            end_offset: end,
        };
        let surfaces = vec![Arc::clone(self.stream.allocation())];
        self.submitter.submit(&batch, &surfaces)?;
        self.flush_stamp.advance();
        debug!("heapless state-init flush issued");
        Ok(())
    }

    /// Submit a standalone tag-update pipe control carrying the current task
    /// count, so CPU waiters make progress without a workload submission.
    pub fn flush_tag_update(&mut self) -> Result<(), FlushError> {
        let required = self.encoder.pipe_control_size()
            + self.encoder.batch_buffer_end_size()
            + CACHE_LINE_SIZE as usize;
        self.ensure_command_stream_capacity(required)?;

        let mut flags = PipeControlFlags::CS_STALL | PipeControlFlags::DC_FLUSH;
        if self.active_partitions > 1 {
            flags |= PipeControlFlags::WORKLOAD_PARTITION_ID_OFFSET;
        }
        let start = self.stream.used();
        self.encoder.pipe_control(
            &mut self.stream,
            &PipeControlArgs {
                flags,
                post_sync: Some(PostSyncWrite {
                    address: self.tag_allocation.gpu_address(),
                    data: self.task_count as u64,
                }),
            },
        );
        self.encoder.batch_buffer_end(&mut self.stream);
        let end = self.stream.used();
        self.stream.align_to_cache_line();

        let batch = BatchBuffer {
            allocation: Arc::clone(self.stream.allocation()),
            start_offset: start,
            end_offset: end,
        };
        let surfaces = vec![
            Arc::clone(self.stream.allocation()),
            Arc::clone(&self.tag_allocation),
        ];
        self.submitter.submit(&batch, &surfaces)?;
        self.flush_stamp.advance();
        self.latest_flushed_task_count = self.latest_flushed_task_count.max(self.task_count);
        debug!(task_count = self.task_count, "standalone tag update flushed");
        Ok(())
    }

    /// Poll the hardware tag until every active tile reaches `target`.
    ///
    /// A zero timeout performs a single check. A timed-out wait leaves all
    /// counters untouched, so the same target can be retried. Pending batched
    /// work is drained first; with the update-tag-from-wait policy a lagging
    /// tag triggers a standalone tag-update submission.
    pub fn wait_for_completion_with_timeout(
        &mut self,
        enable_timeout: bool,
        timeout_us: u64,
        target_task_count: u32,
    ) -> WaitStatus {
        debug_assert!(
            target_task_count <= self.task_count,
            "waiting for a task count that was never issued"
        );

        if !self.aggregator.is_empty()
            && target_task_count > self.latest_flushed_task_count
            && self.flush_batched_submissions().is_err()
        {
            return WaitStatus::NotReady;
        }
        if self.config.update_tag_from_wait
            && self.read_hw_tag() < target_task_count
            && self.flush_tag_update().is_err()
        {
            return WaitStatus::NotReady;
        }

        let deadline = enable_timeout.then(|| Instant::now() + Duration::from_micros(timeout_us));
        loop {
            if self.submitter.is_gpu_hung() {
                return WaitStatus::GpuHang;
            }
            if self.read_hw_tag() >= target_task_count {
                let completed = self.read_hw_tag();
                self.reuse.clean(completed, self.memory.as_ref());
                return WaitStatus::Ready;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return WaitStatus::NotReady;
                }
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::SoftEncoder;
    use crate::submit::SoftSubmitter;
    use kestrel_mem::SystemMemoryManager;

    fn receiver(
        config: CsrConfig,
    ) -> CommandStreamReceiver<SoftEncoder, SoftSubmitter> {
        let tile_count = config.tile_count;
        let memory: Arc<dyn MemoryManager> = Arc::new(SystemMemoryManager::new());
        CommandStreamReceiver::new(
            config,
            memory,
            SoftEncoder::new(),
            SoftSubmitter::new(tile_count),
        )
        .unwrap()
    }

    #[test]
    fn constructor_failure_is_out_of_memory() {
        struct Oom;
        impl MemoryManager for Oom {
            fn allocate_graphics_memory_with_properties(
                &self,
                _properties: AllocationProperties,
            ) -> Option<Arc<GraphicsAllocation>> {
                None
            }
            fn free_graphics_memory(&self, _allocation: Arc<GraphicsAllocation>) {}
            fn internal_heap_base_address(&self, _r: u32, _l: bool) -> u64 {
                0
            }
        }
        assert!(matches!(
            CommandStreamReceiver::new(
                CsrConfig::default(),
                Arc::new(Oom),
                SoftEncoder::new(),
                SoftSubmitter::new(1),
            ),
            Err(CsrError::OutOfMemory)
        ));
    }

    #[test]
    fn scratch_size_requests_keep_running_maxima() {
        let mut csr = receiver(CsrConfig::default());
        csr.set_required_scratch_sizes(1024, 0);
        csr.set_required_scratch_sizes(512, 2048);
        assert_eq!(csr.required_scratch_slot0, 1024);
        assert_eq!(csr.required_scratch_slot1, 2048);
    }

    #[test]
    fn init_programming_flags_forces_reprogram() {
        let mut csr = receiver(CsrConfig::default());
        csr.flush_task(&[], 0, &DispatchFlags::default()).unwrap();
        assert!(!csr.state_base_address_dirty);
        csr.init_programming_flags();
        assert!(csr.state_base_address_dirty);
        assert!(csr.media_vfe_state_dirty);
        assert!(!csr.preamble_sent);
    }

    #[test]
    fn multi_tile_receiver_seeds_work_partition_ids() {
        let config = CsrConfig {
            tile_count: 4,
            ..CsrConfig::default()
        };
        let csr = receiver(config);
        let wp = csr.work_partition_allocation.as_ref().unwrap();
        let cpu = wp.cpu().unwrap();
        for tile in 0..4u32 {
            assert_eq!(cpu.read_u32((tile as u64 * TAG_PARTITION_STRIDE) as usize), tile);
        }
    }
}
