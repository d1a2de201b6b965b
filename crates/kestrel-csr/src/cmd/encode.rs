use super::{PipeControlArgs, PipeControlFlags, StateBaseAddress};
use crate::stream::{LinearStream, StreamLocation};

pub(crate) const OP_PIPE_CONTROL: u32 = 1;
pub(crate) const OP_STATE_BASE_ADDRESS: u32 = 2;
pub(crate) const OP_MEDIA_VFE_STATE: u32 = 3;
pub(crate) const OP_BATCH_BUFFER_START: u32 = 4;
pub(crate) const OP_BATCH_BUFFER_END: u32 = 5;
pub(crate) const OP_LOAD_REGISTER_IMM: u32 = 6;
pub(crate) const OP_LOAD_REGISTER_MEM: u32 = 7;
pub(crate) const OP_BINDING_TABLE_POOL_ALLOC: u32 = 8;

pub(crate) const PIPE_CONTROL_SIZE: usize = 32;
pub(crate) const STATE_BASE_ADDRESS_SIZE: usize = 40;
pub(crate) const MEDIA_VFE_STATE_SIZE: usize = 28;
pub(crate) const BATCH_BUFFER_START_SIZE: usize = 16;
pub(crate) const BATCH_BUFFER_END_SIZE: usize = 8;
pub(crate) const LOAD_REGISTER_IMM_SIZE: usize = 16;
pub(crate) const LOAD_REGISTER_MEM_SIZE: usize = 20;
pub(crate) const BINDING_TABLE_POOL_ALLOC_SIZE: usize = 24;

/// Byte offset of the flags word inside a pipe-control record.
pub(crate) const PIPE_CONTROL_FLAGS_OFFSET: usize = 8;

/// Opaque hardware-command emitter.
///
/// The receiver treats every method as "append N bytes at the cursor"; size
/// queries let it reserve worst-case stream space before emitting. Patch
/// methods rewrite a previously emitted command in place, so layout knowledge
/// stays behind this trait.
pub trait CommandEncoder {
    fn pipe_control(&self, stream: &mut LinearStream, args: &PipeControlArgs) -> usize;
    fn state_base_address(&self, stream: &mut LinearStream, sba: &StateBaseAddress) -> usize;
    fn binding_table_pool_alloc(&self, stream: &mut LinearStream, base: u64, size: u32) -> usize;
    fn media_vfe_state(
        &self,
        stream: &mut LinearStream,
        scratch_base: u64,
        slot0_size: u32,
        slot1_size: u32,
        max_threads: u32,
    ) -> usize;
    fn batch_buffer_start(&self, stream: &mut LinearStream, address: u64) -> usize;
    fn batch_buffer_end(&self, stream: &mut LinearStream) -> usize;
    fn load_register_imm(&self, stream: &mut LinearStream, register: u32, value: u32) -> usize;
    fn load_register_mem(&self, stream: &mut LinearStream, register: u32, address: u64) -> usize;

    fn pipe_control_size(&self) -> usize;
    fn state_base_address_size(&self) -> usize;
    fn binding_table_pool_alloc_size(&self) -> usize;
    fn media_vfe_state_size(&self) -> usize;
    fn batch_buffer_start_size(&self) -> usize;
    fn batch_buffer_end_size(&self) -> usize;
    fn load_register_imm_size(&self) -> usize;
    fn load_register_mem_size(&self) -> usize;

    /// Overwrite the command at `location` with a batch-buffer start to
    /// `address`. The target region must be at least
    /// [`batch_buffer_start_size`](Self::batch_buffer_start_size) bytes.
    fn patch_batch_buffer_start(&self, location: &StreamLocation, address: u64);

    /// Erase the pipe control at `location` (zero fill; decodes as noops).
    fn noop_pipe_control(&self, location: &StreamLocation);

    /// Toggle the dc-flush bit of the pipe control at `location`.
    fn patch_pipe_control_dc_flush(&self, location: &StreamLocation, enable: bool);
}

/// Software command format: `u32` opcode, `u32` total record size, payload,
/// all little-endian and 4-byte aligned. A zero word decodes as a 4-byte
/// noop, so zero-filled (nooped) regions stay parseable.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftEncoder;

impl SoftEncoder {
    pub fn new() -> Self {
        Self
    }

    fn header(op: u32, size: usize, out: &mut Vec<u8>) {
        out.extend_from_slice(&op.to_le_bytes());
        out.extend_from_slice(&(size as u32).to_le_bytes());
    }
}

impl CommandEncoder for SoftEncoder {
    fn pipe_control(&self, stream: &mut LinearStream, args: &PipeControlArgs) -> usize {
        let mut rec = Vec::with_capacity(PIPE_CONTROL_SIZE);
        Self::header(OP_PIPE_CONTROL, PIPE_CONTROL_SIZE, &mut rec);
        rec.extend_from_slice(&args.flags.bits().to_le_bytes());
        let (post_sync, address, data) = match args.post_sync {
            Some(ps) => (1u32, ps.address, ps.data),
            None => (0u32, 0, 0),
        };
        rec.extend_from_slice(&post_sync.to_le_bytes());
        rec.extend_from_slice(&address.to_le_bytes());
        rec.extend_from_slice(&data.to_le_bytes());
        stream.write(&rec)
    }

    fn state_base_address(&self, stream: &mut LinearStream, sba: &StateBaseAddress) -> usize {
        let mut rec = Vec::with_capacity(STATE_BASE_ADDRESS_SIZE);
        Self::header(OP_STATE_BASE_ADDRESS, STATE_BASE_ADDRESS_SIZE, &mut rec);
        rec.extend_from_slice(&sba.general_state_base.to_le_bytes());
        rec.extend_from_slice(&sba.surface_state_base.to_le_bytes());
        rec.extend_from_slice(&sba.dynamic_state_base.to_le_bytes());
        rec.extend_from_slice(&sba.instruction_base.to_le_bytes());
        stream.write(&rec)
    }

    fn binding_table_pool_alloc(&self, stream: &mut LinearStream, base: u64, size: u32) -> usize {
        let mut rec = Vec::with_capacity(BINDING_TABLE_POOL_ALLOC_SIZE);
        Self::header(
            OP_BINDING_TABLE_POOL_ALLOC,
            BINDING_TABLE_POOL_ALLOC_SIZE,
            &mut rec,
        );
        rec.extend_from_slice(&base.to_le_bytes());
        rec.extend_from_slice(&size.to_le_bytes());
        rec.extend_from_slice(&0u32.to_le_bytes());
        stream.write(&rec)
    }

    fn media_vfe_state(
        &self,
        stream: &mut LinearStream,
        scratch_base: u64,
        slot0_size: u32,
        slot1_size: u32,
        max_threads: u32,
    ) -> usize {
        let mut rec = Vec::with_capacity(MEDIA_VFE_STATE_SIZE);
        Self::header(OP_MEDIA_VFE_STATE, MEDIA_VFE_STATE_SIZE, &mut rec);
        rec.extend_from_slice(&scratch_base.to_le_bytes());
        rec.extend_from_slice(&slot0_size.to_le_bytes());
        rec.extend_from_slice(&slot1_size.to_le_bytes());
        rec.extend_from_slice(&max_threads.to_le_bytes());
        stream.write(&rec)
    }

    fn batch_buffer_start(&self, stream: &mut LinearStream, address: u64) -> usize {
        let mut rec = Vec::with_capacity(BATCH_BUFFER_START_SIZE);
        Self::header(OP_BATCH_BUFFER_START, BATCH_BUFFER_START_SIZE, &mut rec);
        rec.extend_from_slice(&address.to_le_bytes());
        stream.write(&rec)
    }

    fn batch_buffer_end(&self, stream: &mut LinearStream) -> usize {
        let mut rec = Vec::with_capacity(BATCH_BUFFER_END_SIZE);
        Self::header(OP_BATCH_BUFFER_END, BATCH_BUFFER_END_SIZE, &mut rec);
        stream.write(&rec)
    }

    fn load_register_imm(&self, stream: &mut LinearStream, register: u32, value: u32) -> usize {
        let mut rec = Vec::with_capacity(LOAD_REGISTER_IMM_SIZE);
        Self::header(OP_LOAD_REGISTER_IMM, LOAD_REGISTER_IMM_SIZE, &mut rec);
        rec.extend_from_slice(&register.to_le_bytes());
        rec.extend_from_slice(&value.to_le_bytes());
        stream.write(&rec)
    }

    fn load_register_mem(&self, stream: &mut LinearStream, register: u32, address: u64) -> usize {
        let mut rec = Vec::with_capacity(LOAD_REGISTER_MEM_SIZE);
        Self::header(OP_LOAD_REGISTER_MEM, LOAD_REGISTER_MEM_SIZE, &mut rec);
        rec.extend_from_slice(&register.to_le_bytes());
        rec.extend_from_slice(&address.to_le_bytes());
        stream.write(&rec)
    }

    fn pipe_control_size(&self) -> usize {
        PIPE_CONTROL_SIZE
    }

    fn state_base_address_size(&self) -> usize {
        STATE_BASE_ADDRESS_SIZE
    }

    fn binding_table_pool_alloc_size(&self) -> usize {
        BINDING_TABLE_POOL_ALLOC_SIZE
    }

    fn media_vfe_state_size(&self) -> usize {
        MEDIA_VFE_STATE_SIZE
    }

    fn batch_buffer_start_size(&self) -> usize {
        BATCH_BUFFER_START_SIZE
    }

    fn batch_buffer_end_size(&self) -> usize {
        BATCH_BUFFER_END_SIZE
    }

    fn load_register_imm_size(&self) -> usize {
        LOAD_REGISTER_IMM_SIZE
    }

    fn load_register_mem_size(&self) -> usize {
        LOAD_REGISTER_MEM_SIZE
    }

    fn patch_batch_buffer_start(&self, location: &StreamLocation, address: u64) {
        let mut rec = Vec::with_capacity(BATCH_BUFFER_START_SIZE);
        Self::header(OP_BATCH_BUFFER_START, BATCH_BUFFER_START_SIZE, &mut rec);
        rec.extend_from_slice(&address.to_le_bytes());
        location.write_bytes(&rec);
    }

    fn noop_pipe_control(&self, location: &StreamLocation) {
        location.fill_zero(PIPE_CONTROL_SIZE);
    }

    fn patch_pipe_control_dc_flush(&self, location: &StreamLocation, enable: bool) {
        let mut flags =
            PipeControlFlags::from_bits_retain(location.read_u32_at(PIPE_CONTROL_FLAGS_OFFSET));
        flags.set(PipeControlFlags::DC_FLUSH, enable);
        location.write_u32_at(PIPE_CONTROL_FLAGS_OFFSET, flags.bits());
    }
}
