//! Parser for the software command format, in the style of the protocol
//! parsers used elsewhere: it turns a raw byte range back into typed
//! commands for the software submitter and for test assertions.

use super::encode::{
    OP_BATCH_BUFFER_END, OP_BATCH_BUFFER_START, OP_BINDING_TABLE_POOL_ALLOC, OP_LOAD_REGISTER_IMM,
    OP_LOAD_REGISTER_MEM, OP_MEDIA_VFE_STATE, OP_PIPE_CONTROL, OP_STATE_BASE_ADDRESS,
};
use super::{PipeControlFlags, PostSyncWrite, StateBaseAddress};

/// One decoded command record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwCommand {
    Nop,
    PipeControl {
        flags: PipeControlFlags,
        post_sync: Option<PostSyncWrite>,
    },
    StateBaseAddress(StateBaseAddress),
    MediaVfeState {
        scratch_base: u64,
        slot0_size: u32,
        slot1_size: u32,
        max_threads: u32,
    },
    BatchBufferStart {
        address: u64,
    },
    BatchBufferEnd,
    LoadRegisterImm {
        register: u32,
        value: u32,
    },
    LoadRegisterMem {
        register: u32,
        address: u64,
    },
    BindingTablePoolAlloc {
        base: u64,
        size: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOpcode { opcode: u32, offset: usize },
    TruncatedRecord { opcode: u32, offset: usize },
    BadRecordSize { opcode: u32, size: u32, offset: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnknownOpcode { opcode, offset } => {
                write!(f, "unknown opcode {opcode:#x} at byte {offset}")
            }
            DecodeError::TruncatedRecord { opcode, offset } => {
                write!(f, "truncated record (opcode {opcode:#x}) at byte {offset}")
            }
            DecodeError::BadRecordSize {
                opcode,
                size,
                offset,
            } => write!(
                f,
                "bad record size {size} for opcode {opcode:#x} at byte {offset}"
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u32(&mut self) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[self.pos..self.pos + 4]);
        self.pos += 4;
        u32::from_le_bytes(word)
    }

    fn u64(&mut self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.bytes[self.pos..self.pos + 8]);
        self.pos += 8;
        u64::from_le_bytes(word)
    }
}

/// Decode every command in `bytes`. Zero words decode as [`HwCommand::Nop`],
/// so erased (zero-filled) regions and cache-line padding parse cleanly.
pub fn parse(bytes: &[u8]) -> Result<Vec<HwCommand>, DecodeError> {
    let mut commands = Vec::new();
    let mut pos = 0usize;
    while let Some((command, next)) = parse_one(bytes, pos)? {
        commands.push(command);
        pos = next;
    }
    Ok(commands)
}

/// Decode the single command starting at byte `pos`, returning it together
/// with the position of the following record. `None` at end of input.
///
/// The software submitter steps with this rather than [`parse`] so execution
/// stops at an end marker instead of decoding whatever trails it.
pub fn parse_one(
    bytes: &[u8],
    pos: usize,
) -> Result<Option<(HwCommand, usize)>, DecodeError> {
    if pos + 4 > bytes.len() {
        return Ok(None);
    }
    let record_start = pos;
    let mut cur = Cursor { bytes, pos };
    let opcode = cur.u32();

    if opcode == 0 {
        return Ok(Some((HwCommand::Nop, cur.pos)));
    }

    if cur.pos + 4 > bytes.len() {
        return Err(DecodeError::TruncatedRecord {
            opcode,
            offset: record_start,
        });
    }
    let size = cur.u32();
    if size < 8 || size % 4 != 0 {
        return Err(DecodeError::BadRecordSize {
            opcode,
            size,
            offset: record_start,
        });
    }
    let record_end = record_start + size as usize;
    if record_end > bytes.len() {
        return Err(DecodeError::TruncatedRecord {
            opcode,
            offset: record_start,
        });
    }

    let command = match opcode {
        OP_PIPE_CONTROL => {
            let flags = PipeControlFlags::from_bits_retain(cur.u32());
            let post_sync = cur.u32();
            let address = cur.u64();
            let data = cur.u64();
            HwCommand::PipeControl {
                flags,
                post_sync: (post_sync != 0).then_some(PostSyncWrite { address, data }),
            }
        }
        OP_STATE_BASE_ADDRESS => HwCommand::StateBaseAddress(StateBaseAddress {
            general_state_base: cur.u64(),
            surface_state_base: cur.u64(),
            dynamic_state_base: cur.u64(),
            instruction_base: cur.u64(),
        }),
        OP_MEDIA_VFE_STATE => HwCommand::MediaVfeState {
            scratch_base: cur.u64(),
            slot0_size: cur.u32(),
            slot1_size: cur.u32(),
            max_threads: cur.u32(),
        },
        OP_BATCH_BUFFER_START => HwCommand::BatchBufferStart {
            address: cur.u64(),
        },
        OP_BATCH_BUFFER_END => HwCommand::BatchBufferEnd,
        OP_LOAD_REGISTER_IMM => HwCommand::LoadRegisterImm {
            register: cur.u32(),
            value: cur.u32(),
        },
        OP_LOAD_REGISTER_MEM => HwCommand::LoadRegisterMem {
            register: cur.u32(),
            address: cur.u64(),
        },
        OP_BINDING_TABLE_POOL_ALLOC => HwCommand::BindingTablePoolAlloc {
            base: cur.u64(),
            size: cur.u32(),
        },
        _ => {
            return Err(DecodeError::UnknownOpcode {
                opcode,
                offset: record_start,
            })
        }
    };

    Ok(Some((command, record_end)))
}

/// Convenience filter: all decoded commands that are not noops.
pub fn parse_non_nop(bytes: &[u8]) -> Result<Vec<HwCommand>, DecodeError> {
    Ok(parse(bytes)?
        .into_iter()
        .filter(|c| *c != HwCommand::Nop)
        .collect())
}
