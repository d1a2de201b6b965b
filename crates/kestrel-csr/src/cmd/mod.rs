//! Hardware-command seam: an opaque encoder interface plus a self-describing
//! software format with a matching decoder.
//!
//! The receiver core never interprets command payloads; it only asks the
//! encoder to append commands and to patch previously recorded ones. Real
//! hardware bit layouts live behind [`CommandEncoder`]; [`SoftEncoder`]
//! implements a little-endian tag/length format that [`decode`] parses back
//! for the software submitter and the test suite.

mod encode;

pub mod decode;

pub use encode::{CommandEncoder, SoftEncoder};

use bitflags::bitflags;

/// Register written with the work-partition allocation address so each tile
/// resolves its own partition id.
pub const WPARID_REGISTER: u32 = 0x221C;

/// Register holding the per-tile post-sync address offset.
pub const PARTITION_ADDRESS_OFFSET_REGISTER: u32 = 0x23B4;

/// Byte stride between per-tile tag words; also the value programmed into
/// [`PARTITION_ADDRESS_OFFSET_REGISTER`].
pub const TAG_PARTITION_STRIDE: u64 = 8;

/// L3 cache configuration register.
pub const L3_CONFIG_REGISTER: u32 = 0x7034;

/// Preemption-mode configuration register.
pub const PREEMPTION_CONFIG_REGISTER: u32 = 0x2580;

/// Register programmed once by the engine preamble.
pub const PREAMBLE_PIPELINE_REGISTER: u32 = 0x20C0;

bitflags! {
    /// Behavior bits of a pipe-control command.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PipeControlFlags: u32 {
        const CS_STALL = 1 << 0;
        const DC_FLUSH = 1 << 1;
        const TEXTURE_CACHE_INVALIDATE = 1 << 2;
        const CONSTANT_CACHE_INVALIDATE = 1 << 3;
        const STATE_CACHE_INVALIDATE = 1 << 4;
        const INSTRUCTION_CACHE_INVALIDATE = 1 << 5;
        const TLB_INVALIDATE = 1 << 6;
        const NOTIFY = 1 << 7;
        /// Each active tile adds its partition id times
        /// [`TAG_PARTITION_STRIDE`] to the post-sync address.
        const WORKLOAD_PARTITION_ID_OFFSET = 1 << 8;
    }
}

/// Synchronized memory write carried by a pipe control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostSyncWrite {
    pub address: u64,
    pub data: u64,
}

/// Arguments for one pipe-control emission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipeControlArgs {
    pub flags: PipeControlFlags,
    pub post_sync: Option<PostSyncWrite>,
}

impl PipeControlArgs {
    pub fn with_dc_flush(dc_flush: bool) -> Self {
        let mut flags = PipeControlFlags::CS_STALL;
        if dc_flush {
            flags |= PipeControlFlags::DC_FLUSH;
        }
        Self {
            flags,
            post_sync: None,
        }
    }
}

/// State-base-address payload: base GPU addresses of the state heaps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateBaseAddress {
    pub general_state_base: u64,
    pub surface_state_base: u64,
    pub dynamic_state_base: u64,
    pub instruction_base: u64,
}
