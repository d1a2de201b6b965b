//! Command-stream submission and scratch/state management engine.
//!
//! The central type is [`CommandStreamReceiver`]: a per-engine state machine
//! that turns workload dispatches into a minimal, correctly ordered sequence
//! of hardware commands (preamble, state-base-address, media VFE state,
//! partition configuration, the workload itself, and a task-count tag update),
//! then either submits immediately or records the buffer for a later
//! coalesced submission ([`SubmissionAggregator`]).
//!
//! Hardware command bit layouts are out of scope: emission goes through the
//! [`cmd::CommandEncoder`] seam, and [`cmd::SoftEncoder`] provides a
//! self-describing software format that [`cmd::decode`] can parse back,
//! which is what the reference [`SoftSubmitter`] and the test suite build
//! on.

#![forbid(unsafe_code)]

pub mod cmd;

mod aggregator;
mod csr;
mod flush_stamp;
mod residency;
mod reuse;
mod scratch;
mod stream;
mod submit;

pub use aggregator::{CommandBuffer, SubmissionAggregator};
pub use csr::{
    CommandStreamReceiver, CompletionStamp, CsrConfig, CsrError, DispatchFlags, DispatchMode,
    FlushError, PreemptionMode, SamplerCacheFlushState, WaitStatus,
};
pub use flush_stamp::FlushStamp;
pub use residency::ResidencyTracker;
pub use reuse::ReusePool;
pub use scratch::{ScratchDirty, ScratchOutOfMemory, ScratchSpaceController, SCRATCH_SPACE_OFFSET};
pub use stream::{LinearStream, StreamLocation};
pub use submit::{BatchBuffer, SoftSubmitter, SubmitError, Submitter, MAX_CHAIN_LINKS};
