//! Shared data model for the sentinel agent.
//!
//! This crate holds everything both plan sources and the applier agree on:
//! the declarative [`Plan`] wire types, the checksum that gates idempotent
//! application, the HTTP probe types, the gzip-framed output codec, and the
//! wall-clock timestamp format used in feedback records.
//!
//! Nothing in this crate performs network or filesystem I/O; the only
//! side-effect-bearing code is the in-memory gzip framing in [`codec`].

pub mod codec;
pub mod plan;
pub mod probe;
pub mod timefmt;

pub use codec::{
    decode_one_time, decode_periodic, encode_one_time, encode_periodic, CodecError,
    PeriodicInstructionOutput,
};
pub use plan::{
    checksum, CalculatedPlan, CommonInstruction, File, FileAction, OneTimeInstruction,
    PeriodicInstruction, Plan, PlanError,
};
pub use probe::{HttpGetAction, Probe, ProbeStatus};
