//! Operation engine
//!
//! - `operation`: operation records, statuses and error enums
//! - `queue`: per-account local/server/deferred queues
//! - `account`: the `MailAccount` seam and phase outcomes
//! - `engine`: the actor that runs every account's queues
//! - `mutations`: one entry point per operation kind

pub mod account;
pub mod engine;
pub mod mutations;
pub mod operation;
pub mod queue;

#[cfg(test)]
pub(crate) mod testing;

pub use account::{AccountOpState, LocalOutcome, MailAccount, ServerOutcome, ServerSuccess};
pub use engine::{EngineSettings, QueueSnapshot, SyncEngine};
pub use mutations::{BatchCallback, BatchCompletion};
pub use operation::{
    CheckResult, Lifecycle, LocalMode, LocalOpError, LocalStatus, LongtermId, OpCallback,
    OpCompletion, OpError, OpKind, OpName, Operation, ServerMode, ServerOpError, ServerStatus,
};
