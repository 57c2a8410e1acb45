//! The seam between the engine and a mail account implementation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::operation::{
    CheckResult, LocalMode, LocalOpError, LongtermId, OpKind, Operation, ServerMode,
    ServerOpError,
};
use crate::types::error::EddieError;

/// Everything the engine persists for one account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountOpState {
    pub next_mutation_num: u64,
    /// The mutation history, oldest first
    pub mutations: Vec<Operation>,
    pub deferred: Vec<LongtermId>,
}

/// Result of running a local phase
#[derive(Debug, Clone)]
pub struct LocalOutcome {
    /// Replacement payload, e.g. a move map learned while moving
    pub kind: Option<OpKind>,
    /// The server phase is no longer wanted
    pub skip_server: bool,
    pub result: Result<Option<serde_json::Value>, LocalOpError>,
    pub save_suggested: bool,
}

impl LocalOutcome {
    pub fn ok() -> Self {
        Self {
            kind: None,
            skip_server: false,
            result: Ok(None),
            save_suggested: true,
        }
    }

    pub fn err(error: LocalOpError) -> Self {
        Self {
            kind: None,
            skip_server: false,
            result: Err(error),
            save_suggested: false,
        }
    }

    pub fn with_result(mut self, value: serde_json::Value) -> Self {
        self.result = Ok(Some(value));
        self
    }

    pub fn with_kind(mut self, kind: OpKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn skipping_server(mut self) -> Self {
        self.skip_server = true;
        self
    }

    pub fn without_save(mut self) -> Self {
        self.save_suggested = false;
        self
    }
}

/// Successful server phase
#[derive(Debug, Clone, PartialEq)]
pub enum ServerSuccess {
    /// Answer to a `check` run
    Checked(CheckResult),
    /// A `do` or `undo` run finished
    Completed(Option<serde_json::Value>),
}

#[derive(Debug, Clone)]
pub struct ServerOutcome {
    pub kind: Option<OpKind>,
    pub result: Result<ServerSuccess, ServerOpError>,
    pub save_suggested: bool,
}

impl ServerOutcome {
    pub fn completed() -> Self {
        Self {
            kind: None,
            result: Ok(ServerSuccess::Completed(None)),
            save_suggested: true,
        }
    }

    pub fn checked(check: CheckResult) -> Self {
        Self {
            kind: None,
            result: Ok(ServerSuccess::Checked(check)),
            save_suggested: true,
        }
    }

    pub fn err(error: ServerOpError) -> Self {
        Self {
            kind: None,
            result: Err(error),
            save_suggested: false,
        }
    }

    pub fn with_result(mut self, value: serde_json::Value) -> Self {
        self.result = Ok(ServerSuccess::Completed(Some(value)));
        self
    }

    pub fn with_kind(mut self, kind: OpKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_save(mut self, save: bool) -> Self {
        self.save_suggested = save;
        self
    }
}

/// A mail account the engine can run operations against.
///
/// Implementations must be cheap to share: the engine holds one `Arc` per
/// account and runs each phase as its own task.
#[async_trait]
pub trait MailAccount: Send + Sync {
    fn id(&self) -> &str;

    /// Disabled accounts keep their queues but run no server phases.
    fn enabled(&self) -> bool;

    /// True for folders that exist only on this device.
    fn is_local_only_folder(&self, folder_id: &str) -> bool;

    async fn run_local_op(&self, op: Operation, mode: LocalMode) -> LocalOutcome;

    async fn run_server_op(&self, op: Operation, mode: ServerMode) -> ServerOutcome;

    /// Must return only after the state is durably committed.
    async fn save_account_state(&self, state: AccountOpState, label: &str) -> Result<(), EddieError>;

    /// The queues drained; release connections and the like.
    async fn all_operations_completed(&self);

    /// The engine forgot this account.
    fn account_deleted(&self) {}
}
