//! Operation records
//!
//! An operation is a queued mutation tracked through two phases, one against
//! the local store and one against the server. The record itself is plain data
//! so it can be persisted in the account's mutation history and shown in undo
//! UIs; the engine owns every transition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::error::EddieError;
use crate::types::{FolderType, MessageNamer};

/// Stable per-account id of an operation, `"<account>/<num>"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LongtermId {
    pub account: String,
    pub num: u64,
}

impl LongtermId {
    pub fn new(account: impl Into<String>, num: u64) -> Self {
        Self {
            account: account.into(),
            num,
        }
    }
}

impl fmt::Display for LongtermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.num)
    }
}

impl FromStr for LongtermId {
    type Err = EddieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (account, num) = s
            .rsplit_once('/')
            .ok_or_else(|| EddieError::InvalidInput(format!("Not a longterm id: {}", s)))?;
        let num = num
            .parse()
            .map_err(|_| EddieError::InvalidInput(format!("Not a longterm id: {}", s)))?;
        Ok(Self::new(account, num))
    }
}

impl TryFrom<String> for LongtermId {
    type Error = EddieError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<LongtermId> for String {
    fn from(id: LongtermId) -> Self {
        id.to_string()
    }
}

/// How an operation is (or will be) named
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpName {
    /// Persisted op, named and added to the mutation history on enqueue
    Unnamed,
    /// Ephemeral op, named on enqueue but never persisted
    Session,
    Named(LongtermId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Do,
    Done,
    Undo,
    Undone,
    Moot,
}

impl Lifecycle {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Undone | Self::Moot)
    }
}

/// Local phase status; `None` on the operation means "not yet run"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalStatus {
    Doing,
    Done,
    Undoing,
    Undone,
    Unknown,
}

/// Server phase status; `None` on the operation means "not yet run"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Check,
    Checking,
    Doing,
    Done,
    Undoing,
    Undone,
    Moot,
    #[serde(rename = "n/a")]
    NotApplicable,
    /// Set by a local phase that no longer wants the server phase
    Skip,
}

impl ServerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Doing | Self::Undoing | Self::Checking)
    }
}

/// Attachment payload for a draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftAttachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Every operation the engine knows how to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OpKind {
    Move {
        messages: Vec<MessageNamer>,
        target_folder: String,
        /// Old suid to new suid, filled in by the local phase
        #[serde(default)]
        move_map: BTreeMap<String, String>,
    },
    Delete {
        messages: Vec<MessageNamer>,
    },
    ModTags {
        messages: Vec<MessageNamer>,
        add_tags: Vec<String>,
        remove_tags: Vec<String>,
    },
    /// Fetch attachments or related parts of one message
    Download {
        message: MessageNamer,
        related_part_indices: Vec<usize>,
        attachment_indices: Vec<usize>,
    },
    Append {
        folder_id: String,
        raw_messages: Vec<String>,
    },
    SaveSentDraft {
        folder_id: String,
        namer: MessageNamer,
        header: serde_json::Value,
        body: serde_json::Value,
    },
    SaveDraft {
        existing: Option<MessageNamer>,
        namer: MessageNamer,
        draft: serde_json::Value,
    },
    DeleteDraft {
        namer: MessageNamer,
        /// The deleted row, kept by the local phase so undo can restore it
        #[serde(default)]
        stash: Option<serde_json::Value>,
    },
    AttachBlobToDraft {
        namer: MessageNamer,
        attachment: DraftAttachment,
    },
    DetachAttachmentFromDraft {
        namer: MessageNamer,
        attachment_index: usize,
    },
    SendOutboxMessages {
        before_message: Option<MessageNamer>,
        emit_notifications: bool,
    },
    SetOutboxSyncEnabled {
        enabled: bool,
    },
    CreateFolder {
        parent_folder_id: Option<String>,
        folder_name: String,
        folder_type: FolderType,
        /// Filled in by the local phase
        #[serde(default)]
        folder_id: Option<String>,
    },
    SyncFolderList,
    PurgeExcessMessages {
        folder_id: String,
    },
    DownloadBodyReps {
        message: MessageNamer,
    },
    DownloadBodies {
        messages: Vec<MessageNamer>,
        max_size: Option<usize>,
    },
    UpgradeDb {
        folder_id: String,
    },
}

impl OpKind {
    /// Name for logs and human-readable op labels
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Delete { .. } => "delete",
            Self::ModTags { .. } => "modtags",
            Self::Download { .. } => "download",
            Self::Append { .. } => "append",
            Self::SaveSentDraft { .. } => "saveSentDraft",
            Self::SaveDraft { .. } => "saveDraft",
            Self::DeleteDraft { .. } => "deleteDraft",
            Self::AttachBlobToDraft { .. } => "attachBlobToDraft",
            Self::DetachAttachmentFromDraft { .. } => "detachAttachmentFromDraft",
            Self::SendOutboxMessages { .. } => "sendOutboxMessages",
            Self::SetOutboxSyncEnabled { .. } => "setOutboxSyncEnabled",
            Self::CreateFolder { .. } => "createFolder",
            Self::SyncFolderList => "syncFolderList",
            Self::PurgeExcessMessages { .. } => "purgeExcessMessages",
            Self::DownloadBodyReps { .. } => "downloadBodyReps",
            Self::DownloadBodies { .. } => "downloadBodies",
            Self::UpgradeDb { .. } => "upgradeDb",
        }
    }

    /// Messages the operation touches, if it works on messages
    pub fn messages(&self) -> Vec<&MessageNamer> {
        match self {
            Self::Move { messages, .. }
            | Self::Delete { messages }
            | Self::ModTags { messages, .. }
            | Self::DownloadBodies { messages, .. } => messages.iter().collect(),
            Self::Download { message, .. } | Self::DownloadBodyReps { message } => vec![message],
            Self::SaveSentDraft { namer, .. }
            | Self::SaveDraft { namer, .. }
            | Self::DeleteDraft { namer, .. }
            | Self::AttachBlobToDraft { namer, .. }
            | Self::DetachAttachmentFromDraft { namer, .. } => vec![namer],
            _ => Vec::new(),
        }
    }
}

/// A queued mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(flatten)]
    pub kind: OpKind,
    pub longterm_id: OpName,
    pub lifecycle: Lifecycle,
    pub local_status: Option<LocalStatus>,
    pub server_status: Option<ServerStatus>,
    pub try_count: u32,
    pub human_op: String,
    pub folder_id: Option<String>,
}

impl Operation {
    /// A fresh `do` operation; statuses are set by the caller.
    pub fn new(kind: OpKind, name: OpName) -> Self {
        Self {
            human_op: kind.type_str().to_string(),
            kind,
            longterm_id: name,
            lifecycle: Lifecycle::Do,
            local_status: None,
            server_status: None,
            try_count: 0,
            folder_id: None,
        }
    }

    pub fn with_local_status(mut self, status: LocalStatus) -> Self {
        self.local_status = Some(status);
        self
    }

    pub fn with_server_status(mut self, status: ServerStatus) -> Self {
        self.server_status = Some(status);
        self
    }

    pub fn with_human_op(mut self, human_op: impl Into<String>) -> Self {
        self.human_op = human_op.into();
        self
    }

    pub fn with_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }

    pub fn id(&self) -> Option<&LongtermId> {
        match &self.longterm_id {
            OpName::Named(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.lifecycle.is_terminal()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}({})", self.kind.type_str(), id),
            None => write!(f, "{}(unnamed)", self.kind.type_str()),
        }
    }
}

/// Which half of a local phase to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalMode {
    Do,
    Undo,
}

/// Which server action to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Do,
    Undo,
    /// Find out whether a previous attempt reached the server
    Check,
}

/// Local phase failures; only `Defer` is recoverable
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalOpError {
    #[error("defer")]
    Defer,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerOpError {
    /// Resource unavailable for now; retry after a delay
    #[error("defer")]
    Defer,
    /// Interrupted midway; verify with a check before retrying
    #[error("aborted-retry")]
    AbortedRetry,
    #[error("failure-give-up")]
    FailureGiveUp,
    #[error("moot")]
    Moot,
    /// Treated like `AbortedRetry` but burns retries faster
    #[error("{0}")]
    Other(String),
}

/// Outcome of a `check` server run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckResult {
    CheckedNotYet,
    CoherentNotYet,
    Idempotent,
    Happened,
    Moot,
    Bailed,
}

/// Error delivered to an operation's callback
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "phase", content = "error", rename_all = "lowercase")]
pub enum OpError {
    #[error("local: {0}")]
    Local(LocalOpError),
    #[error("server: {0}")]
    Server(ServerOpError),
}

/// What a completion callback receives
#[derive(Debug, Clone)]
pub struct OpCompletion {
    pub error: Option<OpError>,
    pub result: Option<serde_json::Value>,
    pub op: Operation,
}

/// Invoked once when an operation completes
pub type OpCallback = Box<dyn FnOnce(OpCompletion) + Send + 'static>;
