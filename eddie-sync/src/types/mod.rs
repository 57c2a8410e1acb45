pub mod error;

use serde::{Deserialize, Serialize};

/// Names a message by its composite id and date
///
/// A message suid has the shape `<account>/<folder-num>/<message-num>`, so the
/// folder id is everything before the last `/` and the account id is everything
/// before the first `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageNamer {
    pub suid: String,
    /// Milliseconds since the epoch
    pub date: i64,
}

impl MessageNamer {
    pub fn new(suid: impl Into<String>, date: i64) -> Self {
        Self {
            suid: suid.into(),
            date,
        }
    }

    pub fn account_id(&self) -> &str {
        account_id_for_id(&self.suid)
    }

    pub fn folder_id(&self) -> &str {
        folder_id_for_suid(&self.suid)
    }
}

/// Account part of any composite id (folder id, message suid, longterm id)
pub fn account_id_for_id(id: &str) -> &str {
    match id.find('/') {
        Some(idx) => &id[..idx],
        None => id,
    }
}

/// Folder part of a message suid
pub fn folder_id_for_suid(suid: &str) -> &str {
    match suid.rfind('/') {
        Some(idx) => &suid[..idx],
        None => suid,
    }
}

/// Kind of folder, as far as the sync core cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderType {
    Inbox,
    Drafts,
    Localdrafts,
    Outbox,
    Sent,
    Trash,
    Normal,
}

impl FolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Drafts => "drafts",
            Self::Localdrafts => "localdrafts",
            Self::Outbox => "outbox",
            Self::Sent => "sent",
            Self::Trash => "trash",
            Self::Normal => "normal",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "inbox" => Self::Inbox,
            "drafts" => Self::Drafts,
            "localdrafts" => Self::Localdrafts,
            "outbox" => Self::Outbox,
            "sent" => Self::Sent,
            "trash" => Self::Trash,
            _ => Self::Normal,
        }
    }
}

/// A folder known to an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub folder_type: FolderType,
    /// Never synchronized with the server
    pub local_only: bool,
}
