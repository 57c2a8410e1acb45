//! POP3 mailbox backed by the local SQLite store
//!
//! POP3 has no server-side folders or flags. Everything a mutation changes
//! lives in the local store, so most server phases succeed without talking to
//! the server. Only downloads and inbox syncs open a connection.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::adapters::pop3::mime::MessageBody;
use crate::adapters::pop3::{
    ErrorScope, FetchProgress, ListOptions, ListingSink, Pop3Client, Pop3Error, Pop3ErrorKind,
    Pop3Options,
};
use crate::adapters::sqlite::messages::StoredMessage;
use crate::adapters::sqlite::{account_state, folders, messages as message_store, pop3_state, SyncDatabase};
use crate::config::Pop3Settings;
use crate::sync::account::{AccountOpState, LocalOutcome, MailAccount, ServerOutcome};
use crate::sync::operation::{
    CheckResult, LocalMode, LocalOpError, OpKind, Operation, ServerMode, ServerOpError,
};
use crate::types::error::EddieError;
use crate::types::{Folder, FolderType, MessageNamer};

const DELETED_FLAG: &str = "\\Deleted";
const SEEN_FLAG: &str = "\\Seen";

/// Folder numbers are fixed so every install names them the same way.
const STANDARD_FOLDERS: [(FolderType, &str); 6] = [
    (FolderType::Inbox, "Inbox"),
    (FolderType::Drafts, "Drafts"),
    (FolderType::Sent, "Sent"),
    (FolderType::Trash, "Trash"),
    (FolderType::Outbox, "Outbox"),
    (FolderType::Localdrafts, "Local Drafts"),
];

/// Opens authenticated POP3 sessions
#[async_trait]
pub trait Pop3Connector: Send + Sync {
    async fn connect(&self, options: Pop3Options) -> Result<Pop3Client, Pop3Error>;
}

/// Connects over the network
pub struct TcpConnector;

#[async_trait]
impl Pop3Connector for TcpConnector {
    async fn connect(&self, options: Pop3Options) -> Result<Pop3Client, Pop3Error> {
        Pop3Client::connect(options).await
    }
}

#[derive(Debug, Error)]
enum AccountError {
    #[error(transparent)]
    Pop3(#[from] Pop3Error),
    #[error(transparent)]
    Store(#[from] EddieError),
}

impl From<serde_json::Error> for AccountError {
    fn from(err: serde_json::Error) -> Self {
        AccountError::Store(err.into())
    }
}

enum Fetched {
    Stored,
    AlreadyHave,
    TooBig,
    /// Neither the store nor the server has it any more
    Gone,
}

/// What one inbox sync did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub new_messages: usize,
    /// Left on the server by the per-sync limit
    pub overflow: usize,
    pub first_error: Option<String>,
}

pub struct Pop3Account {
    account_id: String,
    enabled: AtomicBool,
    db: SyncDatabase,
    options: Pop3Options,
    settings: Pop3Settings,
    connector: Arc<dyn Pop3Connector>,
    /// At most one session at a time
    conn: Mutex<Option<Pop3Client>>,
    outbox_sync_enabled: AtomicBool,
}

impl Pop3Account {
    pub fn new(
        account_id: impl Into<String>,
        options: Pop3Options,
        settings: Pop3Settings,
        db: SyncDatabase,
        enabled: bool,
    ) -> Result<Self, EddieError> {
        let account = Self {
            account_id: account_id.into(),
            enabled: AtomicBool::new(enabled),
            db,
            options,
            settings,
            connector: Arc::new(TcpConnector),
            conn: Mutex::new(None),
            outbox_sync_enabled: AtomicBool::new(true),
        };
        let created = account.ensure_standard_folders()?;
        if created > 0 {
            info!(account_id = %account.account_id, "Created {} standard folders", created);
        }
        Ok(account)
    }

    pub fn with_connector(mut self, connector: Arc<dyn Pop3Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn database(&self) -> &SyncDatabase {
        &self.db
    }

    pub fn inbox_id(&self) -> String {
        format!("{}/0", self.account_id)
    }

    pub fn outbox_sync_enabled(&self) -> bool {
        self.outbox_sync_enabled.load(Ordering::SeqCst)
    }

    fn ensure_standard_folders(&self) -> Result<usize, EddieError> {
        let mut created = 0;
        for (num, (folder_type, name)) in STANDARD_FOLDERS.iter().enumerate() {
            let folder = Folder {
                id: format!("{}/{}", self.account_id, num),
                name: name.to_string(),
                folder_type: *folder_type,
                local_only: *folder_type != FolderType::Inbox,
            };
            if folders::ensure_folder(self.db.pool(), &folder)? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Fetch new inbox messages, or with `grow` the ones an earlier sync
    /// left on the server.
    pub async fn sync_inbox(&self, grow: bool) -> Result<SyncSummary, EddieError> {
        let mut slot = self.conn.lock().await;
        if let Some(mut old) = slot.take() {
            if let Err(e) = old.quit().await {
                debug!(account_id = %self.account_id, "Quitting old POP3 session failed: {}", e);
            }
        }

        let pool = self.db.pool();
        let known = pop3_state::known_uidls(pool, &self.account_id)?;
        let overflow = pop3_state::overflow_uidls(pool, &self.account_id)?;
        let filter: Box<dyn Fn(&str) -> bool + Send + Sync> = if grow {
            Box::new(move |uidl: &str| overflow.contains(uidl))
        } else {
            Box::new(move |uidl: &str| !known.contains(uidl) && !overflow.contains(uidl))
        };

        info!(account_id = %self.account_id, grow = grow, "Syncing POP3 inbox");
        let mut client = self.connector.connect(self.options.clone()).await?;

        let inbox_id = self.inbox_id();
        let mut sink = InboxSink {
            next_num: message_store::next_message_num(pool, &inbox_id)?,
            db: self.db.clone(),
            account_id: self.account_id.clone(),
            inbox_id,
            pending: Vec::new(),
            stored: 0,
        };

        let listed = client
            .list_messages(
                ListOptions {
                    filter: Some(filter),
                    max_messages: Some(self.settings.max_messages_per_sync),
                    checkpoint_interval: Some(self.settings.save_state_every_n_messages),
                },
                &mut sink,
            )
            .await;
        sink.flush()?;

        let listed = match listed {
            Ok(listed) => listed,
            Err(e) => {
                client.close();
                return Err(e.into());
            }
        };
        pop3_state::add_overflow(pool, &self.account_id, &listed.overflow)?;

        if let Err(e) = client.quit().await {
            warn!(account_id = %self.account_id, "POP3 QUIT failed: {}", e);
        }

        let summary = SyncSummary {
            new_messages: sink.stored,
            overflow: listed.overflow.len(),
            first_error: listed.first_error.map(|e| e.to_string()),
        };
        info!(
            account_id = %self.account_id,
            "Inbox sync stored {} messages, {} left on server",
            summary.new_messages,
            summary.overflow
        );
        Ok(summary)
    }

    /// Reuse the open session or start a new one.
    async fn connected<'a>(&self, slot: &'a mut Option<Pop3Client>) -> Result<&'a mut Pop3Client, Pop3Error> {
        if slot.as_ref().map_or(true, Pop3Client::is_closed) {
            debug!(account_id = %self.account_id, "Opening POP3 session");
            *slot = Some(self.connector.connect(self.options.clone()).await?);
        }
        slot.as_mut().ok_or_else(|| {
            Pop3Error::new(ErrorScope::Connection, Pop3ErrorKind::UnresponsiveServer, "no session")
        })
    }

    async fn drop_connection(&self) {
        if let Some(client) = self.conn.lock().await.take() {
            client.close();
        }
    }

    fn edit_flags(&self, suid: &str, add: &[String], remove: &[String]) -> Result<(), EddieError> {
        let pool = self.db.pool();
        let Some(message) = message_store::get_message(pool, suid)? else {
            warn!(account_id = %self.account_id, "No stored message {}, flags unchanged", suid);
            return Ok(());
        };
        let mut flags = message.flags;
        flags.retain(|f| !remove.contains(f));
        for flag in add {
            if !flags.contains(flag) {
                flags.push(flag.clone());
            }
        }
        message_store::set_flags(pool, suid, &flags)?;
        Ok(())
    }

    fn edit_draft_attachments(
        &self,
        suid: &str,
        edit: impl FnOnce(&mut Vec<Value>) -> Result<(), EddieError>,
    ) -> Result<(), EddieError> {
        let pool = self.db.pool();
        let message = message_store::get_message(pool, suid)?
            .ok_or_else(|| EddieError::MessageNotFound(suid.to_string()))?;
        let mut body = message.body.filter(Value::is_object).unwrap_or_else(|| json!({}));
        let mut attachments = body["attachments"].as_array().cloned().unwrap_or_default();
        edit(&mut attachments)?;
        body["attachments"] = Value::Array(attachments);
        message_store::update_body(pool, suid, &message.header, &body)?;
        Ok(())
    }

    fn run_local(&self, op: &Operation, mode: LocalMode) -> Result<LocalOutcome, EddieError> {
        let pool = self.db.pool();
        let deleted = [DELETED_FLAG.to_string()];

        match (&op.kind, mode) {
            (OpKind::Move { messages, target_folder, .. }, LocalMode::Do) => {
                let mut move_map = BTreeMap::new();
                for namer in messages {
                    if namer.folder_id() == target_folder {
                        continue;
                    }
                    let new_suid = message_store::next_suid(pool, target_folder)?;
                    if message_store::move_message(pool, &namer.suid, &new_suid)? {
                        move_map.insert(namer.suid.clone(), new_suid);
                    } else {
                        warn!(op = %op, "Message {} is gone, not moving it", namer.suid);
                    }
                }
                let result = json!({ "move_map": move_map });
                Ok(LocalOutcome::ok()
                    .with_kind(OpKind::Move {
                        messages: messages.clone(),
                        target_folder: target_folder.clone(),
                        move_map,
                    })
                    .with_result(result))
            }
            (OpKind::Move { move_map, .. }, LocalMode::Undo) => {
                for (old, new) in move_map {
                    message_store::move_message(pool, new, old)?;
                }
                Ok(LocalOutcome::ok())
            }

            (OpKind::Delete { messages }, mode) => {
                for namer in messages {
                    match mode {
                        LocalMode::Do => self.edit_flags(&namer.suid, &deleted, &[])?,
                        LocalMode::Undo => self.edit_flags(&namer.suid, &[], &deleted)?,
                    }
                }
                Ok(LocalOutcome::ok())
            }

            (OpKind::ModTags { messages, add_tags, remove_tags }, mode) => {
                let (add, remove) = match mode {
                    LocalMode::Do => (add_tags, remove_tags),
                    LocalMode::Undo => (remove_tags, add_tags),
                };
                for namer in messages {
                    self.edit_flags(&namer.suid, add, remove)?;
                }
                Ok(LocalOutcome::ok())
            }

            (OpKind::SaveSentDraft { namer, header, body, .. }, LocalMode::Do) => {
                message_store::insert_message(
                    pool,
                    &StoredMessage {
                        suid: namer.suid.clone(),
                        uidl: None,
                        date: namer.date,
                        flags: vec![SEEN_FLAG.to_string()],
                        header: header.clone(),
                        body: Some(body.clone()),
                    },
                )?;
                Ok(LocalOutcome::ok())
            }
            (OpKind::SaveSentDraft { namer, .. }, LocalMode::Undo) => {
                message_store::delete_message(pool, &namer.suid)?;
                Ok(LocalOutcome::ok())
            }

            (OpKind::SaveDraft { existing, namer, draft }, LocalMode::Do) => {
                message_store::insert_message(
                    pool,
                    &StoredMessage {
                        suid: namer.suid.clone(),
                        uidl: None,
                        date: namer.date,
                        flags: vec![SEEN_FLAG.to_string()],
                        header: draft.get("header").cloned().unwrap_or_else(|| draft.clone()),
                        body: Some(draft.clone()),
                    },
                )?;
                if let Some(existing) = existing {
                    self.edit_flags(&existing.suid, &deleted, &[])?;
                }
                Ok(LocalOutcome::ok().with_result(json!({ "suid": namer.suid })))
            }
            (OpKind::SaveDraft { existing, namer, .. }, LocalMode::Undo) => {
                message_store::delete_message(pool, &namer.suid)?;
                if let Some(existing) = existing {
                    self.edit_flags(&existing.suid, &[], &deleted)?;
                }
                Ok(LocalOutcome::ok())
            }

            (OpKind::DeleteDraft { namer, .. }, LocalMode::Do) => {
                let stash = message_store::delete_message(pool, &namer.suid)?
                    .map(|row| serde_json::to_value(&row))
                    .transpose()?;
                Ok(LocalOutcome::ok().with_kind(OpKind::DeleteDraft {
                    namer: namer.clone(),
                    stash,
                }))
            }
            (OpKind::DeleteDraft { stash, .. }, LocalMode::Undo) => {
                if let Some(stash) = stash {
                    let row: StoredMessage = serde_json::from_value(stash.clone())?;
                    message_store::insert_message(pool, &row)?;
                }
                Ok(LocalOutcome::ok())
            }

            (OpKind::AttachBlobToDraft { namer, attachment }, mode) => {
                self.edit_draft_attachments(&namer.suid, |attachments| {
                    match mode {
                        LocalMode::Do => attachments.push(json!({
                            "name": attachment.name,
                            "mime_type": attachment.mime_type,
                            "size": attachment.data.len(),
                            "data": BASE64.encode(&attachment.data),
                        })),
                        LocalMode::Undo => {
                            attachments.pop();
                        }
                    }
                    Ok(())
                })?;
                Ok(LocalOutcome::ok())
            }

            (OpKind::DetachAttachmentFromDraft { namer, attachment_index }, LocalMode::Do) => {
                self.edit_draft_attachments(&namer.suid, |attachments| {
                    if *attachment_index >= attachments.len() {
                        return Err(EddieError::InvalidInput(format!(
                            "Draft {} has no attachment {}",
                            namer.suid, attachment_index
                        )));
                    }
                    attachments.remove(*attachment_index);
                    Ok(())
                })?;
                Ok(LocalOutcome::ok())
            }

            (OpKind::SetOutboxSyncEnabled { enabled }, mode) => {
                let value = match mode {
                    LocalMode::Do => *enabled,
                    LocalMode::Undo => !*enabled,
                };
                self.outbox_sync_enabled.store(value, Ordering::SeqCst);
                Ok(LocalOutcome::ok().without_save())
            }

            (
                OpKind::CreateFolder {
                    parent_folder_id,
                    folder_name,
                    folder_type,
                    ..
                },
                LocalMode::Do,
            ) => {
                let folder_id = folders::next_folder_id(pool, &self.account_id)?;
                folders::ensure_folder(
                    pool,
                    &Folder {
                        id: folder_id.clone(),
                        name: folder_name.clone(),
                        folder_type: *folder_type,
                        local_only: true,
                    },
                )?;
                let result = json!({ "folder_id": folder_id });
                Ok(LocalOutcome::ok()
                    .with_kind(OpKind::CreateFolder {
                        parent_folder_id: parent_folder_id.clone(),
                        folder_name: folder_name.clone(),
                        folder_type: *folder_type,
                        folder_id: Some(folder_id),
                    })
                    .with_result(result))
            }
            (OpKind::CreateFolder { folder_id, .. }, LocalMode::Undo) => {
                if let Some(folder_id) = folder_id {
                    folders::delete_folder(pool, folder_id)?;
                }
                Ok(LocalOutcome::ok())
            }

            (OpKind::SyncFolderList, LocalMode::Do) => {
                self.ensure_standard_folders()?;
                Ok(LocalOutcome::ok().without_save())
            }

            (OpKind::PurgeExcessMessages { folder_id }, LocalMode::Do) => {
                let purged = message_store::purge_flagged(pool, folder_id, DELETED_FLAG)?;
                debug!(account_id = %self.account_id, "Purged {} messages from {}", purged, folder_id);
                Ok(LocalOutcome::ok().with_result(json!({ "purged": purged })))
            }

            // Downloads work in the server phase; the rest have nothing to undo.
            _ => Ok(LocalOutcome::ok().without_save()),
        }
    }

    async fn run_server(&self, op: &Operation, mode: ServerMode) -> Result<ServerOutcome, AccountError> {
        if mode == ServerMode::Check {
            let check = match &op.kind {
                OpKind::Download { .. }
                | OpKind::DownloadBodyReps { .. }
                | OpKind::DownloadBodies { .. }
                | OpKind::SendOutboxMessages { .. }
                | OpKind::Append { .. } => CheckResult::CheckedNotYet,
                _ => CheckResult::Happened,
            };
            return Ok(ServerOutcome::checked(check));
        }

        match (&op.kind, mode) {
            (OpKind::Append { folder_id, .. }, ServerMode::Do) => {
                warn!(op = %op, "POP3 cannot append to {}", folder_id);
                Ok(ServerOutcome::err(ServerOpError::FailureGiveUp))
            }
            (OpKind::SyncFolderList, ServerMode::Do) => {
                self.ensure_standard_folders()?;
                Ok(ServerOutcome::completed().with_save(false))
            }
            (OpKind::SendOutboxMessages { .. }, ServerMode::Do) => {
                debug!(op = %op, "No outgoing transport for POP3 accounts");
                Ok(ServerOutcome::completed().with_result(json!({ "sent": 0 })))
            }
            (OpKind::Download { message, .. } | OpKind::DownloadBodyReps { message }, ServerMode::Do) => {
                match self.download_full(message, None).await? {
                    Fetched::Gone => Ok(ServerOutcome::err(ServerOpError::Moot)),
                    _ => Ok(ServerOutcome::completed()),
                }
            }
            (OpKind::DownloadBodies { messages, max_size }, ServerMode::Do) => {
                let mut downloaded = 0;
                for message in messages {
                    if let Fetched::Stored = self.download_full(message, *max_size).await? {
                        downloaded += 1;
                    }
                }
                Ok(ServerOutcome::completed().with_result(json!({ "downloaded": downloaded })))
            }
            // Moves, deletes, tags and folders only exist locally.
            _ => Ok(ServerOutcome::completed()),
        }
    }

    /// RETR the whole message and replace the stored snippet.
    async fn download_full(&self, namer: &MessageNamer, max_size: Option<usize>) -> Result<Fetched, AccountError> {
        let pool = self.db.pool();
        let Some(stored) = message_store::get_message(pool, &namer.suid)? else {
            return Ok(Fetched::Gone);
        };
        if stored.body.as_ref().map_or(false, is_fully_downloaded) {
            return Ok(Fetched::AlreadyHave);
        }
        let Some(uidl) = stored.uidl else {
            return Ok(Fetched::Gone);
        };

        let mut slot = self.conn.lock().await;
        let client = self.connected(&mut slot).await?;

        let listing = client.message_list().await?;
        let Some(info) = listing.iter().find(|m| m.uidl == uidl) else {
            info!(account_id = %self.account_id, "Message {} no longer on the server", uidl);
            return Ok(Fetched::Gone);
        };
        if max_size.map_or(false, |max| info.size > max) {
            debug!(account_id = %self.account_id, "Skipping {} ({} bytes)", uidl, info.size);
            return Ok(Fetched::TooBig);
        }

        let message = client.download_message_by_uidl(&uidl).await?;
        let header = serde_json::to_value(&message.header)?;
        let body = serde_json::to_value(&message.body)?;
        message_store::update_body(pool, &namer.suid, &header, &body)?;
        debug!(account_id = %self.account_id, "Downloaded {} in full", namer.suid);
        Ok(Fetched::Stored)
    }

    fn server_error(&self, err: &AccountError) -> ServerOpError {
        match err {
            AccountError::Pop3(e) => match (e.scope, e.kind) {
                (_, Pop3ErrorKind::BadUserOrPass) | (_, Pop3ErrorKind::BadSecurity) => {
                    ServerOpError::FailureGiveUp
                }
                (ErrorScope::Connection, _) | (_, Pop3ErrorKind::UnresponsiveServer) => {
                    ServerOpError::Defer
                }
                _ => ServerOpError::Other(e.to_string()),
            },
            AccountError::Store(e) => ServerOpError::Other(e.to_string()),
        }
    }
}

fn is_fully_downloaded(body: &Value) -> bool {
    serde_json::from_value::<MessageBody>(body.clone())
        .map(|body| body.body_reps.iter().all(|rep| rep.is_downloaded))
        .unwrap_or(false)
}

#[async_trait]
impl MailAccount for Pop3Account {
    fn id(&self) -> &str {
        &self.account_id
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_local_only_folder(&self, folder_id: &str) -> bool {
        match folders::get_folder(self.db.pool(), folder_id) {
            Ok(folder) => folder.map_or(false, |f| f.local_only),
            Err(e) => {
                warn!(account_id = %self.account_id, "Folder lookup failed for {}: {}", folder_id, e);
                false
            }
        }
    }

    async fn run_local_op(&self, op: Operation, mode: LocalMode) -> LocalOutcome {
        debug!(op = %op, mode = ?mode, "Running local phase");
        match self.run_local(&op, mode) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(op = %op, mode = ?mode, "Local phase failed: {}", e);
                LocalOutcome::err(LocalOpError::Other(e.to_string()))
            }
        }
    }

    async fn run_server_op(&self, op: Operation, mode: ServerMode) -> ServerOutcome {
        debug!(op = %op, mode = ?mode, "Running server phase");
        match self.run_server(&op, mode).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let mapped = self.server_error(&e);
                warn!(op = %op, mode = ?mode, "Server phase failed ({}): {}", mapped, e);
                if mapped != ServerOpError::Moot {
                    self.drop_connection().await;
                }
                ServerOutcome::err(mapped)
            }
        }
    }

    async fn save_account_state(&self, state: AccountOpState, label: &str) -> Result<(), EddieError> {
        debug!(account_id = %self.account_id, "Saving account state: {}", label);
        account_state::save_account_state(self.db.pool(), &self.account_id, &state)
    }

    async fn all_operations_completed(&self) {
        let client = self.conn.lock().await.take();
        if let Some(mut client) = client {
            debug!(account_id = %self.account_id, "Queues drained, closing POP3 session");
            if let Err(e) = client.quit().await {
                debug!(account_id = %self.account_id, "POP3 QUIT failed: {}", e);
            }
        }
    }

    fn account_deleted(&self) {
        if let Ok(mut slot) = self.conn.try_lock() {
            if let Some(client) = slot.take() {
                client.close();
            }
        }
        if let Err(e) = account_state::delete_account_data(self.db.pool(), &self.account_id) {
            error!(account_id = %self.account_id, "Failed to delete account data: {}", e);
        }
    }
}

/// Buffers listed messages and writes them at each checkpoint
struct InboxSink {
    db: SyncDatabase,
    account_id: String,
    inbox_id: String,
    next_num: i64,
    pending: Vec<StoredMessage>,
    stored: usize,
}

impl InboxSink {
    fn flush(&mut self) -> Result<(), EddieError> {
        let pool = self.db.pool();
        for message in std::mem::take(&mut self.pending) {
            message_store::insert_message(pool, &message)?;
            if let Some(uidl) = &message.uidl {
                pop3_state::record_uidl(pool, &self.account_id, uidl, &message.suid)?;
                pop3_state::remove_overflow(pool, &self.account_id, uidl)?;
            }
            self.stored += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl ListingSink for InboxSink {
    async fn on_message(&mut self, progress: FetchProgress) {
        let message = progress.message;
        let (header, body) = match (
            serde_json::to_value(&message.header),
            serde_json::to_value(&message.body),
        ) {
            (Ok(header), Ok(body)) => (header, body),
            (Err(e), _) | (_, Err(e)) => {
                warn!(account_id = %self.account_id, "Could not encode message: {}", e);
                return;
            }
        };

        let suid = format!("{}/{}", self.inbox_id, self.next_num);
        self.next_num += 1;
        self.pending.push(StoredMessage {
            suid,
            uidl: message.header.srvid.clone(),
            date: message.header.date,
            flags: Vec::new(),
            header,
            body: Some(body),
        });
    }

    async fn checkpoint(&mut self) {
        let count = self.pending.len();
        match self.flush() {
            Ok(()) => debug!(account_id = %self.account_id, "Checkpoint stored {} messages", count),
            Err(e) => error!(account_id = %self.account_id, "Checkpoint failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::pop3::{AuthMethod, Crypto};
    use crate::sync::account::ServerSuccess;
    use crate::sync::operation::{DraftAttachment, LongtermId, OpName};
    use std::collections::{HashSet, VecDeque};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::task::JoinHandle;

    type Script = Vec<(&'static str, String)>;

    async fn serve(server: DuplexStream, script: Script) -> Vec<String> {
        let (read, mut write) = tokio::io::split(server);
        let mut reader = BufReader::new(read);
        let mut received = Vec::new();

        write.write_all(b"+OK ready\r\n").await.unwrap();
        for (expected, reply) in script {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            assert!(line.starts_with(expected), "expected {} got {}", expected, line);
            received.push(line);
            write.write_all(reply.as_bytes()).await.unwrap();
        }
        received
    }

    /// Hands out one scripted session per connect; refuses once they run out.
    #[derive(Default)]
    struct ScriptedConnector {
        scripts: std::sync::Mutex<VecDeque<Script>>,
        servers: std::sync::Mutex<Vec<JoinHandle<Vec<String>>>>,
    }

    impl ScriptedConnector {
        fn with_sessions(sessions: Vec<Script>) -> Arc<Self> {
            let connector = Self::default();
            *connector.scripts.lock().unwrap() = sessions.into();
            Arc::new(connector)
        }

        /// Every command the fake servers saw, session by session.
        async fn received(&self) -> Vec<Vec<String>> {
            let servers: Vec<_> = self.servers.lock().unwrap().drain(..).collect();
            let mut received = Vec::new();
            for server in servers {
                received.push(server.await.unwrap());
            }
            received
        }
    }

    #[async_trait]
    impl Pop3Connector for ScriptedConnector {
        async fn connect(&self, options: Pop3Options) -> Result<Pop3Client, Pop3Error> {
            let script = self.scripts.lock().unwrap().pop_front();
            let Some(script) = script else {
                return Err(Pop3Error::new(
                    ErrorScope::Connection,
                    Pop3ErrorKind::UnresponsiveServer,
                    "connection refused",
                ));
            };
            let (client_end, server_end) = tokio::io::duplex(64 * 1024);
            self.servers.lock().unwrap().push(tokio::spawn(serve(server_end, script)));
            Pop3Client::from_stream(options, Box::new(client_end)).await
        }
    }

    fn login(mut rest: Script) -> Script {
        let mut script = vec![
            ("USER bob", "+OK\r\n".to_string()),
            ("PASS secret", "+OK\r\n".to_string()),
        ];
        script.append(&mut rest);
        script
    }

    fn raw_message(subject: &str, body: &str) -> String {
        format!(
            "+OK\r\nSubject: {}\r\nDate: Tue, 14 Nov 2023 10:00:00 +0000\r\nContent-Type: text/plain\r\n\r\n{}\r\n.\r\n",
            subject, body
        )
    }

    fn account(connector: Arc<ScriptedConnector>) -> Pop3Account {
        let mut options = Pop3Options::new("pop.example.com", "bob", "secret");
        options.crypto = Crypto::Plain;
        options.preferred_auth_method = Some(AuthMethod::UserPass);
        let settings = Pop3Settings {
            max_messages_per_sync: 2,
            ..Default::default()
        };
        Pop3Account::new("a", options, settings, SyncDatabase::in_memory().unwrap(), true)
            .unwrap()
            .with_connector(connector)
    }

    fn stored(suid: &str, uidl: Option<&str>) -> StoredMessage {
        StoredMessage {
            suid: suid.to_string(),
            uidl: uidl.map(str::to_string),
            date: 1_700_000_000_000,
            flags: Vec::new(),
            header: json!({ "subject": suid }),
            body: None,
        }
    }

    fn named(kind: OpKind) -> Operation {
        Operation::new(kind, OpName::Named(LongtermId::new("a", 1)))
    }

    fn namer(suid: &str) -> MessageNamer {
        MessageNamer::new(suid, 1_700_000_000_000)
    }

    #[tokio::test]
    async fn test_standard_folders() {
        let account = account(ScriptedConnector::with_sessions(vec![]));
        let all = folders::list_folders(account.database().pool(), "a").unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0].folder_type, FolderType::Inbox);

        assert!(!account.is_local_only_folder("a/0"));
        assert!(account.is_local_only_folder("a/3"));
        assert!(!account.is_local_only_folder("a/99"));

        // Reopening the same store creates nothing new
        assert_eq!(account.ensure_standard_folders().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_move_then_undo() {
        let account = account(ScriptedConnector::with_sessions(vec![]));
        let pool = account.database().pool().clone();
        message_store::insert_message(&pool, &stored("a/0/0", Some("u1"))).unwrap();

        let op = named(OpKind::Move {
            messages: vec![namer("a/0/0")],
            target_folder: "a/3".to_string(),
            move_map: BTreeMap::new(),
        });
        let outcome = account.run_local_op(op.clone(), LocalMode::Do).await;
        assert_eq!(outcome.result.unwrap().unwrap()["move_map"]["a/0/0"], "a/3/0");
        assert!(message_store::get_message(&pool, "a/3/0").unwrap().is_some());

        let mut done = op;
        done.kind = outcome.kind.unwrap();
        let undone = account.run_local_op(done, LocalMode::Undo).await;
        assert!(undone.result.is_ok());
        assert!(message_store::get_message(&pool, "a/0/0").unwrap().is_some());
        assert!(message_store::get_message(&pool, "a/3/0").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_reversible_until_purged() {
        let account = account(ScriptedConnector::with_sessions(vec![]));
        let pool = account.database().pool().clone();
        message_store::insert_message(&pool, &stored("a/0/0", None)).unwrap();
        message_store::insert_message(&pool, &stored("a/0/1", None)).unwrap();

        let delete = named(OpKind::Delete { messages: vec![namer("a/0/0")] });
        account.run_local_op(delete.clone(), LocalMode::Do).await.result.unwrap();
        assert!(message_store::get_message(&pool, "a/0/0").unwrap().unwrap().has_flag(DELETED_FLAG));

        account.run_local_op(delete.clone(), LocalMode::Undo).await.result.unwrap();
        assert!(!message_store::get_message(&pool, "a/0/0").unwrap().unwrap().has_flag(DELETED_FLAG));

        account.run_local_op(delete, LocalMode::Do).await.result.unwrap();
        let purge = named(OpKind::PurgeExcessMessages { folder_id: "a/0".to_string() });
        let purged = account.run_local_op(purge, LocalMode::Do).await;
        assert_eq!(purged.result.unwrap().unwrap()["purged"], 1);
        assert_eq!(message_store::list_messages(&pool, "a/0").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_modtags_undo_applies_inverse() {
        let account = account(ScriptedConnector::with_sessions(vec![]));
        let pool = account.database().pool().clone();
        let mut message = stored("a/0/0", None);
        message.flags = vec!["old".to_string()];
        message_store::insert_message(&pool, &message).unwrap();

        let op = named(OpKind::ModTags {
            messages: vec![namer("a/0/0")],
            add_tags: vec![SEEN_FLAG.to_string()],
            remove_tags: vec!["old".to_string()],
        });
        account.run_local_op(op.clone(), LocalMode::Do).await.result.unwrap();
        let flags = message_store::get_message(&pool, "a/0/0").unwrap().unwrap().flags;
        assert_eq!(flags, vec![SEEN_FLAG.to_string()]);

        account.run_local_op(op, LocalMode::Undo).await.result.unwrap();
        let flags = message_store::get_message(&pool, "a/0/0").unwrap().unwrap().flags;
        assert_eq!(flags, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn test_draft_lifecycle() {
        let account = account(ScriptedConnector::with_sessions(vec![]));
        let pool = account.database().pool().clone();
        message_store::insert_message(&pool, &stored("a/5/1", None)).unwrap();

        let save = named(OpKind::SaveDraft {
            existing: Some(namer("a/5/1")),
            namer: namer("a/5/2"),
            draft: json!({ "header": { "subject": "hi" } }),
        });
        account.run_local_op(save, LocalMode::Do).await.result.unwrap();
        assert!(message_store::get_message(&pool, "a/5/1").unwrap().unwrap().has_flag(DELETED_FLAG));

        let attach = named(OpKind::AttachBlobToDraft {
            namer: namer("a/5/2"),
            attachment: DraftAttachment {
                name: "a.txt".to_string(),
                mime_type: "text/plain".to_string(),
                data: b"abc".to_vec(),
            },
        });
        account.run_local_op(attach, LocalMode::Do).await.result.unwrap();
        let draft = message_store::get_message(&pool, "a/5/2").unwrap().unwrap();
        assert_eq!(draft.header["subject"], "hi");
        assert_eq!(draft.body.unwrap()["attachments"][0]["data"], "YWJj");

        let detach = named(OpKind::DetachAttachmentFromDraft {
            namer: namer("a/5/2"),
            attachment_index: 3,
        });
        let failed = account.run_local_op(detach, LocalMode::Do).await;
        assert!(matches!(failed.result, Err(LocalOpError::Other(_))));

        let delete = named(OpKind::DeleteDraft { namer: namer("a/5/2"), stash: None });
        let outcome = account.run_local_op(delete.clone(), LocalMode::Do).await;
        assert!(message_store::get_message(&pool, "a/5/2").unwrap().is_none());

        let mut done = delete;
        done.kind = outcome.kind.unwrap();
        account.run_local_op(done, LocalMode::Undo).await.result.unwrap();
        let restored = message_store::get_message(&pool, "a/5/2").unwrap().unwrap();
        assert_eq!(restored.body.unwrap()["attachments"][0]["name"], "a.txt");
    }

    #[tokio::test]
    async fn test_create_folder_and_undo() {
        let account = account(ScriptedConnector::with_sessions(vec![]));
        let op = named(OpKind::CreateFolder {
            parent_folder_id: None,
            folder_name: "Receipts".to_string(),
            folder_type: FolderType::Normal,
            folder_id: None,
        });
        let outcome = account.run_local_op(op.clone(), LocalMode::Do).await;
        assert_eq!(outcome.result.unwrap().unwrap()["folder_id"], "a/6");
        assert!(account.is_local_only_folder("a/6"));

        let mut done = op;
        done.kind = outcome.kind.unwrap();
        account.run_local_op(done, LocalMode::Undo).await.result.unwrap();
        assert!(folders::get_folder(account.database().pool(), "a/6").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outbox_sync_toggle() {
        let account = account(ScriptedConnector::with_sessions(vec![]));
        let op = named(OpKind::SetOutboxSyncEnabled { enabled: false });
        account.run_local_op(op.clone(), LocalMode::Do).await;
        assert!(!account.outbox_sync_enabled());
        account.run_local_op(op, LocalMode::Undo).await;
        assert!(account.outbox_sync_enabled());
    }

    #[tokio::test]
    async fn test_server_phases_without_connection() {
        let account = account(ScriptedConnector::with_sessions(vec![]));
        let move_op = named(OpKind::Move {
            messages: vec![namer("a/0/0")],
            target_folder: "a/3".to_string(),
            move_map: BTreeMap::new(),
        });
        let checked = account.run_server_op(move_op.clone(), ServerMode::Check).await;
        assert_eq!(checked.result.unwrap(), ServerSuccess::Checked(CheckResult::Happened));
        let done = account.run_server_op(move_op, ServerMode::Do).await;
        assert_eq!(done.result.unwrap(), ServerSuccess::Completed(None));

        let download = named(OpKind::DownloadBodyReps { message: namer("a/0/0") });
        let checked = account.run_server_op(download.clone(), ServerMode::Check).await;
        assert_eq!(checked.result.unwrap(), ServerSuccess::Checked(CheckResult::CheckedNotYet));
        // Nothing stored under that suid
        let gone = account.run_server_op(download, ServerMode::Do).await;
        assert_eq!(gone.result.unwrap_err(), ServerOpError::Moot);

        let append = named(OpKind::Append {
            folder_id: "a/0".to_string(),
            raw_messages: vec![],
        });
        let failed = account.run_server_op(append, ServerMode::Do).await;
        assert_eq!(failed.result.unwrap_err(), ServerOpError::FailureGiveUp);

        let send = named(OpKind::SendOutboxMessages {
            before_message: None,
            emit_notifications: false,
        });
        let sent = account.run_server_op(send, ServerMode::Do).await;
        assert_eq!(sent.result.unwrap(), ServerSuccess::Completed(Some(json!({ "sent": 0 }))));
    }

    #[tokio::test]
    async fn test_sync_inbox_then_grow() {
        let listing = || {
            vec![
                ("UIDL", "+OK\r\n1 u1\r\n2 u2\r\n3 u3\r\n.\r\n".to_string()),
                ("LIST", "+OK\r\n1 100\r\n2 100\r\n3 100\r\n.\r\n".to_string()),
            ]
        };
        let mut first = listing();
        first.push(("TOP 3 51", raw_message("third", "c")));
        first.push(("TOP 2 51", raw_message("second", "b")));
        first.push(("QUIT", "+OK bye\r\n".to_string()));
        let mut grow = listing();
        grow.push(("TOP 1 51", raw_message("first", "a")));
        grow.push(("QUIT", "+OK bye\r\n".to_string()));

        let connector = ScriptedConnector::with_sessions(vec![login(first), login(grow)]);
        let account = account(connector.clone());
        let pool = account.database().pool().clone();

        let summary = account.sync_inbox(false).await.unwrap();
        assert_eq!(summary.new_messages, 2);
        assert_eq!(summary.overflow, 1);
        assert!(summary.first_error.is_none());
        assert_eq!(
            pop3_state::known_uidls(&pool, "a").unwrap(),
            HashSet::from(["u2".to_string(), "u3".to_string()])
        );
        assert_eq!(pop3_state::overflow_uidls(&pool, "a").unwrap(), HashSet::from(["u1".to_string()]));

        let summary = account.sync_inbox(true).await.unwrap();
        assert_eq!(summary.new_messages, 1);
        assert_eq!(summary.overflow, 0);
        assert!(pop3_state::overflow_uidls(&pool, "a").unwrap().is_empty());

        let inbox = message_store::list_messages(&pool, "a/0").unwrap();
        let mut suids: Vec<_> = inbox.iter().map(|m| m.suid.as_str()).collect();
        suids.sort();
        assert_eq!(suids, vec!["a/0/0", "a/0/1", "a/0/2"]);
        let third = inbox.iter().find(|m| m.uidl.as_deref() == Some("u3")).unwrap();
        assert_eq!(third.header["subject"], "third");

        let sessions = connector.received().await;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn test_download_body_reps_stores_full_message() {
        let connector = ScriptedConnector::with_sessions(vec![login(vec![
            ("UIDL", "+OK\r\n1 abc\r\n.\r\n".to_string()),
            ("LIST", "+OK\r\n1 90\r\n.\r\n".to_string()),
            ("RETR 1", raw_message("full", "everything")),
            ("QUIT", "+OK bye\r\n".to_string()),
        ])]);
        let account = account(connector.clone());
        let pool = account.database().pool().clone();
        message_store::insert_message(&pool, &stored("a/0/0", Some("abc"))).unwrap();

        let op = named(OpKind::DownloadBodyReps { message: namer("a/0/0") });
        let outcome = account.run_server_op(op.clone(), ServerMode::Do).await;
        assert_eq!(outcome.result.unwrap(), ServerSuccess::Completed(None));
        account.all_operations_completed().await;

        let message = message_store::get_message(&pool, "a/0/0").unwrap().unwrap();
        assert_eq!(message.header["subject"], "full");
        assert!(is_fully_downloaded(message.body.as_ref().unwrap()));

        // Already complete, so no session is needed (none is left to hand out)
        let again = account.run_server_op(op, ServerMode::Do).await;
        assert_eq!(again.result.unwrap(), ServerSuccess::Completed(None));

        let sessions = connector.received().await;
        assert_eq!(sessions[0].last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn test_download_bodies_skips_large_messages() {
        let connector = ScriptedConnector::with_sessions(vec![login(vec![
            ("UIDL", "+OK\r\n1 small\r\n2 big\r\n.\r\n".to_string()),
            ("LIST", "+OK\r\n1 90\r\n2 900000\r\n.\r\n".to_string()),
            ("RETR 1", raw_message("small", "x")),
        ])]);
        let account = account(connector);
        let pool = account.database().pool().clone();
        message_store::insert_message(&pool, &stored("a/0/0", Some("small"))).unwrap();
        message_store::insert_message(&pool, &stored("a/0/1", Some("big"))).unwrap();

        let op = named(OpKind::DownloadBodies {
            messages: vec![namer("a/0/0"), namer("a/0/1")],
            max_size: Some(1000),
        });
        let outcome = account.run_server_op(op, ServerMode::Do).await;
        assert_eq!(
            outcome.result.unwrap(),
            ServerSuccess::Completed(Some(json!({ "downloaded": 1 })))
        );
        assert!(message_store::get_message(&pool, "a/0/1").unwrap().unwrap().body.is_none());
    }

    #[tokio::test]
    async fn test_connection_errors_map_to_server_errors() {
        let connector = ScriptedConnector::with_sessions(vec![vec![
            ("USER bob", "+OK\r\n".to_string()),
            ("PASS secret", "-ERR invalid password\r\n".to_string()),
        ]]);
        let account = account(connector);
        let pool = account.database().pool().clone();
        message_store::insert_message(&pool, &stored("a/0/0", Some("abc"))).unwrap();
        let op = named(OpKind::DownloadBodyReps { message: namer("a/0/0") });

        let rejected = account.run_server_op(op.clone(), ServerMode::Do).await;
        assert_eq!(rejected.result.unwrap_err(), ServerOpError::FailureGiveUp);

        // No sessions left: the connector refuses like an unreachable host
        let refused = account.run_server_op(op, ServerMode::Do).await;
        assert_eq!(refused.result.unwrap_err(), ServerOpError::Defer);
    }

    #[tokio::test]
    async fn test_state_round_trip_and_delete() {
        let account = account(ScriptedConnector::with_sessions(vec![]));
        let state = AccountOpState {
            next_mutation_num: 3,
            mutations: vec![named(OpKind::SyncFolderList)],
            deferred: vec![LongtermId::new("a", 1)],
        };
        account.save_account_state(state.clone(), "test").await.unwrap();
        let pool = account.database().pool().clone();
        assert_eq!(account_state::load_account_state(&pool, "a").unwrap(), Some(state));

        account.account_deleted();
        assert!(account_state::load_account_state(&pool, "a").unwrap().is_none());
        assert!(folders::list_folders(&pool, "a").unwrap().is_empty());
    }
}
