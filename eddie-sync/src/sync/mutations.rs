//! Mutation API
//!
//! One entry point per operation kind. Each builds the operation with the
//! initial statuses its kind needs and queues it on the owning account;
//! multi-message mutations are split per account first.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use super::engine::SyncEngine;
use super::operation::{
    DraftAttachment, LocalStatus, LongtermId, OpCallback, OpCompletion, OpError, OpKind, OpName,
    Operation, ServerStatus,
};
use crate::types::error::{EddieError, Result};
use crate::types::{account_id_for_id, FolderType, MessageNamer};

/// Combined outcome of a mutation that was split across accounts
#[derive(Debug, Clone, Default)]
pub struct BatchCompletion {
    /// First error reported by any part
    pub error: Option<OpError>,
    /// Old suid to new suid, merged across every part of a move
    pub move_map: BTreeMap<String, String>,
    pub ops: Vec<Operation>,
}

pub type BatchCallback = Box<dyn FnOnce(BatchCompletion) + Send + 'static>;

struct Batch {
    remaining: usize,
    completion: BatchCompletion,
    callback: Option<BatchCallback>,
}

impl Batch {
    fn absorb(&mut self, completion: OpCompletion) -> Option<(BatchCallback, BatchCompletion)> {
        if self.completion.error.is_none() {
            self.completion.error = completion.error;
        }
        if let OpKind::Move { move_map, .. } = &completion.op.kind {
            self.completion
                .move_map
                .extend(move_map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.completion.ops.push(completion.op);
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 {
            return None;
        }
        let callback = self.callback.take()?;
        Some((callback, std::mem::take(&mut self.completion)))
    }
}

/// One op callback per part; the caller's callback fires after the last one.
fn split_callback(callback: Option<BatchCallback>, parts: usize) -> Vec<Option<OpCallback>> {
    let Some(callback) = callback else {
        return (0..parts).map(|_| None).collect();
    };
    if parts == 0 {
        callback(BatchCompletion::default());
        return Vec::new();
    }

    let batch = Arc::new(Mutex::new(Batch {
        remaining: parts,
        completion: BatchCompletion::default(),
        callback: Some(callback),
    }));
    (0..parts)
        .map(|_| {
            let batch = batch.clone();
            let part: OpCallback = Box::new(move |completion| {
                let finished = batch
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .absorb(completion);
                if let Some((callback, combined)) = finished {
                    callback(combined);
                }
            });
            Some(part)
        })
        .collect()
}

/// Group messages by owning account, keeping first-seen order.
pub fn partition_by_account(messages: Vec<MessageNamer>) -> Vec<(String, Vec<MessageNamer>)> {
    let mut parts: Vec<(String, Vec<MessageNamer>)> = Vec::new();
    for message in messages {
        let account_id = message.account_id().to_string();
        match parts.iter_mut().find(|(id, _)| *id == account_id) {
            Some((_, batch)) => batch.push(message),
            None => parts.push((account_id, vec![message])),
        }
    }
    parts
}

impl SyncEngine {
    /// A fresh namer for a draft in `folder_id`; ids never repeat for one engine.
    pub fn next_draft_namer(&self, folder_id: &str) -> MessageNamer {
        let now = Utc::now().timestamp_millis();
        let id = self
            .last_draft_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .map_or(now, |last| now.max(last + 1));
        MessageNamer::new(format!("{}/{}", folder_id, id), now)
    }

    async fn enqueue_parts(
        &self,
        messages: Vec<MessageNamer>,
        callback: Option<BatchCallback>,
        build: impl Fn(Vec<MessageNamer>) -> Operation,
    ) -> Result<Vec<LongtermId>> {
        let parts = partition_by_account(messages);
        let callbacks = split_callback(callback, parts.len());
        let mut ids = Vec::with_capacity(parts.len());
        for ((account_id, messages), callback) in parts.into_iter().zip(callbacks) {
            ids.push(self.enqueue(&account_id, build(messages), callback).await?);
        }
        Ok(ids)
    }

    /// Move messages into `target_folder` of the same account.
    pub async fn move_messages(
        &self,
        messages: Vec<MessageNamer>,
        target_folder: &str,
        callback: Option<BatchCallback>,
    ) -> Result<Vec<LongtermId>> {
        let target_account = account_id_for_id(target_folder);
        if let Some(stray) = messages.iter().find(|m| m.account_id() != target_account) {
            return Err(EddieError::NotSupported(format!(
                "Cross-account move of {} to {}",
                stray.suid, target_folder
            )));
        }
        self.enqueue_parts(messages, callback, |messages| {
            Operation::new(
                OpKind::Move {
                    messages,
                    target_folder: target_folder.to_string(),
                    move_map: BTreeMap::new(),
                },
                OpName::Unnamed,
            )
            .with_folder(target_folder)
        })
        .await
    }

    pub async fn delete_messages(&self, messages: Vec<MessageNamer>) -> Result<Vec<LongtermId>> {
        self.enqueue_parts(messages, None, |messages| {
            Operation::new(OpKind::Delete { messages }, OpName::Unnamed)
        })
        .await
    }

    /// `human_op` names the user-facing action, e.g. "star" or "markRead".
    pub async fn modify_message_tags(
        &self,
        human_op: &str,
        messages: Vec<MessageNamer>,
        add_tags: Vec<String>,
        remove_tags: Vec<String>,
    ) -> Result<Vec<LongtermId>> {
        self.enqueue_parts(messages, None, |messages| {
            Operation::new(
                OpKind::ModTags {
                    messages,
                    add_tags: add_tags.clone(),
                    remove_tags: remove_tags.clone(),
                },
                OpName::Unnamed,
            )
            .with_human_op(human_op)
        })
        .await
    }

    pub async fn download_message_attachments(
        &self,
        message: MessageNamer,
        related_part_indices: Vec<usize>,
        attachment_indices: Vec<usize>,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId> {
        let account_id = message.account_id().to_string();
        let folder_id = message.folder_id().to_string();
        let op = Operation::new(
            OpKind::Download {
                message,
                related_part_indices,
                attachment_indices,
            },
            OpName::Unnamed,
        )
        .with_folder(folder_id);
        self.enqueue(&account_id, op, callback).await
    }

    /// Append raw RFC 2822 messages to a folder on the server.
    pub async fn append_messages(
        &self,
        folder_id: &str,
        raw_messages: Vec<String>,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId> {
        let op = Operation::new(
            OpKind::Append {
                folder_id: folder_id.to_string(),
                raw_messages,
            },
            OpName::Session,
        )
        .with_local_status(LocalStatus::Done)
        .with_folder(folder_id);
        self.enqueue(account_id_for_id(folder_id), op, callback).await
    }

    /// Store a copy of a sent message in the local sent folder.
    pub async fn save_sent_draft(
        &self,
        folder_id: &str,
        namer: MessageNamer,
        header: Value,
        body: Value,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId> {
        let op = Operation::new(
            OpKind::SaveSentDraft {
                folder_id: folder_id.to_string(),
                namer,
                header,
                body,
            },
            OpName::Unnamed,
        )
        .with_server_status(ServerStatus::NotApplicable)
        .with_folder(folder_id);
        self.enqueue(account_id_for_id(folder_id), op, callback).await
    }

    /// Save a draft, replacing `existing` if given. Returns the new draft's
    /// namer right away; the write itself happens in the local phase.
    pub async fn save_draft(
        &self,
        drafts_folder_id: &str,
        existing: Option<MessageNamer>,
        draft: Value,
        callback: Option<OpCallback>,
    ) -> Result<(LongtermId, MessageNamer)> {
        let namer = self.next_draft_namer(drafts_folder_id);
        let op = Operation::new(
            OpKind::SaveDraft {
                existing,
                namer: namer.clone(),
                draft,
            },
            OpName::Unnamed,
        )
        .with_server_status(ServerStatus::NotApplicable)
        .with_folder(drafts_folder_id);
        let id = self
            .enqueue(account_id_for_id(drafts_folder_id), op, callback)
            .await?;
        Ok((id, namer))
    }

    pub async fn delete_draft(&self, namer: MessageNamer, callback: Option<OpCallback>) -> Result<LongtermId> {
        let account_id = namer.account_id().to_string();
        let folder_id = namer.folder_id().to_string();
        let op = Operation::new(OpKind::DeleteDraft { namer, stash: None }, OpName::Unnamed)
            .with_server_status(ServerStatus::NotApplicable)
            .with_folder(folder_id);
        self.enqueue(&account_id, op, callback).await
    }

    pub async fn attach_blob_to_draft(
        &self,
        namer: MessageNamer,
        attachment: DraftAttachment,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId> {
        let account_id = namer.account_id().to_string();
        let op = Operation::new(OpKind::AttachBlobToDraft { namer, attachment }, OpName::Session)
            .with_server_status(ServerStatus::NotApplicable);
        self.enqueue(&account_id, op, callback).await
    }

    pub async fn detach_attachment_from_draft(
        &self,
        namer: MessageNamer,
        attachment_index: usize,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId> {
        let account_id = namer.account_id().to_string();
        let op = Operation::new(
            OpKind::DetachAttachmentFromDraft {
                namer,
                attachment_index,
            },
            OpName::Session,
        )
        .with_server_status(ServerStatus::NotApplicable);
        self.enqueue(&account_id, op, callback).await
    }

    /// Send queued outbox messages, optionally only those before `before_message`.
    pub async fn send_outbox_messages(
        &self,
        account_id: &str,
        before_message: Option<MessageNamer>,
        emit_notifications: bool,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId> {
        let op = Operation::new(
            OpKind::SendOutboxMessages {
                before_message,
                emit_notifications,
            },
            OpName::Session,
        )
        .with_local_status(LocalStatus::Done);
        self.enqueue(account_id, op, callback).await
    }

    pub async fn set_outbox_sync_enabled(
        &self,
        account_id: &str,
        enabled: bool,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId> {
        let op = Operation::new(OpKind::SetOutboxSyncEnabled { enabled }, OpName::Session)
            .with_server_status(ServerStatus::NotApplicable);
        self.enqueue(account_id, op, callback).await
    }

    pub async fn create_folder(
        &self,
        account_id: &str,
        parent_folder_id: Option<String>,
        folder_name: &str,
        folder_type: FolderType,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId> {
        let op = Operation::new(
            OpKind::CreateFolder {
                parent_folder_id,
                folder_name: folder_name.to_string(),
                folder_type,
                folder_id: None,
            },
            OpName::Unnamed,
        );
        self.enqueue(account_id, op, callback).await
    }

    pub async fn sync_folder_list(&self, account_id: &str, callback: Option<OpCallback>) -> Result<LongtermId> {
        let op = Operation::new(OpKind::SyncFolderList, OpName::Session)
            .with_local_status(LocalStatus::Done);
        self.enqueue(account_id, op, callback).await
    }

    /// Trim a folder back to its configured message count.
    pub async fn purge_excess_messages(&self, folder_id: &str, callback: Option<OpCallback>) -> Result<LongtermId> {
        let op = Operation::new(
            OpKind::PurgeExcessMessages {
                folder_id: folder_id.to_string(),
            },
            OpName::Session,
        )
        .with_server_status(ServerStatus::NotApplicable)
        .with_folder(folder_id);
        self.enqueue(account_id_for_id(folder_id), op, callback).await
    }

    pub async fn download_message_body_reps(
        &self,
        message: MessageNamer,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId> {
        let account_id = message.account_id().to_string();
        let folder_id = message.folder_id().to_string();
        let op = Operation::new(OpKind::DownloadBodyReps { message }, OpName::Session)
            .with_local_status(LocalStatus::Done)
            .with_folder(folder_id);
        self.enqueue(&account_id, op, callback).await
    }

    /// Download full bodies for messages up to `max_size` bytes each.
    pub async fn download_bodies(
        &self,
        messages: Vec<MessageNamer>,
        max_size: Option<usize>,
        callback: Option<BatchCallback>,
    ) -> Result<Vec<LongtermId>> {
        self.enqueue_parts(messages, callback, |messages| {
            Operation::new(OpKind::DownloadBodies { messages, max_size }, OpName::Session)
                .with_local_status(LocalStatus::Done)
        })
        .await
    }

    /// Migrate a folder's stored data after a schema change.
    pub async fn perform_folder_upgrade(&self, folder_id: &str, callback: Option<OpCallback>) -> Result<LongtermId> {
        let op = Operation::new(
            OpKind::UpgradeDb {
                folder_id: folder_id.to_string(),
            },
            OpName::Session,
        )
        .with_server_status(ServerStatus::NotApplicable)
        .with_folder(folder_id);
        self.enqueue(account_id_for_id(folder_id), op, callback).await
    }
}
