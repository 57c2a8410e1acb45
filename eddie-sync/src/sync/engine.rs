//! Operation engine
//!
//! Owns every loaded account's queues and runs their operations:
//! - Local phases always run before server phases for an account
//! - At most one phase per account is in flight; accounts run independently
//! - Completion state is saved before the operation's callback fires
//! - Deferred operations are replayed by one cross-account timer
//!
//! The engine is an actor. `SyncEngine` is a cloneable handle that sends
//! commands to a single tokio task; account phases and saves run as spawned
//! tasks that report back over the same channel, so every state transition
//! happens on the engine task one message at a time.

use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::account::{AccountOpState, LocalOutcome, MailAccount, ServerOutcome, ServerSuccess};
use super::operation::{
    CheckResult, Lifecycle, LocalMode, LocalOpError, LocalStatus, LongtermId, OpCallback,
    OpCompletion, OpError, OpKind, OpName, Operation, ServerMode, ServerOpError, ServerStatus,
};
use super::queue::AccountQueues;
use crate::config::SyncSettings;
use crate::types::error::EddieError;

/// Tuning for the engine
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub max_op_try_count: u32,
    /// Unclassified server errors burn this many tries at once
    pub op_unknown_error_try_count_increment: u32,
    pub deferred_op_delay: Duration,
    pub max_mutations_for_undo: usize,
    pub start_online: bool,
    pub start_interactive: bool,
    /// Never run local phases; used by tests that only exercise servers
    pub disable_local_ops: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_op_try_count: 10,
            op_unknown_error_try_count_increment: 5,
            deferred_op_delay: Duration::from_millis(30_000),
            max_mutations_for_undo: 10,
            start_online: true,
            start_interactive: false,
            disable_local_ops: false,
        }
    }
}

impl From<&SyncSettings> for EngineSettings {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_op_try_count: settings.max_op_try_count,
            op_unknown_error_try_count_increment: settings.op_unknown_error_try_count_increment,
            deferred_op_delay: Duration::from_millis(settings.deferred_op_delay_ms),
            max_mutations_for_undo: settings.max_mutations_for_undo,
            start_online: settings.start_online,
            start_interactive: settings.start_interactive,
            disable_local_ops: false,
        }
    }
}

/// Point-in-time copy of one account's queues
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub active: bool,
    pub local: Vec<LongtermId>,
    pub server: Vec<LongtermId>,
    pub deferred: Vec<LongtermId>,
    /// Persisted mutation history, oldest first
    pub history: Vec<Operation>,
    /// Every operation the engine still tracks, ordered by id
    pub ops: Vec<Operation>,
    pub next_mutation_num: u64,
}

impl QueueSnapshot {
    pub fn op(&self, id: &LongtermId) -> Option<&Operation> {
        self.ops.iter().find(|op| op.id() == Some(id))
    }
}

enum Command {
    LoadAccount {
        account: Arc<dyn MailAccount>,
        state: Option<AccountOpState>,
        reply: oneshot::Sender<Result<(), EddieError>>,
    },
    DeleteAccount {
        account_id: String,
        reply: oneshot::Sender<Result<(), EddieError>>,
    },
    Enqueue {
        account_id: String,
        op: Operation,
        callback: Option<OpCallback>,
        reply: oneshot::Sender<Result<LongtermId, EddieError>>,
    },
    Undo {
        ids: Vec<LongtermId>,
        reply: oneshot::Sender<Result<(), EddieError>>,
    },
    SetOnline(bool),
    SetInteractive(bool),
    WaitForAccountOps {
        account_id: String,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        account_id: String,
        reply: oneshot::Sender<Result<QueueSnapshot, EddieError>>,
    },
    AreServerJobsWaiting {
        account_id: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    LocalCompleted {
        account_id: String,
        epoch: u64,
        id: LongtermId,
        outcome: LocalOutcome,
    },
    ServerCompleted {
        account_id: String,
        epoch: u64,
        id: LongtermId,
        outcome: ServerOutcome,
    },
    SaveCommitted {
        account_id: String,
        epoch: u64,
        result: Result<(), EddieError>,
    },
    DeferredTimerFired,
}

/// Handle to the engine task
#[derive(Clone)]
pub struct SyncEngine {
    commands: flume::Sender<Command>,
    /// Last draft id handed out, shared by every clone of this handle
    pub(super) last_draft_id: Arc<AtomicI64>,
}

impl SyncEngine {
    /// Spawn the engine task. Must be called inside a tokio runtime.
    pub fn start(settings: EngineSettings) -> Self {
        let (tx, rx) = flume::unbounded();
        let engine = Engine::new(settings, tx.downgrade());
        tokio::spawn(engine.run(rx));
        Self {
            commands: tx,
            last_draft_id: Arc::new(AtomicI64::new(0)),
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EddieError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send_async(make(tx))
            .await
            .map_err(|_| EddieError::EngineStopped)?;
        rx.await.map_err(|_| EddieError::EngineStopped)
    }

    fn send(&self, command: Command) -> Result<(), EddieError> {
        self.commands.send(command).map_err(|_| EddieError::EngineStopped)
    }

    /// Register an account and resume its persisted mutations.
    pub async fn load_account(
        &self,
        account: Arc<dyn MailAccount>,
        state: Option<AccountOpState>,
    ) -> Result<(), EddieError> {
        self.request(|reply| Command::LoadAccount { account, state, reply })
            .await?
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<(), EddieError> {
        let account_id = account_id.to_string();
        self.request(|reply| Command::DeleteAccount { account_id, reply })
            .await?
    }

    /// Queue an operation and return its id.
    pub async fn enqueue(
        &self,
        account_id: &str,
        op: Operation,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId, EddieError> {
        let account_id = account_id.to_string();
        self.request(|reply| Command::Enqueue {
            account_id,
            op,
            callback,
            reply,
        })
        .await?
    }

    /// Undo persisted mutations. Undoing twice is a no-op; an id the engine
    /// does not track fails with `OperationNotFound`.
    pub async fn undo(&self, ids: Vec<LongtermId>) -> Result<(), EddieError> {
        self.request(|reply| Command::Undo { ids, reply }).await?
    }

    pub fn set_online(&self, online: bool) -> Result<(), EddieError> {
        self.send(Command::SetOnline(online))
    }

    /// Interactive mode lets deferred operations replay.
    pub fn set_interactive(&self, interactive: bool) -> Result<(), EddieError> {
        self.send(Command::SetInteractive(interactive))
    }

    /// Resolve once the account has nothing it can run right now.
    pub async fn wait_for_account_ops(&self, account_id: &str) -> Result<(), EddieError> {
        let account_id = account_id.to_string();
        self.request(|reply| Command::WaitForAccountOps { account_id, reply })
            .await
    }

    pub async fn are_server_jobs_waiting(&self, account_id: &str) -> Result<bool, EddieError> {
        let account_id = account_id.to_string();
        self.request(|reply| Command::AreServerJobsWaiting { account_id, reply })
            .await
    }

    pub async fn snapshot(&self, account_id: &str) -> Result<QueueSnapshot, EddieError> {
        let account_id = account_id.to_string();
        self.request(|reply| Command::Snapshot { account_id, reply })
            .await?
    }

    /// Stop the engine once in-flight saves have committed.
    pub async fn shutdown(&self) -> Result<(), EddieError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct AccountRuntime {
    account: Arc<dyn MailAccount>,
    /// Distinguishes a reloaded account from a deleted one with the same id
    epoch: u64,
    queues: AccountQueues,
    ops: HashMap<LongtermId, Operation>,
    history: Vec<LongtermId>,
    next_mutation_num: u64,
    callbacks: HashMap<LongtermId, OpCallback>,
    waiters: Vec<oneshot::Sender<()>>,
    /// Completion held back until the pending save commits
    after_save: Option<(Option<OpCallback>, OpCompletion)>,
}

impl AccountRuntime {
    fn new(account: Arc<dyn MailAccount>, epoch: u64) -> Self {
        Self {
            account,
            epoch,
            queues: AccountQueues::new(),
            ops: HashMap::new(),
            history: Vec::new(),
            next_mutation_num: 0,
            callbacks: HashMap::new(),
            waiters: Vec::new(),
            after_save: None,
        }
    }

    fn op_state(&self) -> AccountOpState {
        AccountOpState {
            next_mutation_num: self.next_mutation_num,
            mutations: self
                .history
                .iter()
                .filter_map(|id| self.ops.get(id).cloned())
                .collect(),
            deferred: self.queues.deferred.clone(),
        }
    }

    fn allocate_id(&mut self) -> LongtermId {
        let id = LongtermId::new(self.account.id(), self.next_mutation_num);
        self.next_mutation_num += 1;
        id
    }

    /// Drop the oldest finished mutations past the undo limit.
    fn trim_history(&mut self, cap: usize) {
        while self.history.len() > cap {
            let eligible = self.history.iter().position(|id| {
                self.ops.get(id).map_or(true, |op| op.is_terminal())
            });
            let Some(idx) = eligible else {
                break;
            };
            let id = self.history.remove(idx);
            if !self.queues.references(&id) && !self.callbacks.contains_key(&id) {
                self.ops.remove(&id);
            }
        }
    }

    fn is_idle(&self, online: bool) -> bool {
        !self.queues.active
            && self.queues.local.is_empty()
            && (self.queues.server.is_empty() || !online || !self.account.enabled())
    }
}

enum Dispatch {
    None,
    Local(LongtermId),
    Server(LongtermId),
}

struct Engine {
    settings: EngineSettings,
    accounts: HashMap<String, AccountRuntime>,
    /// Load order, for deterministic resume
    account_order: Vec<String>,
    online: bool,
    interactive: bool,
    deferred_timer_armed: bool,
    next_epoch: u64,
    saves_in_flight: usize,
    shutdown_reply: Option<oneshot::Sender<()>>,
    self_tx: flume::WeakSender<Command>,
}

impl Engine {
    fn new(settings: EngineSettings, self_tx: flume::WeakSender<Command>) -> Self {
        Self {
            settings,
            accounts: HashMap::new(),
            account_order: Vec::new(),
            online: settings.start_online,
            interactive: settings.start_interactive,
            deferred_timer_armed: false,
            next_epoch: 0,
            saves_in_flight: 0,
            shutdown_reply: None,
            self_tx,
        }
    }

    async fn run(mut self, commands: flume::Receiver<Command>) {
        info!("Sync engine started (online: {}, interactive: {})", self.online, self.interactive);
        while let Ok(command) = commands.recv_async().await {
            if !self.handle(command) {
                break;
            }
        }
        info!("Sync engine stopped");
    }

    /// Returns false when the engine should stop.
    fn handle(&mut self, command: Command) -> bool {
        if self.shutdown_reply.is_some() {
            // Only save commits matter once shutdown has been requested.
            let Command::SaveCommitted { .. } = command else {
                return true;
            };
            self.saves_in_flight = self.saves_in_flight.saturating_sub(1);
            if self.saves_in_flight == 0 {
                if let Some(reply) = self.shutdown_reply.take() {
                    let _ = reply.send(());
                }
                return false;
            }
            return true;
        }

        match command {
            Command::LoadAccount { account, state, reply } => {
                let _ = reply.send(self.load_account(account, state));
            }
            Command::DeleteAccount { account_id, reply } => {
                let _ = reply.send(self.delete_account(&account_id));
            }
            Command::Enqueue {
                account_id,
                op,
                callback,
                reply,
            } => {
                let _ = reply.send(self.enqueue(&account_id, op, callback));
            }
            Command::Undo { ids, reply } => {
                let _ = reply.send(self.undo(ids));
            }
            Command::SetOnline(online) => self.set_online(online),
            Command::SetInteractive(interactive) => {
                info!("Sync engine mode: {}", if interactive { "interactive" } else { "background" });
                self.interactive = interactive;
            }
            Command::WaitForAccountOps { account_id, reply } => {
                let online = self.online;
                match self.accounts.get_mut(&account_id) {
                    Some(rt) if !rt.is_idle(online) => rt.waiters.push(reply),
                    _ => {
                        let _ = reply.send(());
                    }
                }
            }
            Command::Snapshot { account_id, reply } => {
                let _ = reply.send(self.snapshot(&account_id));
            }
            Command::AreServerJobsWaiting { account_id, reply } => {
                let waiting = self.accounts.get(&account_id).map_or(false, |rt| {
                    rt.account.enabled() && !rt.queues.server.is_empty()
                });
                let _ = reply.send(waiting);
            }
            Command::Shutdown { reply } => {
                if self.saves_in_flight == 0 {
                    let _ = reply.send(());
                    return false;
                }
                info!("Sync engine shutting down after {} pending saves", self.saves_in_flight);
                self.shutdown_reply = Some(reply);
            }
            Command::LocalCompleted {
                account_id,
                epoch,
                id,
                outcome,
            } => self.on_local_completed(account_id, epoch, id, outcome),
            Command::ServerCompleted {
                account_id,
                epoch,
                id,
                outcome,
            } => self.on_server_completed(account_id, epoch, id, outcome),
            Command::SaveCommitted {
                account_id,
                epoch,
                result,
            } => {
                self.saves_in_flight = self.saves_in_flight.saturating_sub(1);
                self.on_save_committed(account_id, epoch, result);
            }
            Command::DeferredTimerFired => self.on_deferred_timer(),
        }
        true
    }

    fn runtime(&mut self, account_id: &str, epoch: u64) -> Option<&mut AccountRuntime> {
        self.accounts
            .get_mut(account_id)
            .filter(|rt| rt.epoch == epoch)
    }

    fn load_account(
        &mut self,
        account: Arc<dyn MailAccount>,
        state: Option<AccountOpState>,
    ) -> Result<(), EddieError> {
        let account_id = account.id().to_string();
        if self.accounts.contains_key(&account_id) {
            return Err(EddieError::InvalidInput(format!("Account {} is already loaded", account_id)));
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let mut rt = AccountRuntime::new(account, epoch);

        let mut resume = Vec::new();
        if let Some(state) = state {
            rt.next_mutation_num = state.next_mutation_num;
            for mut op in state.mutations {
                let Some(id) = op.id().cloned() else {
                    warn!("Skipping unnamed persisted op {} for {}", op.kind.type_str(), account_id);
                    continue;
                };
                rt.next_mutation_num = rt.next_mutation_num.max(id.num + 1);
                if !op.is_terminal() {
                    // Whether the server saw it is unknown; verify first.
                    op.server_status = Some(ServerStatus::Check);
                    resume.push(id.clone());
                }
                rt.history.push(id.clone());
                rt.ops.insert(id, op);
            }
            let orphans = state
                .deferred
                .iter()
                .filter(|id| !rt.ops.contains_key(*id))
                .count();
            if orphans > 0 {
                warn!("Dropping {} deferred ids with no persisted op for {}", orphans, account_id);
            }
        }

        info!(
            account_id = %account_id,
            "Loaded account with {} mutations, resuming {}",
            rt.history.len(),
            resume.len()
        );
        self.accounts.insert(account_id.clone(), rt);
        self.account_order.push(account_id.clone());

        for id in resume {
            self.queue_op(&account_id, id);
        }
        Ok(())
    }

    fn delete_account(&mut self, account_id: &str) -> Result<(), EddieError> {
        let mut rt = self
            .accounts
            .remove(account_id)
            .ok_or_else(|| EddieError::AccountNotFound(account_id.to_string()))?;
        self.account_order.retain(|id| id != account_id);

        for waiter in rt.waiters.drain(..) {
            let _ = waiter.send(());
        }
        if std::panic::catch_unwind(AssertUnwindSafe(|| rt.account.account_deleted())).is_err() {
            error!("account_deleted panicked for {}", account_id);
        }
        info!(
            account_id = %account_id,
            "Deleted account, dropping {} queued ops and {} callbacks",
            rt.queues.local.len() + rt.queues.server.len(),
            rt.callbacks.len()
        );
        Ok(())
    }

    fn enqueue(
        &mut self,
        account_id: &str,
        mut op: Operation,
        callback: Option<OpCallback>,
    ) -> Result<LongtermId, EddieError> {
        let cap = self.settings.max_mutations_for_undo;
        let rt = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| EddieError::AccountNotFound(account_id.to_string()))?;

        // Moves that never leave local-only folders have no server phase.
        if let OpKind::Move {
            messages,
            target_folder,
            ..
        } = &op.kind
        {
            let local_only = rt.account.is_local_only_folder(target_folder)
                && messages
                    .iter()
                    .all(|m| rt.account.is_local_only_folder(m.folder_id()));
            if local_only && op.server_status.is_none() {
                op.server_status = Some(ServerStatus::NotApplicable);
            }
        }

        let id = match &op.longterm_id {
            OpName::Unnamed => {
                let id = rt.allocate_id();
                op.longterm_id = OpName::Named(id.clone());
                rt.history.push(id.clone());
                id
            }
            OpName::Session => {
                let id = rt.allocate_id();
                op.longterm_id = OpName::Named(id.clone());
                id
            }
            OpName::Named(id) if id.account == account_id => id.clone(),
            OpName::Named(id) => {
                return Err(EddieError::InvalidInput(format!(
                    "Op {} does not belong to account {}",
                    id, account_id
                )))
            }
        };

        debug!(account_id = %account_id, op = %id, "Enqueue {}", op.kind.type_str());
        rt.ops.insert(id.clone(), op);
        if let Some(callback) = callback {
            rt.callbacks.insert(id.clone(), callback);
        }
        rt.trim_history(cap);

        self.queue_op(account_id, id.clone());
        Ok(id)
    }

    /// Put an already-registered op on the queues it needs and maybe start it.
    fn queue_op(&mut self, account_id: &str, id: LongtermId) {
        let disable_local = self.settings.disable_local_ops;
        let online = self.online;
        let Some(rt) = self.accounts.get_mut(account_id) else {
            return;
        };
        let Some(op) = rt.ops.get(&id) else {
            warn!(account_id = %account_id, op = %id, "Cannot queue unknown op");
            return;
        };

        let wants_local = !disable_local
            && match (op.lifecycle, op.local_status) {
                (Lifecycle::Do, None) => true,
                (Lifecycle::Undo, status) => {
                    !matches!(status, Some(LocalStatus::Undone) | Some(LocalStatus::Unknown))
                }
                _ => false,
            };
        let wants_server = !matches!(
            op.server_status,
            Some(ServerStatus::NotApplicable) | Some(ServerStatus::Moot)
        );

        debug!(
            account_id = %account_id,
            op = %id,
            "queueOp pre-queues: local {} server {}",
            rt.queues.local.len(),
            rt.queues.server.len()
        );

        if wants_local {
            rt.queues.local.push_back(id.clone());
        }
        if wants_server && !rt.queues.in_server(&id) {
            rt.queues.server.push_back(id.clone());
        }

        let next = if rt.queues.active {
            Dispatch::None
        } else if !rt.queues.local.is_empty() {
            // Only start it if nothing else is waiting ahead of it.
            if rt.queues.local.len() == 1 && rt.queues.local_head() == Some(&id) {
                Dispatch::Local(id)
            } else {
                Dispatch::None
            }
        } else if rt.queues.server.len() == 1
            && rt.queues.server_head() == Some(&id)
            && online
            && rt.account.enabled()
        {
            Dispatch::Server(id)
        } else {
            Dispatch::None
        };

        let started = match next {
            Dispatch::None => true,
            Dispatch::Local(id) => self.dispatch_local(account_id, &id),
            Dispatch::Server(id) => self.dispatch_server(account_id, &id),
        };
        if !started {
            self.advance(account_id);
        }
    }

    /// Every known id is undone even when some are not; the first unknown
    /// one is reported.
    fn undo(&mut self, ids: Vec<LongtermId>) -> Result<(), EddieError> {
        let mut missing = None;
        for id in ids {
            let Some(rt) = self.accounts.get_mut(&id.account) else {
                warn!(op = %id, "Cannot undo op for unknown account");
                missing.get_or_insert_with(|| id.to_string());
                continue;
            };
            if !rt.history.contains(&id) {
                warn!(op = %id, "Cannot undo op outside the mutation history");
                missing.get_or_insert_with(|| id.to_string());
                continue;
            }
            let active = rt.queues.active;
            let local_head = rt.queues.local_head().cloned();
            let server_head = rt.queues.server_head().cloned();
            let Some(op) = rt.ops.get_mut(&id) else {
                missing.get_or_insert_with(|| id.to_string());
                continue;
            };

            match op.lifecycle {
                Lifecycle::Undo | Lifecycle::Undone | Lifecycle::Moot => continue,
                Lifecycle::Done => {
                    op.lifecycle = Lifecycle::Undo;
                }
                Lifecycle::Do => {
                    let running_local = active
                        && local_head.as_ref() == Some(&id)
                        && op.local_status == Some(LocalStatus::Doing);
                    let running_server = active
                        && server_head.as_ref() == Some(&id)
                        && op.server_status.map_or(false, |s| s.is_running());

                    if !running_local && rt.queues.in_local(&id) {
                        // Never ran; just forget it.
                        op.lifecycle = Lifecycle::Undone;
                        rt.queues.remove_from_local(&id);
                        rt.queues.remove_from_server(&id);
                        rt.queues.deferred.retain(|d| d != &id);
                        rt.callbacks.remove(&id);
                        info!(op = %id, "Undid op before it ran");
                        continue;
                    }

                    op.lifecycle = Lifecycle::Undo;
                    if op.server_status.is_none() && !running_server {
                        // The server never saw it, so only the local side needs undoing.
                        op.server_status = Some(ServerStatus::NotApplicable);
                        rt.queues.remove_from_server(&id);
                        rt.queues.deferred.retain(|d| d != &id);
                    }
                }
            }

            info!(op = %id, "Queueing undo");
            self.queue_op(&id.account.clone(), id);
        }

        match missing {
            Some(id) => Err(EddieError::OperationNotFound(id)),
            None => Ok(()),
        }
    }

    fn set_online(&mut self, online: bool) {
        let was_online = self.online;
        self.online = online;
        info!(
            "Sync engine is {} and previously was {}",
            if online { "online" } else { "offline" },
            if was_online { "online" } else { "offline" }
        );

        if !was_online && online {
            for account_id in self.account_order.clone() {
                self.resume(&account_id);
            }
        }
    }

    /// Restart a server queue stalled by being offline.
    fn resume(&mut self, account_id: &str) {
        let Some(rt) = self.accounts.get(account_id) else {
            return;
        };
        if !rt.account.enabled() || rt.queues.active || !rt.queues.local.is_empty() {
            return;
        }
        let Some(head) = rt.queues.server_head().cloned() else {
            return;
        };
        let running = rt
            .ops
            .get(&head)
            .and_then(|op| op.server_status)
            .map_or(false, |s| s.is_running());
        if !running {
            debug!(account_id = %account_id, op = %head, "Resuming server queue");
            if !self.dispatch_server(account_id, &head) {
                self.advance(account_id);
            }
        }
    }

    /// Returns false if the op could not be started and was dropped.
    fn dispatch_local(&mut self, account_id: &str, id: &LongtermId) -> bool {
        let tx = self.self_tx.clone();
        let Some(rt) = self.accounts.get_mut(account_id) else {
            return false;
        };
        let Some(op) = rt.ops.get_mut(id) else {
            warn!(account_id = %account_id, op = %id, "Dropping unknown op from the local queue");
            rt.queues.pop_local(id);
            return false;
        };

        let mode = match op.lifecycle {
            Lifecycle::Do => {
                op.local_status = Some(LocalStatus::Doing);
                LocalMode::Do
            }
            Lifecycle::Undo => {
                op.local_status = Some(LocalStatus::Undoing);
                LocalMode::Undo
            }
            other => {
                error!(op = %id, "Illegal lifecycle {:?} for local op", other);
                rt.queues.pop_local(id);
                return false;
            }
        };

        rt.queues.active = true;
        debug!(account_id = %account_id, op = %id, mode = ?mode, "runOp_begin {}", op.kind.type_str());

        let account = rt.account.clone();
        let epoch = rt.epoch;
        let op = op.clone();
        let account_id = account_id.to_string();
        let id = id.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(account.run_local_op(op, mode)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(op = %id, "Local op panicked");
                    LocalOutcome::err(LocalOpError::Other("panicked".to_string()))
                }
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::LocalCompleted {
                    account_id,
                    epoch,
                    id,
                    outcome,
                });
            }
        });
        true
    }

    fn dispatch_server(&mut self, account_id: &str, id: &LongtermId) -> bool {
        let tx = self.self_tx.clone();
        let Some(rt) = self.accounts.get_mut(account_id) else {
            return false;
        };
        let Some(op) = rt.ops.get_mut(id) else {
            warn!(account_id = %account_id, op = %id, "Dropping unknown op from the server queue");
            rt.queues.remove_from_server(id);
            return false;
        };

        let mode = if op.server_status == Some(ServerStatus::Check) {
            ServerMode::Check
        } else {
            match op.lifecycle {
                Lifecycle::Do => ServerMode::Do,
                Lifecycle::Undo => ServerMode::Undo,
                other => {
                    warn!(op = %id, "Dropping op with lifecycle {:?} from the server queue", other);
                    rt.queues.remove_from_server(id);
                    return false;
                }
            }
        };
        op.server_status = Some(match mode {
            ServerMode::Do => ServerStatus::Doing,
            ServerMode::Undo => ServerStatus::Undoing,
            ServerMode::Check => ServerStatus::Checking,
        });

        rt.queues.active = true;
        debug!(account_id = %account_id, op = %id, mode = ?mode, "runOp_begin {}", op.kind.type_str());

        let account = rt.account.clone();
        let epoch = rt.epoch;
        let op = op.clone();
        let account_id = account_id.to_string();
        let id = id.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(account.run_server_op(op, mode)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(op = %id, "Server op panicked");
                    ServerOutcome::err(ServerOpError::Other("panicked".to_string()))
                }
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::ServerCompleted {
                    account_id,
                    epoch,
                    id,
                    outcome,
                });
            }
        });
        true
    }

    fn on_local_completed(&mut self, account_id: String, epoch: u64, id: LongtermId, outcome: LocalOutcome) {
        let max_tries = self.settings.max_op_try_count;
        let Some(rt) = self.runtime(&account_id, epoch) else {
            debug!(account_id = %account_id, op = %id, "Ignoring local completion for unloaded account");
            return;
        };
        rt.queues.pop_local(&id);
        let Some(op) = rt.ops.get_mut(&id) else {
            warn!(account_id = %account_id, op = %id, "Local completion for unknown op");
            self.advance(&account_id);
            return;
        };

        let was_mode = op.local_status;
        if let Some(kind) = outcome.kind {
            op.kind = kind;
        }

        let mut remove_from_server = false;
        let mut complete = false;
        let mut defer = false;
        let mut save = outcome.save_suggested;

        let (error, result) = match outcome.result {
            Ok(value) => {
                if outcome.skip_server {
                    op.server_status = Some(ServerStatus::Skip);
                }
                // (lifecycle this phase served, lifecycle once it is finished)
                let phase = match op.local_status {
                    Some(LocalStatus::Doing) => {
                        op.local_status = Some(LocalStatus::Done);
                        Some((Lifecycle::Do, Lifecycle::Done))
                    }
                    Some(LocalStatus::Undoing) => {
                        op.local_status = Some(LocalStatus::Undone);
                        Some((Lifecycle::Undo, Lifecycle::Undone))
                    }
                    other => {
                        warn!(op = %id, "Local completion with status {:?}", other);
                        None
                    }
                };
                if let Some((served, finished)) = phase {
                    if op.server_status == Some(ServerStatus::Skip) {
                        remove_from_server = true;
                        op.server_status = Some(ServerStatus::NotApplicable);
                        save = true;
                    }
                    // An undo queued while `do` ran leaves the lifecycle alone.
                    if op.server_status == Some(ServerStatus::NotApplicable) && op.lifecycle == served {
                        op.lifecycle = finished;
                        complete = true;
                    }
                }
                (None, value)
            }
            Err(err) => {
                // Errors never save.
                save = false;
                let mut retry = false;
                if err == LocalOpError::Defer {
                    op.try_count += 1;
                    retry = op.try_count < max_tries;
                }
                if retry {
                    info!(op = %id, "Local op deferred (try {})", op.try_count);
                    op.local_status = match op.local_status {
                        Some(LocalStatus::Doing) => None,
                        Some(LocalStatus::Undoing) => Some(LocalStatus::Done),
                        other => other,
                    };
                    defer = true;
                } else {
                    warn!(op = %id, "Local op gave up: {}", err);
                    op.lifecycle = Lifecycle::Moot;
                    op.local_status = Some(LocalStatus::Unknown);
                    op.server_status = Some(ServerStatus::Moot);
                    complete = true;
                }
                remove_from_server = true;
                (Some(OpError::Local(err)), None)
            }
        };

        debug!(
            account_id = %account_id,
            op = %id,
            mode = ?was_mode,
            error = ?error,
            "runOp_end {}",
            op.kind.type_str()
        );

        let label = format!("localOp:{}", op.kind.type_str());
        let completion = OpCompletion {
            error,
            result,
            op: op.clone(),
        };
        if remove_from_server {
            rt.queues.remove_from_server(&id);
        }
        if defer {
            rt.queues.deferred.push(id.clone());
        }
        let callback = if complete { rt.callbacks.remove(&id) } else { None };

        if defer {
            self.arm_deferred_timer();
        }
        if save {
            self.save_then_continue(&account_id, label, callback, completion);
        } else {
            self.start_next_op(&account_id, callback, completion);
        }
    }

    fn on_server_completed(&mut self, account_id: String, epoch: u64, id: LongtermId, outcome: ServerOutcome) {
        let settings = self.settings;
        let Some(rt) = self.runtime(&account_id, epoch) else {
            debug!(account_id = %account_id, op = %id, "Ignoring server completion for unloaded account");
            return;
        };
        if rt.queues.server_head() != Some(&id) {
            warn!(op = %id, "Completed server op is not the server queue head");
        }
        let Some(op) = rt.ops.get_mut(&id) else {
            warn!(account_id = %account_id, op = %id, "Server completion for unknown op");
            rt.queues.remove_from_server(&id);
            self.advance(&account_id);
            return;
        };

        let was_status = op.server_status;
        if let Some(kind) = outcome.kind {
            op.kind = kind;
        }

        let mut maybe_retry = false;
        let mut consume = true;
        let mut complete = true;
        let mut defer = false;

        let (error, result) = match outcome.result {
            Err(err) => {
                match &err {
                    ServerOpError::Defer => {
                        op.try_count += 1;
                        if op.try_count < settings.max_op_try_count {
                            // Only a pending `do` is worth retrying later.
                            if was_status == Some(ServerStatus::Doing) && op.lifecycle == Lifecycle::Do {
                                info!(op = %id, "Server op deferred (try {})", op.try_count);
                                op.server_status = None;
                                defer = true;
                            }
                            complete = false;
                        } else {
                            moot(op);
                        }
                    }
                    ServerOpError::AbortedRetry => {
                        op.try_count += 1;
                        maybe_retry = true;
                    }
                    ServerOpError::Other(_) => {
                        op.try_count += settings.op_unknown_error_try_count_increment;
                        maybe_retry = true;
                    }
                    ServerOpError::FailureGiveUp => {
                        warn!(op = %id, "Server op gave up");
                        moot(op);
                    }
                    ServerOpError::Moot => {
                        info!(op = %id, "Server op is moot");
                        moot(op);
                    }
                }
                (Some(OpError::Server(err)), None)
            }
            Ok(success) => {
                let mut result = None;
                let mut bailed = false;
                match (was_status, success) {
                    (Some(ServerStatus::Checking), ServerSuccess::Checked(check)) => match check {
                        CheckResult::CheckedNotYet | CheckResult::CoherentNotYet => {
                            op.server_status = None;
                        }
                        CheckResult::Idempotent => {
                            op.server_status = match op.lifecycle {
                                Lifecycle::Do | Lifecycle::Done => None,
                                _ => Some(ServerStatus::Done),
                            };
                        }
                        CheckResult::Happened => match op.lifecycle {
                            Lifecycle::Undo => {
                                op.server_status = Some(ServerStatus::Undone);
                                op.lifecycle = Lifecycle::Undone;
                            }
                            Lifecycle::Do => {
                                op.server_status = Some(ServerStatus::Done);
                                op.lifecycle = Lifecycle::Done;
                            }
                            _ => op.server_status = Some(ServerStatus::Done),
                        },
                        CheckResult::Moot => moot(op),
                        CheckResult::Bailed => {
                            // Same as a defer, but verify again on replay.
                            info!(op = %id, "Server check bailed; deferring");
                            op.server_status = Some(ServerStatus::Check);
                            defer = true;
                            bailed = true;
                            complete = false;
                        }
                    },
                    (Some(ServerStatus::Checking), ServerSuccess::Completed(_)) => {
                        warn!(op = %id, "Check returned a completion instead of a check result");
                        op.server_status = None;
                    }
                    (Some(ServerStatus::Doing), success) => {
                        op.server_status = Some(ServerStatus::Done);
                        if op.lifecycle == Lifecycle::Do {
                            op.lifecycle = Lifecycle::Done;
                        }
                        if let ServerSuccess::Completed(value) = success {
                            result = value;
                        }
                    }
                    (Some(ServerStatus::Undoing), success) => {
                        op.server_status = Some(ServerStatus::Undone);
                        if op.lifecycle == Lifecycle::Undo {
                            op.lifecycle = Lifecycle::Undone;
                        }
                        if let ServerSuccess::Completed(value) = success {
                            result = value;
                        }
                    }
                    (other, _) => {
                        warn!(op = %id, "Server completion with status {:?}", other);
                    }
                }
                // Still wants to run: leave it at the head.
                if matches!(op.lifecycle, Lifecycle::Do | Lifecycle::Undo) {
                    consume = false;
                }
                if bailed {
                    consume = true;
                }
                (None, result)
            }
        };

        if maybe_retry {
            if op.try_count < settings.max_op_try_count {
                // Verify before retrying for real.
                op.server_status = Some(ServerStatus::Check);
                consume = false;
            } else {
                warn!(op = %id, "Server op reached the try limit");
                moot(op);
            }
        }

        debug!(
            account_id = %account_id,
            op = %id,
            mode = ?was_status,
            error = ?error,
            "runOp_end {}",
            op.kind.type_str()
        );

        let label = format!("serverOp:{}", op.kind.type_str());
        let completion = OpCompletion {
            error,
            result,
            op: op.clone(),
        };
        if consume {
            rt.queues.remove_from_server(&id);
        }
        if defer {
            rt.queues.deferred.push(id.clone());
        }
        let callback = if complete { rt.callbacks.remove(&id) } else { None };

        if defer {
            self.arm_deferred_timer();
        }
        if complete && outcome.save_suggested {
            self.save_then_continue(&account_id, label, callback, completion);
        } else {
            self.start_next_op(&account_id, callback, completion);
        }
    }

    fn save_then_continue(
        &mut self,
        account_id: &str,
        label: String,
        callback: Option<OpCallback>,
        completion: OpCompletion,
    ) {
        let tx = self.self_tx.clone();
        let Some(rt) = self.accounts.get_mut(account_id) else {
            return;
        };
        let state = rt.op_state();
        rt.after_save = Some((callback, completion));
        let account = rt.account.clone();
        let epoch = rt.epoch;
        self.saves_in_flight += 1;

        let account_id = account_id.to_string();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(account.save_account_state(state, &label))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => Err(EddieError::Other("save panicked".to_string())),
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::SaveCommitted {
                    account_id,
                    epoch,
                    result,
                });
            }
        });
    }

    fn on_save_committed(&mut self, account_id: String, epoch: u64, result: Result<(), EddieError>) {
        let Some(rt) = self.runtime(&account_id, epoch) else {
            return;
        };
        if let Err(e) = result {
            error!(account_id = %account_id, "Failed to save account state: {}", e);
        }
        let Some((callback, completion)) = rt.after_save.take() else {
            warn!(account_id = %account_id, "Save committed with nothing waiting on it");
            return;
        };
        self.start_next_op(&account_id, callback, completion);
    }

    /// Notify the finished op's listener, then run whatever is next.
    fn start_next_op(&mut self, account_id: &str, callback: Option<OpCallback>, completion: OpCompletion) {
        let id = completion.op.id().cloned();
        let terminal = completion.op.is_terminal();

        if let Some(callback) = callback {
            let op_type = completion.op.kind.type_str();
            if std::panic::catch_unwind(AssertUnwindSafe(move || callback(completion))).is_err() {
                error!(account_id = %account_id, "Callback for {} op panicked", op_type);
            }
        }

        let Some(rt) = self.accounts.get_mut(account_id) else {
            return;
        };
        if let (true, Some(id)) = (terminal, id) {
            let forgettable = !rt.history.contains(&id)
                && !rt.queues.references(&id)
                && !rt.callbacks.contains_key(&id);
            if forgettable {
                rt.ops.remove(&id);
            }
        }

        self.advance(account_id);
    }

    fn advance(&mut self, account_id: &str) {
        let online = self.online;
        loop {
            let Some(rt) = self.accounts.get_mut(account_id) else {
                return;
            };
            rt.queues.active = false;

            if let Some(id) = rt.queues.local_head().cloned() {
                if self.dispatch_local(account_id, &id) {
                    return;
                }
                continue;
            }
            if online && rt.account.enabled() {
                if let Some(id) = rt.queues.server_head().cloned() {
                    if self.dispatch_server(account_id, &id) {
                        return;
                    }
                    continue;
                }
            }

            self.all_ops_completed(account_id);
            return;
        }
    }

    fn all_ops_completed(&mut self, account_id: &str) {
        let Some(rt) = self.accounts.get_mut(account_id) else {
            return;
        };
        for waiter in rt.waiters.drain(..) {
            let _ = waiter.send(());
        }
        debug!(account_id = %account_id, "All ops completed");

        // After the listeners, so they can queue more work on a warm connection.
        let account = rt.account.clone();
        let account_id = account_id.to_string();
        tokio::spawn(async move {
            if AssertUnwindSafe(account.all_operations_completed())
                .catch_unwind()
                .await
                .is_err()
            {
                error!(account_id = %account_id, "all_operations_completed panicked");
            }
        });
    }

    fn arm_deferred_timer(&mut self) {
        if self.deferred_timer_armed {
            return;
        }
        self.deferred_timer_armed = true;
        let tx = self.self_tx.clone();
        let delay = self.settings.deferred_op_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::DeferredTimerFired);
            }
        });
    }

    fn on_deferred_timer(&mut self) {
        self.deferred_timer_armed = false;

        // A background-only session is about to end; wait for interactive use.
        if !self.interactive {
            debug!("Delaying deferred ops while not interactive");
            self.arm_deferred_timer();
            return;
        }

        for account_id in self.account_order.clone() {
            let Some(rt) = self.accounts.get_mut(&account_id) else {
                continue;
            };
            let deferred = std::mem::take(&mut rt.queues.deferred);
            let mut replay = Vec::new();
            for id in deferred {
                let wanted = rt.ops.get(&id).map_or(false, |op| op.lifecycle == Lifecycle::Do);
                // Undo may have queued it again already.
                if wanted && !rt.queues.in_server(&id) && !replay.contains(&id) {
                    replay.push(id);
                }
            }
            if !replay.is_empty() {
                info!(account_id = %account_id, "Replaying {} deferred ops", replay.len());
            }
            for id in replay {
                self.queue_op(&account_id, id);
            }
        }
    }

    fn snapshot(&self, account_id: &str) -> Result<QueueSnapshot, EddieError> {
        let rt = self
            .accounts
            .get(account_id)
            .ok_or_else(|| EddieError::AccountNotFound(account_id.to_string()))?;
        let mut ops: Vec<Operation> = rt.ops.values().cloned().collect();
        ops.sort_by_key(|op| op.id().map(|id| id.num));

        Ok(QueueSnapshot {
            active: rt.queues.active,
            local: rt.queues.local.iter().cloned().collect(),
            server: rt.queues.server.iter().cloned().collect(),
            deferred: rt.queues.deferred.clone(),
            history: rt.op_state().mutations,
            ops,
            next_mutation_num: rt.next_mutation_num,
        })
    }
}

fn moot(op: &mut Operation) {
    op.lifecycle = Lifecycle::Moot;
    op.server_status = Some(ServerStatus::Moot);
}
