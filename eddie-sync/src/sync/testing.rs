//! Scripted account for engine tests

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::account::{AccountOpState, LocalOutcome, MailAccount, ServerOutcome};
use super::operation::{CheckResult, LocalMode, LongtermId, OpKind, OpName, Operation, ServerMode};
use crate::types::error::EddieError;
use crate::types::MessageNamer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    LocalDo,
    LocalUndo,
    ServerDo,
    ServerUndo,
    ServerCheck,
}

pub fn move_op(suid: &str, target_folder: &str) -> Operation {
    Operation::new(
        OpKind::Move {
            messages: vec![MessageNamer::new(suid, 0)],
            target_folder: target_folder.to_string(),
            move_map: BTreeMap::new(),
        },
        OpName::Unnamed,
    )
}

#[derive(Default)]
pub struct FakeAccount {
    id: String,
    disabled: AtomicBool,
    local_only: Vec<String>,
    /// Every phase waits for a permit when set
    gate: Option<Semaphore>,
    calls: Mutex<Vec<(LongtermId, Phase)>>,
    local_script: Mutex<VecDeque<LocalOutcome>>,
    server_script: Mutex<VecDeque<ServerOutcome>>,
    server_always: Mutex<Option<ServerOutcome>>,
    panic_on_server: AtomicBool,
    saves: Mutex<Vec<AccountOpState>>,
    deleted: AtomicBool,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

/// Counts a phase as running until dropped, unwinding included.
struct Running<'a>(&'a FakeAccount);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeAccount {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            ..Default::default()
        })
    }

    pub fn with_local_only(id: &str, folders: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            local_only: folders.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn gated(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        })
    }

    pub fn script_local(&self, outcomes: Vec<LocalOutcome>) {
        self.local_script.lock().unwrap().extend(outcomes);
    }

    pub fn script_server(&self, outcomes: Vec<ServerOutcome>) {
        self.server_script.lock().unwrap().extend(outcomes);
    }

    pub fn script_server_always(&self, outcome: ServerOutcome) {
        *self.server_always.lock().unwrap() = Some(outcome);
    }

    pub fn panic_on_server(&self) {
        self.panic_on_server.store(true, Ordering::SeqCst);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.disabled.store(!enabled, Ordering::SeqCst);
    }

    /// Let `n` more phases through the gate.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..1000 {
            if self.calls.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} calls, saw {:?}", n, self.calls());
    }

    pub fn calls(&self) -> Vec<(LongtermId, Phase)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, id: &LongtermId, phase: Phase) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(call_id, call_phase)| call_id == id && *call_phase == phase)
            .count()
    }

    pub fn saves(&self) -> Vec<AccountOpState> {
        self.saves.lock().unwrap().clone()
    }

    pub fn was_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Most phases this account ever had running at once
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: &Operation, phase: Phase) -> Running<'_> {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now_running, Ordering::SeqCst);
        let running = Running(self);
        if let Some(id) = op.id() {
            self.calls.lock().unwrap().push((id.clone(), phase));
        }
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        running
    }
}

#[async_trait]
impl MailAccount for FakeAccount {
    fn id(&self) -> &str {
        &self.id
    }

    fn enabled(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst)
    }

    fn is_local_only_folder(&self, folder_id: &str) -> bool {
        self.local_only.iter().any(|f| f == folder_id)
    }

    async fn run_local_op(&self, op: Operation, mode: LocalMode) -> LocalOutcome {
        let phase = match mode {
            LocalMode::Do => Phase::LocalDo,
            LocalMode::Undo => Phase::LocalUndo,
        };
        let _running = self.enter(&op, phase).await;
        self.local_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(LocalOutcome::ok)
    }

    async fn run_server_op(&self, op: Operation, mode: ServerMode) -> ServerOutcome {
        let phase = match mode {
            ServerMode::Do => Phase::ServerDo,
            ServerMode::Undo => Phase::ServerUndo,
            ServerMode::Check => Phase::ServerCheck,
        };
        let _running = self.enter(&op, phase).await;
        if self.panic_on_server.load(Ordering::SeqCst) {
            panic!("server op exploded");
        }
        if let Some(outcome) = self.server_always.lock().unwrap().clone() {
            return outcome;
        }
        let scripted = self.server_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| match mode {
            ServerMode::Check => ServerOutcome::checked(CheckResult::Happened),
            _ => ServerOutcome::completed(),
        })
    }

    async fn save_account_state(&self, state: AccountOpState, _label: &str) -> Result<(), EddieError> {
        self.saves.lock().unwrap().push(state);
        Ok(())
    }

    async fn all_operations_completed(&self) {}

    fn account_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }
}
