//! Per-account operation queues
//!
//! Queues hold operation ids; the operations themselves live in the engine's
//! per-account table. The same id may appear more than once in a queue (an op
//! re-enqueued for undo while its `do` is still waiting), so removal is by
//! position, never by filtering.

use std::collections::VecDeque;

use super::operation::LongtermId;

#[derive(Debug, Default, Clone)]
pub struct AccountQueues {
    /// One local or server phase is in flight
    pub active: bool,
    pub local: VecDeque<LongtermId>,
    pub server: VecDeque<LongtermId>,
    /// Replayed by the cross-account deferred timer
    pub deferred: Vec<LongtermId>,
}

impl AccountQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_head(&self) -> Option<&LongtermId> {
        self.local.front()
    }

    pub fn server_head(&self) -> Option<&LongtermId> {
        self.server.front()
    }

    /// Drop the local head, which is always the op whose local phase just ran.
    pub fn pop_local(&mut self, id: &LongtermId) -> bool {
        if self.local.front() == Some(id) {
            self.local.pop_front();
            true
        } else {
            remove_first(&mut self.local, id)
        }
    }

    /// Drop the server head if it is `id`, otherwise the first occurrence.
    pub fn remove_from_server(&mut self, id: &LongtermId) -> bool {
        if self.server.front() == Some(id) {
            self.server.pop_front();
            true
        } else {
            remove_first(&mut self.server, id)
        }
    }

    pub fn remove_from_local(&mut self, id: &LongtermId) -> bool {
        remove_first(&mut self.local, id)
    }

    pub fn in_local(&self, id: &LongtermId) -> bool {
        self.local.contains(id)
    }

    pub fn in_server(&self, id: &LongtermId) -> bool {
        self.server.contains(id)
    }

    /// Queued anywhere, deferred included
    pub fn references(&self, id: &LongtermId) -> bool {
        self.in_local(id) || self.in_server(id) || self.deferred.contains(id)
    }
}

fn remove_first(queue: &mut VecDeque<LongtermId>, id: &LongtermId) -> bool {
    match queue.iter().position(|queued| queued == id) {
        Some(idx) => {
            queue.remove(idx);
            true
        }
        None => false,
    }
}
