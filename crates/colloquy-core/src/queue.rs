// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn work queue.
//!
//! Each conversation is a single-writer lane: the queue leases a conversation
//! to exactly one worker at a time, so at most one turn per conversation is
//! ever active while different conversations proceed in parallel, bounded
//! only by the worker-pool size.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Ids currently in `queue` (dedup: one pending turn per conversation).
    queued: HashSet<String>,
    /// Ids currently claimed by a worker.
    leased: HashSet<String>,
}

#[derive(Default)]
pub struct TurnQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TurnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a turn for a conversation.  A no-op when a turn for it is
    /// already pending; enqueueing while its turn is running is allowed and
    /// becomes claimable once the lease is released.
    pub fn enqueue(&self, conversation_id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.queued.insert(conversation_id.to_string()) {
            state.queue.push_back(conversation_id.to_string());
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Claim the next conversation whose lane is free.  `None` when every
    /// pending conversation is currently leased (or the queue is empty).
    pub fn try_claim(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let pos = state
            .queue
            .iter()
            .position(|id| !state.leased.contains(id))?;
        let id = state.queue.remove(pos).expect("position is valid");
        state.queued.remove(&id);
        state.leased.insert(id.clone());
        Some(id)
    }

    /// Wait until a claimable conversation is available.
    pub async fn claim(&self) -> String {
        loop {
            // Register before checking so an enqueue between the check and
            // the await is not missed.
            let notified = self.notify.notified();
            if let Some(id) = self.try_claim() {
                return id;
            }
            notified.await;
        }
    }

    /// Release a lease after the turn finished.  Wakes workers when the same
    /// conversation was re-enqueued while running.
    pub fn release(&self, conversation_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.leased.remove(conversation_id);
        let requeued = state.queued.contains(conversation_id);
        drop(state);
        if requeued {
            self.notify.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
