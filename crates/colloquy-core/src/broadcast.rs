// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Event broadcasting over a durable, ordered, per-conversation queue.
//!
//! Single producer (the turn processor holding the conversation lease),
//! competing consumers (stream subscribers).  A consumed event is never
//! redelivered; subscribers that reconnect miss the gap and resume with the
//! next emitted event.  Events expire after a TTL.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::events::ConversationEvent;

/// The durable queue behind the broadcaster.  Persistence is abstract; the
/// engine only needs ordered append, competing blocking pop, and TTL expiry.
#[async_trait]
pub trait EventQueue: Send + Sync {
    fn push(&self, conversation_id: &str, event: ConversationEvent) -> anyhow::Result<()>;
    /// Blocking pop with timeout.  `None` on timeout.
    async fn pop(&self, conversation_id: &str, timeout: Duration) -> Option<ConversationEvent>;
    /// Drop a conversation's queue (on deletion).
    fn remove(&self, conversation_id: &str);
}

struct Slot {
    events: std::sync::Mutex<VecDeque<(Instant, ConversationEvent)>>,
    notify: Notify,
    /// Latched once a terminal event is queued; later non-heartbeat pushes
    /// are discarded so a terminal event is always the last real event.
    terminal: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            terminal: AtomicBool::new(false),
        }
    }
}

pub struct InMemoryEventQueue {
    slots: DashMap<String, Arc<Slot>>,
    ttl: Duration,
}

impl InMemoryEventQueue {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
        }
    }

    fn slot(&self, conversation_id: &str) -> Arc<Slot> {
        self.slots
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    fn evict_expired(&self, events: &mut VecDeque<(Instant, ConversationEvent)>) {
        let now = Instant::now();
        while let Some((at, _)) = events.front() {
            if now.duration_since(*at) > self.ttl {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    fn push(&self, conversation_id: &str, event: ConversationEvent) -> anyhow::Result<()> {
        let slot = self.slot(conversation_id);
        if slot.terminal.load(Ordering::Acquire)
            && !matches!(event, ConversationEvent::Heartbeat)
        {
            warn!(
                conversation_id,
                kind = event.kind(),
                "dropping event emitted after terminal event"
            );
            return Ok(());
        }
        let is_terminal = event.is_terminal();
        {
            let mut events = slot.events.lock().unwrap();
            self.evict_expired(&mut events);
            events.push_back((Instant::now(), event));
        }
        if is_terminal {
            slot.terminal.store(true, Ordering::Release);
        }
        slot.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, conversation_id: &str, timeout: Duration) -> Option<ConversationEvent> {
        let slot = self.slot(conversation_id);
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the await cannot be missed.
            let notified = slot.notify.notified();
            {
                let mut events = slot.events.lock().unwrap();
                self.evict_expired(&mut events);
                if let Some((_, event)) = events.pop_front() {
                    return Some(event);
                }
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    fn remove(&self, conversation_id: &str) {
        self.slots.remove(conversation_id);
    }
}

/// Thin facade the engine emits through.  Emission failures are logged and
/// never fail the turn: the conversation still reaches its terminal state
/// persistently even when a subscriber queue misbehaves.
pub struct Broadcaster {
    queue: Arc<dyn EventQueue>,
}

impl Broadcaster {
    pub fn new(queue: Arc<dyn EventQueue>) -> Self {
        Self { queue }
    }

    pub fn emit(&self, conversation_id: &str, event: ConversationEvent) {
        debug!(conversation_id, kind = event.kind(), "emit event");
        if let Err(e) = self.queue.push(conversation_id, event) {
            warn!(conversation_id, error = %e, "event emission failed; continuing");
        }
    }

    pub fn queue(&self) -> &Arc<dyn EventQueue> {
        &self.queue
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
