// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persistence abstraction.
//!
//! The engine needs three things from storage: load an agent with its prompt
//! and tool relations in one call, read/write conversations atomically at the
//! single-conversation grain, and nothing else.  `MemoryStore` is the default
//! implementation; a database-backed store implements the same trait.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::agent::AgentProfile;
use crate::conversation::Conversation;
use crate::error::EngineError;

/// Closure applied under the store's per-conversation exclusive access.
pub type MutateFn = Box<dyn FnOnce(&mut Conversation) -> Result<(), EngineError> + Send>;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load an agent profile with its prompt templates and tool names.
    async fn load_profile(&self, agent_id: &str) -> Result<AgentProfile, EngineError>;

    async fn create(&self, conversation: Conversation) -> Result<(), EngineError>;

    async fn load(&self, id: &str) -> Result<Conversation, EngineError>;

    async fn delete(&self, id: &str) -> Result<(), EngineError>;

    /// Atomic read-modify-write.  The closure either fully applies or — when
    /// it errors — leaves the conversation unchanged.  Returns the updated
    /// conversation.
    async fn mutate(&self, id: &str, f: MutateFn) -> Result<Conversation, EngineError>;
}

#[derive(Default)]
pub struct MemoryStore {
    profiles: DashMap<String, AgentProfile>,
    conversations: DashMap<String, Conversation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_profile(&self, profile: AgentProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load_profile(&self, agent_id: &str) -> Result<AgentProfile, EngineError> {
        self.profiles
            .get(agent_id)
            .map(|p| p.clone())
            .ok_or_else(|| EngineError::NotFound(format!("agent {agent_id}")))
    }

    async fn create(&self, conversation: Conversation) -> Result<(), EngineError> {
        self.conversations
            .insert(conversation.id.clone(), conversation);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Conversation, EngineError> {
        self.conversations
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| EngineError::NotFound(format!("conversation {id}")))
    }

    async fn delete(&self, id: &str) -> Result<(), EngineError> {
        self.conversations.remove(id);
        Ok(())
    }

    async fn mutate(&self, id: &str, f: MutateFn) -> Result<Conversation, EngineError> {
        // The DashMap entry guard is the per-conversation write lock; the
        // closure runs to completion under it, or its error is surfaced with
        // the original state restored.
        let mut entry = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("conversation {id}")))?;
        let backup = entry.clone();
        match f(entry.value_mut()) {
            Ok(()) => Ok(entry.clone()),
            Err(e) => {
                *entry.value_mut() = backup;
                Err(e)
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
