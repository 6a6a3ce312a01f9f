// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod agent;
pub mod broadcast;
pub mod context;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod prompt;
pub mod queue;
pub mod store;
mod processor;
mod service;
#[cfg(test)]
mod tests;

pub use agent::{AgentProfile, PromptRef, PromptTemplate};
pub use broadcast::{Broadcaster, EventQueue, InMemoryEventQueue};
pub use context::{ContextFilter, ContextStrategy, FilterParams};
pub use conversation::{
    Conversation, ConversationStats, ConversationStatus, MessageEntry, PendingToolRequest,
};
pub use dispatch::{ToolDispatcher, ToolRoute};
pub use error::EngineError;
pub use events::ConversationEvent;
pub use processor::{default_driver_factory, spawn_workers, DriverFactory, TurnProcessor};
pub use queue::TurnQueue;
pub use service::{ConversationService, StatusView};
pub use store::{ConversationStore, MemoryStore};
