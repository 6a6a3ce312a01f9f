// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Whole-engine smoke test: the same wiring as the server binary, driven
//! through the service with the fake backend's echo driver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use colloquy_config::BackendSettings;
use colloquy_core::{
    default_driver_factory, AgentProfile, Broadcaster, ContextFilter, ConversationService,
    ConversationStore, EventQueue, InMemoryEventQueue, MemoryStore, ToolDispatcher, TurnProcessor,
    TurnQueue,
};
use colloquy_tools::ToolRegistry;

struct Engine {
    service: ConversationService,
    processor: Arc<TurnProcessor>,
    queue: Arc<TurnQueue>,
    events: Arc<InMemoryEventQueue>,
}

fn engine() -> Engine {
    let store = Arc::new(MemoryStore::new());
    store.insert_profile(AgentProfile::new("demo", "demo agent", "fake"));

    let queue = Arc::new(TurnQueue::new());
    let events = Arc::new(InMemoryEventQueue::new(Duration::from_secs(3600)));
    let broadcaster = Arc::new(Broadcaster::new(events.clone() as Arc<dyn EventQueue>));
    let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(ToolRegistry::default()), 4000));

    let mut backends = HashMap::new();
    backends.insert(
        "fake".to_string(),
        BackendSettings {
            model: Some("fake-model".into()),
            ..BackendSettings::default()
        },
    );

    let processor = Arc::new(TurnProcessor::new(
        store.clone() as Arc<dyn ConversationStore>,
        broadcaster.clone(),
        dispatcher.clone(),
        queue.clone(),
        ContextFilter::default(),
        backends,
        default_driver_factory(),
    ));
    let service = ConversationService::new(
        store as Arc<dyn ConversationStore>,
        queue.clone(),
        broadcaster,
        dispatcher,
    );
    Engine {
        service,
        processor,
        queue,
        events,
    }
}

async fn drain(e: &Engine) {
    while let Some(id) = e.queue.try_claim() {
        e.processor.process(&id).await;
        e.queue.release(&id);
    }
}

#[tokio::test]
async fn full_round_trip_with_default_wiring() {
    let e = engine();
    let conv = e.service.create("demo", None, vec![]).await.unwrap();

    let view = e
        .service
        .post_message(&conv.id, "hello engine", vec![])
        .await
        .unwrap();
    assert_eq!(view.status, "processing");

    drain(&e).await;

    let view = e.service.status(&conv.id).await.unwrap();
    assert_eq!(view.status, "completed");
    assert_eq!(view.stats.turns, 1);
    let messages = view.messages.expect("completed status carries the reply");
    assert_eq!(messages[0].content(), "FAKE: hello engine");

    // The stream queue ends with the terminal event.
    let mut last_kind = String::new();
    while let Some(event) = e.events.pop(&conv.id, Duration::from_millis(10)).await {
        last_kind = event.kind().to_string();
    }
    assert_eq!(last_kind, "completed");
}

#[tokio::test]
async fn unknown_agent_rejected_at_creation() {
    let e = engine();
    assert!(e.service.create("ghost", None, vec![]).await.is_err());
}

#[tokio::test]
async fn cancel_then_status_reads_cancelled() {
    let e = engine();
    let conv = e.service.create("demo", None, vec![]).await.unwrap();
    e.service.post_message(&conv.id, "hi", vec![]).await.unwrap();
    e.service.cancel(&conv.id).await.unwrap();
    drain(&e).await;
    let view = e.service.status(&conv.id).await.unwrap();
    assert_eq!(view.status, "cancelled");
}
