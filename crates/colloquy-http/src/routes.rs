// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::debug;

use colloquy_core::{ConversationEvent, ConversationService, ConversationStatus, EventQueue};
use colloquy_model::ToolSchema;

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ConversationService>,
    pub events: Arc<dyn EventQueue>,
    /// Blocking-pop timeout for the stream loop; every miss emits a heartbeat.
    pub pop_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/conversations", post(create_conversation))
        .route("/conversations/:id/messages", post(post_message))
        .route("/conversations/:id/tool-results", post(submit_tool_result))
        .route("/conversations/:id/stop", post(stop))
        .route("/conversations/:id/status", get(status))
        .route("/conversations/:id/stream", get(stream))
        .route("/conversations/:id", delete(remove))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request bodies ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateRequest {
    agent_id: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    client_tool_schemas: Vec<ToolSchema>,
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    content: String,
    #[serde(default)]
    images: Vec<String>,
    /// Accepted for boundary compatibility; document retrieval is a separate
    /// service and is not wired into this engine build.
    #[serde(default)]
    document_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ToolResultRequest {
    call_id: String,
    success: bool,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .service
        .create(&req.agent_id, req.user_id, req.client_tool_schemas)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "conversation_id": conversation.id,
            "agent_id": conversation.agent_id,
            "status": conversation.status.client_facing(),
        })),
    ))
}

async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !req.document_ids.is_empty() {
        debug!(conversation_id = %id, count = req.document_ids.len(),
            "document_ids ignored: retrieval augmentation is not enabled");
    }
    let view = state
        .service
        .post_message(&id, &req.content, req.images)
        .await?;
    Ok(Json(view))
}

async fn submit_tool_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ToolResultRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .service
        .submit_tool_result(&id, &req.call_id, req.success, req.output, req.error)
        .await?;
    Ok(Json(view))
}

async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.service.cancel(&id).await?;
    Ok(Json(view))
}

async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.service.status(&id).await?;
    Ok(Json(view))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // Loading first gives a clean 404 for unknown ids.
    state.service.status(&id).await?;
    state.service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Streaming endpoint ───────────────────────────────────────────────────────

/// Long-lived SSE response bridging the broadcaster's queue to the client.
///
/// On connect: emit `connected`, then replay the matching event immediately
/// when the conversation is already terminal or paused.  Otherwise loop:
/// blocking-pop with a short timeout, emitting heartbeats on misses and
/// closing after any terminal or `tool_request` event.  A disconnected client
/// drops the stream, which simply stops the loop.
async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.service.status(&id).await?;
    debug!(conversation_id = %id, status = view.status, "stream subscriber connected");

    let service = Arc::clone(&state.service);
    let events = Arc::clone(&state.events);
    let pop_timeout = state.pop_timeout;

    let sse_stream = async_stream::stream! {
        yield Ok::<Event, Infallible>(sse_event(&ConversationEvent::Connected {
            conversation_id: id.clone(),
            status: view.status,
        }));

        if let Some(event) = replay_for_settled_conversation(&service, &id).await {
            yield Ok(sse_event(&event));
            return;
        }

        loop {
            match events.pop(&id, pop_timeout).await {
                Some(event) => {
                    let close = event.closes_stream();
                    yield Ok(sse_event(&event));
                    if close {
                        return;
                    }
                }
                None => yield Ok(sse_event(&ConversationEvent::Heartbeat)),
            }
        }
    };

    let sse = Sse::new(sse_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    );
    // Disable proxy buffering so chunks reach the client as they are emitted.
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    ))
}

fn sse_event(event: &ConversationEvent) -> Event {
    Event::default()
        .event(event.kind())
        .data(event.payload().to_string())
}

/// The event a fresh subscriber gets when the conversation already settled:
/// its terminal event, or the pending `tool_request` while paused.
async fn replay_for_settled_conversation(
    service: &ConversationService,
    conversation_id: &str,
) -> Option<ConversationEvent> {
    let conversation = service.load(conversation_id).await.ok()?;
    let stats = conversation.stats();
    match conversation.status {
        ConversationStatus::Completed => Some(ConversationEvent::Completed {
            conversation_id: conversation_id.to_string(),
            stats,
            last_assistant: conversation.last_assistant().cloned(),
        }),
        ConversationStatus::Failed => Some(ConversationEvent::Failed {
            conversation_id: conversation_id.to_string(),
            error: conversation
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown error".into()),
            stats,
        }),
        ConversationStatus::Cancelled => Some(ConversationEvent::Cancelled {
            conversation_id: conversation_id.to_string(),
            stats,
        }),
        ConversationStatus::Paused => {
            conversation
                .pending_tool_request
                .clone()
                .map(|request| ConversationEvent::ToolRequest {
                    conversation_id: conversation_id.to_string(),
                    request,
                    stats,
                })
        }
        ConversationStatus::Active | ConversationStatus::Processing => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
