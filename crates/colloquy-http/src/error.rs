// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use colloquy_core::EngineError;

/// HTTP wrapper for the engine taxonomy.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            // Acting on a terminal conversation is a conflict, not bad input.
            EngineError::State(_) => StatusCode::CONFLICT,
            EngineError::MaxTurns => StatusCode::CONFLICT,
            EngineError::Backend(_) | EngineError::Prompt(_) | EngineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
