// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod routes;

pub use error::ApiError;
pub use routes::{router, AppState};
