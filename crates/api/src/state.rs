//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_engine::Engine;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, config: AppConfig) -> Self {
        Self { engine, config }
    }
}
