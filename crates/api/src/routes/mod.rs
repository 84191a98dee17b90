pub mod channels;
pub mod follow_ups;
pub mod health;
pub mod notifications;
pub mod preferences;
pub mod reports;
pub mod responses;
pub mod rules;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(notifications::router())
        .merge(responses::router())
        .merge(channels::router())
        .merge(rules::router())
        .merge(reports::router())
        .merge(follow_ups::router())
        .merge(preferences::router())
        .with_state(state)
}
