use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;

use super::auth::{attach_caller, require_admin, require_caller};
use super::handlers;
use super::middleware::{track, PanicResponder};
use crate::app::app_state::AppState;

fn caller_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/responses", post(handlers::responses))
        .route_layer(from_fn(require_caller))
        .route_layer(from_fn_with_state(state.clone(), attach_caller))
}

fn admin_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/models",
            post(handlers::create_model).patch(handlers::update_model),
        )
        .route("/models/:uid", delete(handlers::delete_model))
        .route_layer(from_fn(require_admin))
        .route_layer(from_fn(require_caller))
        .route_layer(from_fn_with_state(state.clone(), attach_caller))
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/metrics", get(handlers::metrics))
        .merge(caller_routes(&state))
        .merge(admin_routes(&state))
        .layer(CatchPanicLayer::custom(PanicResponder::new(
            state.reporter.clone(),
        )))
        .layer(from_fn_with_state(state.clone(), track))
        .with_state(state)
}
