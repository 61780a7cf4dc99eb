use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::email::provider::SendOptions;
use crate::error::SyncError;
use crate::sync::store::SyncStore;
use crate::sync::{ProviderFactory, SyncEngine, SyncResultEntry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engine: Arc<SyncEngine>,
    pub store: Arc<dyn SyncStore>,
    pub factory: Arc<dyn ProviderFactory>,
}

/// Simple request logger middleware
async fn log_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    tracing::info!(">>> {} {}", method, uri);
    let res = next.run(req).await;
    tracing::info!("<<< {} {} -> {}", method, uri, res.status());
    res
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(trigger_sync))
        .route("/accounts/:id/test", post(test_account))
        .route("/accounts/:id/send", post(send_from_account))
        .layer(middleware::from_fn(log_middleware))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    pub account_id: Option<Uuid>,
    #[serde(default)]
    pub force_full_sync: bool,
}

/// POST /sync — the scheduler entry point. Syncs one account or all
/// active accounts; per-account failures come back in `results`, not as
/// an HTTP error.
async fn trigger_sync(
    State(state): State<AppState>,
    body: Option<Json<SyncRequest>>,
) -> Result<Json<serde_json::Value>, SyncError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let results: Vec<SyncResultEntry> = state
        .engine
        .run(request.account_id, request.force_full_sync)
        .await?;

    Ok(Json(serde_json::json!({
        "message": "Email sync completed",
        "results": results,
    })))
}

/// POST /accounts/:id/test — connectivity probe for the account settings
/// screen. Auth problems report `connected: false` rather than an error.
async fn test_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, SyncError> {
    let account = state
        .store
        .find_account(account_id)
        .await?
        .ok_or_else(|| SyncError::Validation(format!("unknown account: {}", account_id)))?;

    let provider = state.factory.create(&account)?;
    let connected = match provider.initialize(&account.credentials_encrypted).await {
        Ok(()) => provider.test_connection().await,
        Err(_) => false,
    };

    Ok(Json(serde_json::json!({ "connected": connected })))
}

/// POST /accounts/:id/send — send one message through the account's
/// provider.
async fn send_from_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(options): Json<SendOptions>,
) -> Result<Json<serde_json::Value>, SyncError> {
    if options.to.is_empty() {
        return Err(SyncError::Validation("at least one recipient required".into()));
    }

    let account = state
        .store
        .find_account(account_id)
        .await?
        .ok_or_else(|| SyncError::Validation(format!("unknown account: {}", account_id)))?;

    let provider = state.factory.create(&account)?;
    provider.initialize(&account.credentials_encrypted).await?;
    let message_id = provider.send_message(options).await?;

    Ok(Json(serde_json::json!({ "message_id": message_id })))
}
