use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::crypto::CryptoError;

/// Failure taxonomy for a sync cycle. Containment is layered: `Validation`
/// is contained to a single message, everything else to a single account,
/// and only a failed account-list query aborts a whole invocation.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Credential blob failed to decrypt or authenticate. Non-retryable;
    /// the account needs to be reconnected by its owner.
    #[error("credential decryption failed: {0}")]
    Crypto(#[from] CryptoError),

    /// OAuth refresh failed, or the provider kept rejecting the token after
    /// one forced refresh. Non-retryable within the cycle.
    #[error("authorization expired: {0}")]
    AuthExpired(String),

    /// Network error, timeout, or 5xx from the provider. Retryable on the
    /// next scheduled cycle; the cursor is left untouched.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Malformed message payload from the provider (missing required
    /// field). The single message is skipped, the cycle continues.
    #[error("invalid message payload: {0}")]
    Validation(String),

    /// Datastore write failure. Aborts the current account's cycle without
    /// advancing the cursor.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl SyncError {
    /// Stable machine-readable code included in result payloads so the UI
    /// can distinguish "reconnect this mailbox" from transient failures.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Crypto(_) => "crypto_error",
            SyncError::AuthExpired(_) => "auth_expired",
            SyncError::ProviderUnavailable(_) => "provider_unavailable",
            SyncError::Validation(_) => "validation_error",
            SyncError::Persistence(_) => "persistence_error",
        }
    }

    /// Whether the account owner must re-authorize the mailbox.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, SyncError::Crypto(_) | SyncError::AuthExpired(_))
    }
}

impl From<sea_orm::DbErr> for SyncError {
    fn from(err: sea_orm::DbErr) -> Self {
        SyncError::Persistence(err.to_string())
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::Crypto(_) | SyncError::AuthExpired(_) => StatusCode::UNAUTHORIZED,
            SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            SyncError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}
