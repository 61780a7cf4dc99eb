use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// One message as returned by a provider, before any local processing.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Provider-assigned id, unique within the mailbox.
    pub external_id: String,
    pub subject: Option<String>,
    pub body_preview: Option<String>,
    pub body_html: Option<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub has_attachments: bool,
    pub sent_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    /// Native conversation id, when the provider has one (Graph does,
    /// IMAP does not). Takes precedence over the local thread resolver.
    pub provider_thread_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Only messages received after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Opaque cursor from the previous cycle, adapter-defined.
    pub cursor: Option<serde_json::Value>,
    pub limit: Option<usize>,
    pub folder: Option<String>,
}

///// Fetch output: the batch plus the cursor the engine should persist once
/// every message in the batch has been stored.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub messages: Vec<RawMessage>,
    pub cursor: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOptions {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub body_html: Option<String>,
}

/// Capability interface implemented once per mailbox provider. An adapter
/// instance lives for one sync cycle; `initialize` must be called before
/// any other method.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Decrypt the stored credential via the vault and keep it, plus the
    /// resolved mailbox address, in memory for this cycle.
    async fn initialize(&self, credentials_encrypted: &str) -> Result<(), SyncError>;

    /// Lightweight "who am I" probe. Auth failure returns `false`, it does
    /// not error.
    async fn test_connection(&self) -> bool;

    /// Fetch messages newer than the cursor. Callers must not assume any
    /// ordering of the returned batch.
    async fn fetch_messages(&self, options: FetchOptions) -> Result<FetchResult, SyncError>;

    /// Send one message; returns the provider-assigned message id.
    async fn send_message(&self, options: SendOptions) -> Result<String, SyncError>;

    /// If the adapter refreshed its token during this cycle, the
    /// re-encrypted blob the caller must persist. `None` for providers
    /// with static credentials.
    async fn refreshed_credential(&self) -> Result<Option<String>, SyncError>;
}
