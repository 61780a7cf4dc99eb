use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::credentials::OAuthCredential;
use super::provider::{EmailProvider, FetchOptions, FetchResult, RawMessage, SendOptions};
use crate::config::OAuthConfig;
use crate::crypto::CredentialVault;
use crate::error::SyncError;

const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const GRAPH_SCOPE: &str =
    "https://graph.microsoft.com/Mail.ReadWrite https://graph.microsoft.com/Mail.Send https://graph.microsoft.com/User.Read offline_access";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PAGE_SIZE: usize = 50;

const MESSAGE_SELECT_FIELDS: &str = concat!(
    "id,subject,bodyPreview,body,from,toRecipients,ccRecipients,",
    "sentDateTime,receivedDateTime,isRead,hasAttachments,conversationId"
);

#[derive(Debug, Deserialize)]
struct GraphProfile {
    mail: Option<String>,
    #[serde(rename = "userPrincipalName")]
    user_principal_name: String,
}

#[derive(Debug, Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: GraphEmailAddress,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphBody {
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMessage {
    id: String,
    subject: Option<String>,
    #[serde(rename = "bodyPreview")]
    body_preview: Option<String>,
    body: Option<GraphBody>,
    from: Option<GraphRecipient>,
    #[serde(rename = "toRecipients", default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(rename = "ccRecipients", default)]
    cc_recipients: Vec<GraphRecipient>,
    #[serde(rename = "sentDateTime")]
    sent_date_time: Option<DateTime<Utc>>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<DateTime<Utc>>,
    #[serde(rename = "isRead", default)]
    is_read: bool,
    #[serde(rename = "hasAttachments", default)]
    has_attachments: bool,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMessagePage {
    #[serde(default)]
    value: Vec<GraphMessage>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    token_type: Option<String>,
}

struct ProviderState {
    credential: OAuthCredential,
    email_address: String,
    refreshed: bool,
}

/// Microsoft Graph mailbox adapter. Tokens are checked for expiry before
/// every call and refreshed proactively; a 401 despite that gets exactly
/// one forced refresh and retry before surfacing `AuthExpired`.
pub struct OutlookProvider {
    vault: Arc<CredentialVault>,
    oauth: OAuthConfig,
    client: Client,
    state: Mutex<Option<ProviderState>>,
}

impl OutlookProvider {
    pub fn new(vault: Arc<CredentialVault>, oauth: OAuthConfig) -> Self {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            vault,
            oauth,
            client,
            state: Mutex::new(None),
        }
    }

    fn token_endpoint(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.oauth.tenant_id
        )
    }

    /// Exchange the refresh token for a new access token and update the
    /// in-memory credential. The caller persists the re-encrypted blob via
    /// `refreshed_credential` at the end of the cycle.
    async fn refresh_token(&self, state: &mut ProviderState) -> Result<(), SyncError> {
        let refresh_token = state
            .credential
            .refresh_token
            .clone()
            .ok_or_else(|| SyncError::AuthExpired("no refresh token available".into()))?;

        let params = [
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
            ("scope", GRAPH_SCOPE),
        ];

        let response = self
            .client
            .post(self.token_endpoint())
            .form(&params)
            .send()
            .await
            .map_err(|e| SyncError::ProviderUnavailable(format!("token endpoint: {}", e)))?;

        if !response.status().is_success() {
            return Err(SyncError::AuthExpired(format!(
                "token refresh rejected with status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::ProviderUnavailable(format!("token response: {}", e)))?;

        state.credential = OAuthCredential {
            access_token: token.access_token,
            // Graph may rotate the refresh token; keep the old one if not.
            refresh_token: token.refresh_token.or(Some(refresh_token)),
            expires_at: Some(Utc::now().timestamp_millis() + token.expires_in * 1000),
            token_type: token.token_type,
        };
        state.refreshed = true;
        tracing::debug!("OAuth access token refreshed");
        Ok(())
    }

    /// Bearer-authenticated GET with proactive refresh and a single forced
    /// refresh-and-retry on 401.
    async fn authorized_get(&self, url: &str) -> Result<reqwest::Response, SyncError> {
        let mut guard = self.state.lock().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| SyncError::Validation("provider not initialized".into()))?;

        if state.credential.is_expired(Utc::now().timestamp_millis()) {
            self.refresh_token(state).await?;
        }

        let mut response = self.send_get(url, &state.credential.access_token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.refresh_token(state).await?;
            response = self.send_get(url, &state.credential.access_token).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(SyncError::AuthExpired(
                    "Graph API rejected the token after refresh".into(),
                ));
            }
        }

        if !response.status().is_success() {
            return Err(SyncError::ProviderUnavailable(format!(
                "Graph API returned status {}",
                response.status()
            )));
        }

        Ok(response)
    }

    async fn send_get(&self, url: &str, token: &str) -> Result<reqwest::Response, SyncError> {
        self.client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SyncError::ProviderUnavailable(format!("Graph API: {}", e)))
    }

    async fn post_send(
        &self,
        payload: &serde_json::Value,
        token: &str,
    ) -> Result<reqwest::Response, SyncError> {
        self.client
            .post(format!("{}/me/sendMail", GRAPH_API_BASE))
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(|e| SyncError::ProviderUnavailable(format!("sendMail: {}", e)))
    }

    async fn get_profile(&self) -> Result<GraphProfile, SyncError> {
        let response = self.authorized_get(&format!("{}/me", GRAPH_API_BASE)).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::ProviderUnavailable(format!("profile response: {}", e)))
    }

    fn messages_url(&self, options: &FetchOptions) -> String {
        let limit = options.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let base = match &options.folder {
            Some(folder) => format!("{}/me/mailFolders/{}/messages", GRAPH_API_BASE, folder),
            None => format!("{}/me/messages", GRAPH_API_BASE),
        };

        let mut url = format!(
            "{}?$top={}&$select={}&$orderby=receivedDateTime desc",
            base, limit, MESSAGE_SELECT_FIELDS
        );

        // The cursor's watermark wins over the caller-supplied `since`;
        // both reduce to a receivedDateTime filter.
        let since = cursor_watermark(options.cursor.as_ref()).or(options.since);
        if let Some(since) = since {
            url.push_str(&format!(
                "&$filter=receivedDateTime ge {}",
                since.format("%Y-%m-%dT%H:%M:%SZ")
            ));
        }

        url
    }

    fn map_message(msg: GraphMessage) -> Option<RawMessage> {
        let from_address = msg
            .from
            .as_ref()
            .and_then(|r| r.email_address.address.clone())?;
        let sent_at = msg.sent_date_time.or(msg.received_date_time)?;

        let body_html = msg.body.and_then(|b| {
            match b.content_type.as_deref() {
                Some(t) if t.eq_ignore_ascii_case("html") => b.content,
                _ => None,
            }
        });

        Some(RawMessage {
            external_id: msg.id,
            subject: msg.subject,
            body_preview: msg.body_preview.map(|p| truncate(&p, 200)),
            body_html,
            from_address,
            to_addresses: collect_addresses(msg.to_recipients),
            cc_addresses: collect_addresses(msg.cc_recipients),
            has_attachments: msg.has_attachments,
            sent_at,
            received_at: msg.received_date_time,
            is_read: msg.is_read,
            provider_thread_id: msg.conversation_id,
        })
    }
}

#[async_trait]
impl EmailProvider for OutlookProvider {
    async fn initialize(&self, credentials_encrypted: &str) -> Result<(), SyncError> {
        let credential: OAuthCredential = self.vault.decrypt(credentials_encrypted)?;
        {
            let mut guard = self.state.lock().await;
            *guard = Some(ProviderState {
                credential,
                email_address: String::new(),
                refreshed: false,
            });
        }

        // Resolve the mailbox address up front so direction detection has
        // something to compare against.
        let profile = self.get_profile().await?;
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut() {
            state.email_address = profile.mail.unwrap_or(profile.user_principal_name);
        }
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        self.get_profile().await.is_ok()
    }

    async fn fetch_messages(&self, options: FetchOptions) -> Result<FetchResult, SyncError> {
        let url = self.messages_url(&options);
        let response = self.authorized_get(&url).await?;
        let page: GraphMessagePage = response
            .json()
            .await
            .map_err(|e| SyncError::ProviderUnavailable(format!("messages response: {}", e)))?;

        let mut messages = Vec::with_capacity(page.value.len());
        for msg in page.value {
            match Self::map_message(msg) {
                Some(raw) => messages.push(raw),
                None => tracing::warn!("Skipping Graph message without sender or timestamp"),
            }
        }

        // Advance the watermark to the newest message seen; if the batch
        // was empty the incoming cursor is carried forward unchanged.
        let cursor = messages
            .iter()
            .filter_map(|m| m.received_at.or(Some(m.sent_at)))
            .max()
            .map(|newest| {
                let newest_id = messages
                    .iter()
                    .max_by_key(|m| m.received_at.unwrap_or(m.sent_at))
                    .map(|m| m.external_id.clone());
                serde_json::json!({
                    "last_synced_at": newest.to_rfc3339(),
                    "last_external_id": newest_id,
                })
            })
            .or(options.cursor);

        Ok(FetchResult { messages, cursor })
    }

    async fn send_message(&self, options: SendOptions) -> Result<String, SyncError> {
        let content_type = if options.body_html.is_some() { "HTML" } else { "Text" };
        let content = options.body_html.as_deref().unwrap_or(&options.body);
        let payload = serde_json::json!({
            "message": {
                "subject": options.subject,
                "body": { "contentType": content_type, "content": content },
                "toRecipients": recipient_list(&options.to),
                "ccRecipients": recipient_list(&options.cc),
                "bccRecipients": recipient_list(&options.bcc),
            }
        });

        let mut guard = self.state.lock().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| SyncError::Validation("provider not initialized".into()))?;
        if state.credential.is_expired(Utc::now().timestamp_millis()) {
            self.refresh_token(state).await?;
        }

        let mut response = self
            .post_send(&payload, &state.credential.access_token)
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.refresh_token(state).await?;
            response = self
                .post_send(&payload, &state.credential.access_token)
                .await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(SyncError::AuthExpired(
                    "Graph API rejected the token on send after refresh".into(),
                ));
            }
        }

        if !response.status().is_success() {
            return Err(SyncError::ProviderUnavailable(format!(
                "sendMail returned status {}",
                response.status()
            )));
        }

        // Graph accepts the message asynchronously and does not return an
        // id from sendMail.
        Ok("sent".to_string())
    }

    async fn refreshed_credential(&self) -> Result<Option<String>, SyncError> {
        let guard = self.state.lock().await;
        match guard.as_ref() {
            Some(state) if state.refreshed => Ok(Some(self.vault.encrypt(&state.credential)?)),
            _ => Ok(None),
        }
    }
}

fn collect_addresses(recipients: Vec<GraphRecipient>) -> Vec<String> {
    recipients
        .into_iter()
        .filter_map(|r| r.email_address.address)
        .collect()
}

fn recipient_list(addresses: &[String]) -> Vec<serde_json::Value> {
    addresses
        .iter()
        .map(|a| serde_json::json!({ "emailAddress": { "address": a } }))
        .collect()
}

fn cursor_watermark(cursor: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    cursor?
        .get("last_synced_at")?
        .as_str()?
        .parse::<DateTime<Utc>>()
        .ok()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect::<String>() + "..."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_url_with_cursor() {
        let vault = Arc::new(CredentialVault::new("k"));
        let provider = OutlookProvider::new(
            vault,
            OAuthConfig {
                client_id: "id".into(),
                client_secret: "secret".into(),
                tenant_id: "common".into(),
            },
        );

        let options = FetchOptions {
            cursor: Some(serde_json::json!({
                "last_synced_at": "2024-05-01T10:00:00Z",
                "last_external_id": "abc",
            })),
            limit: Some(25),
            ..Default::default()
        };
        let url = provider.messages_url(&options);
        assert!(url.contains("$top=25"));
        assert!(url.contains("receivedDateTime ge 2024-05-01T10:00:00Z"));
        assert!(url.starts_with("https://graph.microsoft.com/v1.0/me/messages?"));

        let folder = FetchOptions {
            folder: Some("inbox".into()),
            ..Default::default()
        };
        let url = provider.messages_url(&folder);
        assert!(url.contains("/me/mailFolders/inbox/messages?"));
    }

    #[test]
    fn test_cursor_watermark_parsing() {
        assert!(cursor_watermark(None).is_none());
        let cursor = serde_json::json!({ "last_synced_at": "2024-05-01T10:00:00+00:00" });
        let parsed = cursor_watermark(Some(&cursor)).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        let garbage = serde_json::json!({ "last_synced_at": "not a date" });
        assert!(cursor_watermark(Some(&garbage)).is_none());
    }

    #[test]
    fn test_map_message_requires_sender() {
        let msg = GraphMessage {
            id: "m1".into(),
            subject: Some("Hi".into()),
            body_preview: None,
            body: None,
            from: None,
            to_recipients: vec![],
            cc_recipients: vec![],
            sent_date_time: Some(Utc::now()),
            received_date_time: None,
            is_read: false,
            has_attachments: false,
            conversation_id: None,
        };
        assert!(OutlookProvider::map_message(msg).is_none());
    }

    #[test]
    fn test_preview_truncation() {
        let long = "x".repeat(300);
        let truncated = truncate(&long, 200);
        assert_eq!(truncated.chars().count(), 203);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate("short", 200), "short");
    }
}
