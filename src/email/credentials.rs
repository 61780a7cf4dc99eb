use serde::{Deserialize, Serialize};

/// OAuth credential for cloud providers (Microsoft Graph). Only ever held
/// in memory for the duration of one sync cycle; the database stores its
/// encrypted serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl OAuthCredential {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at.map(|at| at < now_millis).unwrap_or(false)
    }
}

/// Static IMAP/SMTP credential. SMTP overrides are optional; when absent
/// the submission host is derived from the IMAP host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImapCredential {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_port: Option<u16>,
}

impl ImapCredential {
    /// SMTP host for outbound mail: explicit override, or the IMAP host
    /// with a leading "imap." swapped for "smtp.".
    pub fn smtp_host(&self) -> String {
        if let Some(host) = &self.smtp_host {
            return host.clone();
        }
        if let Some(rest) = self.host.strip_prefix("imap.") {
            format!("smtp.{}", rest)
        } else {
            self.host.clone()
        }
    }

    pub fn smtp_port(&self) -> u16 {
        self.smtp_port.unwrap_or(587)
    }
}
