pub mod credentials;
pub mod imap;
pub mod outlook;
pub mod provider;

use std::str::FromStr;
use std::sync::Arc;

use crate::config::OAuthConfig;
use crate::crypto::CredentialVault;
use crate::error::SyncError;

use self::imap::ImapProvider;
use self::outlook::OutlookProvider;
use self::provider::EmailProvider;

/// Discriminant stored in `email_accounts.provider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// OAuth cloud mailbox (Microsoft Graph).
    Outlook,
    /// Credential-based IMAP/SMTP mailbox.
    Imap,
}

impl FromStr for ProviderKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outlook" => Ok(ProviderKind::Outlook),
            "imap" | "apple" => Ok(ProviderKind::Imap),
            other => Err(SyncError::Validation(format!(
                "unknown provider kind: {}",
                other
            ))),
        }
    }
}

/// Build the adapter matching an account's provider kind. The adapter is
/// uninitialized; callers run `initialize` with the account's encrypted
/// credential blob.
pub fn create_provider(
    kind: ProviderKind,
    vault: Arc<CredentialVault>,
    oauth: &OAuthConfig,
) -> Box<dyn EmailProvider> {
    match kind {
        ProviderKind::Outlook => Box::new(OutlookProvider::new(vault, oauth.clone())),
        ProviderKind::Imap => Box::new(ImapProvider::new(vault)),
    }
}
