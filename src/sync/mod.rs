pub mod contacts;
pub mod store;
pub mod threading;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use crate::config::{OAuthConfig, SyncConfig};
use crate::crypto::CredentialVault;
use crate::db::entities::email_account;
use crate::email::provider::{EmailProvider, FetchOptions, RawMessage};
use crate::email::{create_provider, ProviderKind};
use crate::error::SyncError;

use self::store::{NewEmail, SyncStore};

/// Builds the provider adapter for an account. A seam so the engine can be
/// exercised with stub providers in tests.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, account: &email_account::Model) -> Result<Box<dyn EmailProvider>, SyncError>;
}

pub struct DefaultProviderFactory {
    vault: Arc<CredentialVault>,
    oauth: OAuthConfig,
}

impl DefaultProviderFactory {
    pub fn new(vault: Arc<CredentialVault>, oauth: OAuthConfig) -> Self {
        Self { vault, oauth }
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn create(&self, account: &email_account::Model) -> Result<Box<dyn EmailProvider>, SyncError> {
        let kind: ProviderKind = account.provider.parse()?;
        Ok(create_provider(kind, self.vault.clone(), &self.oauth))
    }
}

/// Counters for one successful account cycle.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub emails_synced: u32,
    pub contacts_matched: u32,
    pub threads_created: u32,
    pub messages_skipped: u32,
}

/// Per-account entry in the invocation result payload. Failures carry the
/// taxonomy code so the UI can surface "reconnect this mailbox" cases.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SyncResultEntry {
    Success {
        account_id: Uuid,
        email_address: String,
        #[serde(flatten)]
        report: SyncReport,
    },
    Failure {
        account_id: Uuid,
        email_address: String,
        error: String,
        code: &'static str,
        needs_reconnect: bool,
    },
}

enum MessageOutcome {
    Inserted { contact_matched: bool, thread_created: bool },
    ReadFlagUpdated,
    Unchanged,
}

/// Orchestrates sync cycles: per account, load → decrypt → fetch → resolve
/// thread/contact → upsert → advance cursor, with the cursor written only
/// after the whole batch is persisted. Per-account failures are isolated;
/// one broken mailbox never blocks the others.
pub struct SyncEngine {
    store: Arc<dyn SyncStore>,
    factory: Arc<dyn ProviderFactory>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn SyncStore>,
        factory: Arc<dyn ProviderFactory>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            factory,
            config,
        }
    }

    /// Entry point for the scheduler. With an account id, sync that one
    /// account; without, sync all active accounts with bounded
    /// parallelism. Only a failure to load the account list itself errors
    /// here; everything account-scoped lands in the result entries.
    pub async fn run(
        &self,
        account_id: Option<Uuid>,
        force_full_sync: bool,
    ) -> Result<Vec<SyncResultEntry>, SyncError> {
        let accounts = match account_id {
            Some(id) => match self.store.find_account(id).await? {
                Some(account) => vec![account],
                None => {
                    return Err(SyncError::Validation(format!("unknown account: {}", id)));
                }
            },
            None => self.store.load_active_accounts().await?,
        };

        let deadline = Instant::now() + Duration::from_secs(self.config.batch_deadline_secs);

        let results = stream::iter(accounts)
            .map(|account| async move {
                let account_id = account.id;
                let email_address = account.email_address.clone();

                let remaining = deadline.saturating_duration_since(Instant::now());
                let outcome = if remaining.is_zero() {
                    Err(SyncError::ProviderUnavailable("batch deadline reached".into()))
                } else {
                    match timeout(remaining, self.sync_account(&account, force_full_sync)).await {
                        Ok(result) => result,
                        Err(_) => Err(SyncError::ProviderUnavailable(
                            "batch deadline reached mid-sync".into(),
                        )),
                    }
                };

                match outcome {
                    Ok(report) => {
                        tracing::info!(
                            "Synced {}: {} new, {} contacts matched, {} threads",
                            email_address,
                            report.emails_synced,
                            report.contacts_matched,
                            report.threads_created
                        );
                        SyncResultEntry::Success {
                            account_id,
                            email_address,
                            report,
                        }
                    }
                    Err(err) => {
                        tracing::error!("Sync failed for {}: {}", email_address, err);
                        SyncResultEntry::Failure {
                            account_id,
                            email_address,
                            error: err.to_string(),
                            code: err.code(),
                            needs_reconnect: err.needs_reconnect(),
                        }
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        Ok(results)
    }

    /// One sync cycle for one account. An abandoned cycle is safe to
    /// re-run: upserts are idempotent on `(account_id, external_id)` and
    /// the cursor only advances as the final step.
    pub async fn sync_account(
        &self,
        account: &email_account::Model,
        force_full_sync: bool,
    ) -> Result<SyncReport, SyncError> {
        if !account.is_active {
            tracing::debug!("Account {} is inactive, skipping", account.email_address);
            return Ok(SyncReport::default());
        }

        let provider = self.factory.create(account)?;
        let call_timeout = self.call_timeout(account);

        timeout(
            call_timeout,
            provider.initialize(&account.credentials_encrypted),
        )
        .await
        .map_err(|_| SyncError::ProviderUnavailable("initialize timed out".into()))??;

        let options = FetchOptions {
            since: if force_full_sync {
                None
            } else {
                account.last_sync_at
            },
            cursor: if force_full_sync {
                None
            } else {
                account.sync_cursor.clone()
            },
            limit: Some(self.config.fetch_limit),
            folder: None,
        };

        let fetched = timeout(call_timeout, provider.fetch_messages(options))
            .await
            .map_err(|_| SyncError::ProviderUnavailable("fetch timed out".into()))??;

        let mut report = SyncReport::default();
        let mut threads_this_cycle: HashSet<String> = HashSet::new();

        for raw in &fetched.messages {
            match self
                .process_message(account, raw, &mut threads_this_cycle)
                .await
            {
                Ok(MessageOutcome::Inserted {
                    contact_matched,
                    thread_created,
                }) => {
                    report.emails_synced += 1;
                    if contact_matched {
                        report.contacts_matched += 1;
                    }
                    if thread_created {
                        report.threads_created += 1;
                    }
                }
                Ok(MessageOutcome::ReadFlagUpdated) | Ok(MessageOutcome::Unchanged) => {}
                // Malformed payloads are contained to the single message.
                Err(SyncError::Validation(reason)) => {
                    tracing::warn!(
                        "Skipping message {} on {}: {}",
                        raw.external_id,
                        account.email_address,
                        reason
                    );
                    report.messages_skipped += 1;
                }
                Err(other) => return Err(other),
            }
        }

        let refreshed_credential = provider.refreshed_credential().await?;

        // Cursor last: a crash anywhere above re-fetches an overlapping
        // range next cycle instead of losing messages.
        self.store
            .finish_cycle(account.id, fetched.cursor, refreshed_credential, Utc::now())
            .await?;

        Ok(report)
    }

    async fn process_message(
        &self,
        account: &email_account::Model,
        raw: &RawMessage,
        threads_this_cycle: &mut HashSet<String>,
    ) -> Result<MessageOutcome, SyncError> {
        if raw.external_id.trim().is_empty() {
            return Err(SyncError::Validation("missing external id".into()));
        }
        if raw.from_address.trim().is_empty() {
            return Err(SyncError::Validation("missing sender address".into()));
        }

        if let Some(existing) = self.store.find_email(account.id, &raw.external_id).await? {
            // Provider messages are immutable once sent; only the read
            // flag may change between syncs.
            if existing.is_read != raw.is_read {
                self.store.set_read_flag(existing.id, raw.is_read).await?;
                return Ok(MessageOutcome::ReadFlagUpdated);
            }
            return Ok(MessageOutcome::Unchanged);
        }

        let outbound = raw
            .from_address
            .eq_ignore_ascii_case(&account.email_address);
        let direction = if outbound { "outbound" } else { "inbound" };

        // Native conversation ids win; the local resolver is the fallback
        // for providers without threading.
        let thread_id = match &raw.provider_thread_id {
            Some(id) => id.clone(),
            None => threading::candidate_thread_id(raw),
        };
        let thread_created = !threads_this_cycle.contains(&thread_id)
            && !self.store.thread_exists(account.id, &thread_id).await?;
        threads_this_cycle.insert(thread_id.clone());

        // Inbound messages resolve their sender; outbound resolve the
        // first recipient.
        let resolve_address = if outbound {
            raw.to_addresses.first().cloned()
        } else {
            Some(raw.from_address.clone())
        };
        let contact_id = match resolve_address {
            Some(address) => contacts::resolve_contact(self.store.as_ref(), &address).await?,
            None => None,
        };

        let received_at = raw.received_at.or(if outbound {
            None
        } else {
            Some(raw.sent_at)
        });

        self.store
            .insert_email(NewEmail {
                account_id: account.id,
                external_id: raw.external_id.clone(),
                thread_id,
                contact_id,
                direction: direction.to_string(),
                subject: raw.subject.clone(),
                body_preview: raw.body_preview.clone(),
                body_html: raw.body_html.clone(),
                from_address: raw.from_address.clone(),
                to_addresses: raw.to_addresses.clone(),
                cc_addresses: if raw.cc_addresses.is_empty() {
                    None
                } else {
                    Some(raw.cc_addresses.clone())
                },
                has_attachments: raw.has_attachments,
                sent_at: raw.sent_at,
                received_at,
                is_read: raw.is_read,
            })
            .await?;

        Ok(MessageOutcome::Inserted {
            contact_matched: contact_id.is_some(),
            thread_created,
        })
    }

    fn call_timeout(&self, account: &email_account::Model) -> Duration {
        match account.provider.parse() {
            Ok(ProviderKind::Imap) => Duration::from_secs(self.config.imap_timeout_secs),
            _ => Duration::from_secs(self.config.api_timeout_secs),
        }
    }
}
