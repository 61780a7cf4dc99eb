//! End-to-end sync engine tests against an in-memory store and stub
//! providers: idempotent upserts, per-account failure isolation, and
//! cursor advancement ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use mailsync::config::SyncConfig;
use mailsync::crypto::CryptoError;
use mailsync::db::entities::{contact, email, email_account};
use mailsync::email::provider::{
    EmailProvider, FetchOptions, FetchResult, RawMessage, SendOptions,
};
use mailsync::error::SyncError;
use mailsync::sync::store::{NewEmail, SyncStore};
use mailsync::sync::{ProviderFactory, SyncEngine, SyncResultEntry};

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStore {
    accounts: Mutex<Vec<email_account::Model>>,
    emails: Mutex<Vec<email::Model>>,
    contacts: Mutex<Vec<contact::Model>>,
    /// When set, `finish_cycle` fails, simulating a crash after message
    /// persistence but before the cursor write.
    fail_finish_cycle: AtomicBool,
}

impl MemoryStore {
    fn add_account(&self, account: email_account::Model) {
        self.accounts.lock().unwrap().push(account);
    }

    fn add_contact(&self, id: Uuid, email: &str) -> Uuid {
        self.contacts.lock().unwrap().push(contact::Model {
            id,
            email: Some(email.to_string()),
            name: None,
        });
        id
    }

    fn emails(&self) -> Vec<email::Model> {
        self.emails.lock().unwrap().clone()
    }

    fn account(&self, id: Uuid) -> email_account::Model {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .unwrap()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn load_active_accounts(&self) -> Result<Vec<email_account::Model>, SyncError> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.is_active)
            .cloned()
            .collect())
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<email_account::Model>, SyncError> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn find_email(
        &self,
        account_id: Uuid,
        external_id: &str,
    ) -> Result<Option<email::Model>, SyncError> {
        Ok(self
            .emails
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.account_id == account_id && e.external_id == external_id)
            .cloned())
    }

    async fn thread_exists(&self, account_id: Uuid, thread_id: &str) -> Result<bool, SyncError> {
        Ok(self
            .emails
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.account_id == account_id && e.thread_id == thread_id))
    }

    async fn insert_email(&self, new: NewEmail) -> Result<(), SyncError> {
        let mut emails = self.emails.lock().unwrap();
        // Mirrors the unique (account_id, external_id) constraint.
        if emails
            .iter()
            .any(|e| e.account_id == new.account_id && e.external_id == new.external_id)
        {
            return Err(SyncError::Persistence("duplicate key".into()));
        }
        emails.push(email::Model {
            id: Uuid::new_v4(),
            account_id: new.account_id,
            external_id: new.external_id,
            thread_id: new.thread_id,
            contact_id: new.contact_id,
            deal_id: None,
            direction: new.direction,
            subject: new.subject,
            body_preview: new.body_preview,
            body_html: new.body_html,
            from_address: new.from_address,
            to_addresses: serde_json::to_value(&new.to_addresses).unwrap(),
            cc_addresses: new.cc_addresses.map(|cc| serde_json::to_value(cc).unwrap()),
            has_attachments: new.has_attachments,
            sent_at: new.sent_at,
            received_at: new.received_at,
            is_read: new.is_read,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn set_read_flag(&self, email_id: Uuid, is_read: bool) -> Result<(), SyncError> {
        let mut emails = self.emails.lock().unwrap();
        if let Some(e) = emails.iter_mut().find(|e| e.id == email_id) {
            e.is_read = is_read;
        }
        Ok(())
    }

    async fn finish_cycle(
        &self,
        account_id: Uuid,
        cursor: Option<serde_json::Value>,
        refreshed_credential: Option<String>,
        last_sync_at: chrono::DateTime<Utc>,
    ) -> Result<(), SyncError> {
        if self.fail_finish_cycle.load(Ordering::SeqCst) {
            return Err(SyncError::Persistence("simulated crash".into()));
        }
        let mut accounts = self.accounts.lock().unwrap();
        if let Some(a) = accounts.iter_mut().find(|a| a.id == account_id) {
            a.sync_cursor = cursor;
            a.last_sync_at = Some(last_sync_at);
            if let Some(blob) = refreshed_credential {
                a.credentials_encrypted = blob;
            }
        }
        Ok(())
    }

    async fn find_contact_by_email(&self, address: &str) -> Result<Option<Uuid>, SyncError> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .find(|c| {
                c.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(address))
            })
            .map(|c| c.id))
    }

    async fn find_contact_by_domain(&self, domain: &str) -> Result<Option<Uuid>, SyncError> {
        let suffix = format!("@{}", domain.to_lowercase());
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .find(|c| {
                c.email
                    .as_deref()
                    .is_some_and(|e| e.to_lowercase().ends_with(&suffix))
            })
            .map(|c| c.id))
    }
}

// ---------------------------------------------------------------------------
// Stub provider
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct StubSpec {
    messages: Vec<RawMessage>,
    cursor: Option<serde_json::Value>,
    fail_initialize: bool,
    refreshed_credential: Option<String>,
}

struct StubProvider {
    spec: StubSpec,
}

#[async_trait]
impl EmailProvider for StubProvider {
    async fn initialize(&self, _credentials_encrypted: &str) -> Result<(), SyncError> {
        if self.spec.fail_initialize {
            return Err(SyncError::Crypto(CryptoError::AuthenticationFailed));
        }
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        !self.spec.fail_initialize
    }

    async fn fetch_messages(&self, _options: FetchOptions) -> Result<FetchResult, SyncError> {
        Ok(FetchResult {
            messages: self.spec.messages.clone(),
            cursor: self.spec.cursor.clone(),
        })
    }

    async fn send_message(&self, _options: SendOptions) -> Result<String, SyncError> {
        Ok("stub-message-id".to_string())
    }

    async fn refreshed_credential(&self) -> Result<Option<String>, SyncError> {
        Ok(self.spec.refreshed_credential.clone())
    }
}

#[derive(Default)]
struct StubFactory {
    specs: Mutex<HashMap<Uuid, StubSpec>>,
}

impl StubFactory {
    fn set(&self, account_id: Uuid, spec: StubSpec) {
        self.specs.lock().unwrap().insert(account_id, spec);
    }
}

impl ProviderFactory for StubFactory {
    fn create(
        &self,
        account: &email_account::Model,
    ) -> Result<Box<dyn EmailProvider>, SyncError> {
        let spec = self
            .specs
            .lock()
            .unwrap()
            .get(&account.id)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(StubProvider { spec }))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn test_config() -> SyncConfig {
    SyncConfig {
        max_concurrency: 2,
        fetch_limit: 50,
        api_timeout_secs: 5,
        imap_timeout_secs: 5,
        batch_deadline_secs: 30,
    }
}

fn account(address: &str) -> email_account::Model {
    email_account::Model {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        provider: "outlook".to_string(),
        email_address: address.to_string(),
        display_name: None,
        credentials_encrypted: "opaque-blob".to_string(),
        is_active: true,
        last_sync_at: None,
        sync_cursor: None,
        created_at: Utc::now(),
    }
}

fn message(external_id: &str, subject: &str, from: &str, to: &[&str]) -> RawMessage {
    RawMessage {
        external_id: external_id.to_string(),
        subject: Some(subject.to_string()),
        body_preview: Some("preview".to_string()),
        body_html: None,
        from_address: from.to_string(),
        to_addresses: to.iter().map(|s| s.to_string()).collect(),
        cc_addresses: vec![],
        has_attachments: false,
        sent_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        received_at: None,
        is_read: false,
        provider_thread_id: None,
    }
}

fn engine(store: Arc<MemoryStore>, factory: Arc<StubFactory>) -> SyncEngine {
    SyncEngine::new(store, factory, test_config())
}

fn report(entry: &SyncResultEntry) -> &mailsync::sync::SyncReport {
    match entry {
        SyncResultEntry::Success { report, .. } => report,
        SyncResultEntry::Failure { error, .. } => panic!("expected success, got: {}", error),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idempotent_sync_creates_no_duplicates() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let acct = account("me@corp.com");
    let id = acct.id;
    store.add_account(acct);
    factory.set(
        id,
        StubSpec {
            messages: vec![
                message("m1", "Hello", "bob@client.com", &["me@corp.com"]),
                message("m2", "Re: Hello", "me@corp.com", &["bob@client.com"]),
            ],
            cursor: Some(serde_json::json!({ "last_external_id": "m2" })),
            ..Default::default()
        },
    );
    let engine = engine(store.clone(), factory);

    let first = engine.run(Some(id), false).await.unwrap();
    assert_eq!(report(&first[0]).emails_synced, 2);
    assert_eq!(store.emails().len(), 2);

    // Provider returns the same set again: no inserts the second time.
    let second = engine.run(Some(id), false).await.unwrap();
    assert_eq!(report(&second[0]).emails_synced, 0);
    assert_eq!(store.emails().len(), 2);
}

#[tokio::test]
async fn failure_is_isolated_per_account() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());

    let a1 = account("one@corp.com");
    let a2 = account("two@corp.com");
    let a3 = account("three@corp.com");
    let (id1, id2, id3) = (a1.id, a2.id, a3.id);
    store.add_account(a1);
    store.add_account(a2);
    store.add_account(a3);

    factory.set(
        id1,
        StubSpec {
            messages: vec![message("a", "Hi", "x@y.com", &["one@corp.com"])],
            ..Default::default()
        },
    );
    factory.set(
        id2,
        StubSpec {
            fail_initialize: true,
            ..Default::default()
        },
    );
    factory.set(
        id3,
        StubSpec {
            messages: vec![message("b", "Yo", "x@y.com", &["three@corp.com"])],
            ..Default::default()
        },
    );

    let engine = engine(store.clone(), factory);
    let results = engine.run(None, false).await.unwrap();
    assert_eq!(results.len(), 3);

    let mut failures = 0;
    for entry in &results {
        match entry {
            SyncResultEntry::Success { account_id, report, .. } => {
                assert!(*account_id == id1 || *account_id == id3);
                assert_eq!(report.emails_synced, 1);
            }
            SyncResultEntry::Failure {
                account_id,
                code,
                needs_reconnect,
                ..
            } => {
                failures += 1;
                assert_eq!(*account_id, id2);
                assert_eq!(*code, "crypto_error");
                assert!(needs_reconnect);
            }
        }
    }
    assert_eq!(failures, 1);
    assert_eq!(store.emails().len(), 2);
}

#[tokio::test]
async fn cursor_advances_only_after_messages_persist() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let acct = account("me@corp.com");
    let id = acct.id;
    store.add_account(acct);
    factory.set(
        id,
        StubSpec {
            messages: vec![
                message("m1", "One", "a@b.com", &["me@corp.com"]),
                message("m2", "Two", "a@b.com", &["me@corp.com"]),
            ],
            cursor: Some(serde_json::json!({ "last_external_id": "m2" })),
            ..Default::default()
        },
    );
    let engine = engine(store.clone(), factory);

    // Crash between message persistence and the cursor write.
    store.fail_finish_cycle.store(true, Ordering::SeqCst);
    let results = engine.run(Some(id), false).await.unwrap();
    assert!(matches!(
        results[0],
        SyncResultEntry::Failure { code: "persistence_error", .. }
    ));
    assert_eq!(store.emails().len(), 2);
    assert!(store.account(id).sync_cursor.is_none());

    // Recovery run re-fetches the same overlap; the unique constraint is
    // never violated and the cursor now lands.
    store.fail_finish_cycle.store(false, Ordering::SeqCst);
    let results = engine.run(Some(id), false).await.unwrap();
    assert_eq!(report(&results[0]).emails_synced, 0);
    assert_eq!(store.emails().len(), 2);
    assert_eq!(
        store.account(id).sync_cursor,
        Some(serde_json::json!({ "last_external_id": "m2" }))
    );
}

#[tokio::test]
async fn direction_and_contact_resolution() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let acct = account("alice@corp.com");
    let id = acct.id;
    store.add_account(acct);

    let bob = store.add_contact(Uuid::new_v4(), "bob@client.com");
    store.add_contact(Uuid::new_v4(), "dave@other.com");

    factory.set(
        id,
        StubSpec {
            messages: vec![
                // Inbound: resolver applies to the sender, exact match.
                message("in-1", "Question", "bob@client.com", &["alice@corp.com"]),
                // Outbound: resolver applies to the first recipient;
                // carol has no exact contact, so the domain fallback
                // lands on bob's record.
                message("out-1", "Answer", "ALICE@corp.com", &["carol@client.com"]),
            ],
            ..Default::default()
        },
    );

    let engine = engine(store.clone(), factory);
    let results = engine.run(Some(id), false).await.unwrap();
    assert_eq!(report(&results[0]).contacts_matched, 2);

    let emails = store.emails();
    let inbound = emails.iter().find(|e| e.external_id == "in-1").unwrap();
    assert_eq!(inbound.direction, "inbound");
    assert_eq!(inbound.contact_id, Some(bob));
    // Inbound messages without a provider timestamp inherit sent_at.
    assert_eq!(inbound.received_at, Some(inbound.sent_at));

    let outbound = emails.iter().find(|e| e.external_id == "out-1").unwrap();
    assert_eq!(outbound.direction, "outbound");
    assert_eq!(outbound.contact_id, Some(bob));
    assert_eq!(outbound.received_at, None);
}

#[tokio::test]
async fn exact_contact_match_beats_domain_fallback() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let acct = account("me@corp.com");
    let id = acct.id;
    store.add_account(acct);

    // Domain-only candidate registered first; exact match must still win.
    store.add_contact(Uuid::new_v4(), "other@x.com");
    let exact = store.add_contact(Uuid::new_v4(), "a@x.com");

    factory.set(
        id,
        StubSpec {
            messages: vec![message("m", "Hi", "a@x.com", &["me@corp.com"])],
            ..Default::default()
        },
    );

    let engine = engine(store.clone(), factory);
    engine.run(Some(id), false).await.unwrap();

    assert_eq!(store.emails()[0].contact_id, Some(exact));
}

#[tokio::test]
async fn read_flag_is_the_only_mutable_field() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let acct = account("me@corp.com");
    let id = acct.id;
    store.add_account(acct);

    let mut msg = message("m1", "Hello", "bob@client.com", &["me@corp.com"]);
    factory.set(
        id,
        StubSpec {
            messages: vec![msg.clone()],
            ..Default::default()
        },
    );
    let engine = engine(store.clone(), factory.clone());
    engine.run(Some(id), false).await.unwrap();
    assert!(!store.emails()[0].is_read);

    // Same message, now read, with a mutated subject the sync must ignore.
    msg.is_read = true;
    msg.subject = Some("Edited".to_string());
    factory.set(
        id,
        StubSpec {
            messages: vec![msg],
            ..Default::default()
        },
    );
    let results = engine.run(Some(id), false).await.unwrap();
    assert_eq!(report(&results[0]).emails_synced, 0);

    let stored = &store.emails()[0];
    assert!(stored.is_read);
    assert_eq!(stored.subject.as_deref(), Some("Hello"));
}

#[tokio::test]
async fn provider_thread_id_wins_over_local_resolver() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let acct = account("me@corp.com");
    let id = acct.id;
    store.add_account(acct);

    let mut with_native = message("m1", "Topic", "a@b.com", &["me@corp.com"]);
    with_native.provider_thread_id = Some("conv-123".to_string());
    let without_native = message("m2", "Topic", "a@b.com", &["me@corp.com"]);

    factory.set(
        id,
        StubSpec {
            messages: vec![with_native, without_native],
            ..Default::default()
        },
    );
    let engine = engine(store.clone(), factory);
    let results = engine.run(Some(id), false).await.unwrap();
    assert_eq!(report(&results[0]).threads_created, 2);

    let emails = store.emails();
    let native = emails.iter().find(|e| e.external_id == "m1").unwrap();
    assert_eq!(native.thread_id, "conv-123");
    let local = emails.iter().find(|e| e.external_id == "m2").unwrap();
    assert_ne!(local.thread_id, "conv-123");
}

#[tokio::test]
async fn same_conversation_groups_into_one_thread() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let acct = account("me@corp.com");
    let id = acct.id;
    store.add_account(acct);

    factory.set(
        id,
        StubSpec {
            messages: vec![
                message("m1", "Kickoff", "bob@client.com", &["me@corp.com"]),
                message("m2", "Re: Kickoff", "me@corp.com", &["bob@client.com"]),
                message("m3", "Re: Re: Kickoff", "bob@client.com", &["me@corp.com"]),
            ],
            ..Default::default()
        },
    );
    let engine = engine(store.clone(), factory);
    let results = engine.run(Some(id), false).await.unwrap();
    assert_eq!(report(&results[0]).emails_synced, 3);
    assert_eq!(report(&results[0]).threads_created, 1);

    let emails = store.emails();
    assert_eq!(emails[0].thread_id, emails[1].thread_id);
    assert_eq!(emails[1].thread_id, emails[2].thread_id);
}

#[tokio::test]
async fn malformed_message_is_skipped_not_fatal() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let acct = account("me@corp.com");
    let id = acct.id;
    store.add_account(acct);

    let mut broken = message("bad", "No sender", "", &["me@corp.com"]);
    broken.from_address = String::new();

    factory.set(
        id,
        StubSpec {
            messages: vec![
                broken,
                message("good", "Fine", "a@b.com", &["me@corp.com"]),
            ],
            ..Default::default()
        },
    );
    let engine = engine(store.clone(), factory);
    let results = engine.run(Some(id), false).await.unwrap();

    let report = report(&results[0]);
    assert_eq!(report.emails_synced, 1);
    assert_eq!(report.messages_skipped, 1);
    assert_eq!(store.emails().len(), 1);
}

#[tokio::test]
async fn inactive_account_is_a_quiet_noop() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let mut acct = account("gone@corp.com");
    acct.is_active = false;
    let id = acct.id;
    store.add_account(acct);
    factory.set(
        id,
        StubSpec {
            messages: vec![message("m", "Hi", "a@b.com", &["gone@corp.com"])],
            ..Default::default()
        },
    );

    let engine = engine(store.clone(), factory);
    let results = engine.run(Some(id), false).await.unwrap();
    assert_eq!(report(&results[0]).emails_synced, 0);
    assert!(store.emails().is_empty());

    // And it does not appear in a batch run at all.
    let batch = engine.run(None, false).await.unwrap();
    assert!(batch.is_empty());
}

#[tokio::test]
async fn refreshed_credential_is_persisted_with_the_cursor() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let acct = account("me@corp.com");
    let id = acct.id;
    store.add_account(acct);
    factory.set(
        id,
        StubSpec {
            messages: vec![],
            cursor: Some(serde_json::json!({ "last_synced_at": "2024-05-01T00:00:00Z" })),
            refreshed_credential: Some("new-blob".to_string()),
            ..Default::default()
        },
    );

    let engine = engine(store.clone(), factory);
    engine.run(Some(id), false).await.unwrap();

    let updated = store.account(id);
    assert_eq!(updated.credentials_encrypted, "new-blob");
    assert!(updated.sync_cursor.is_some());
    assert!(updated.last_sync_at.is_some());
}

#[tokio::test]
async fn unknown_account_is_an_invocation_error() {
    let store = Arc::new(MemoryStore::default());
    let factory = Arc::new(StubFactory::default());
    let engine = engine(store, factory);

    let err = engine.run(Some(Uuid::new_v4()), false).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
}
