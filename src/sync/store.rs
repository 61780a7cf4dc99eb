use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Func};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    Set,
};
use uuid::Uuid;

use crate::db::entities::{contact, email, email_account};
use crate::error::SyncError;

/// A message ready for insertion, after thread and contact resolution.
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub account_id: Uuid,
    pub external_id: String,
    pub thread_id: String,
    pub contact_id: Option<Uuid>,
    pub direction: String,
    pub subject: Option<String>,
    pub body_preview: Option<String>,
    pub body_html: Option<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Option<Vec<String>>,
    pub has_attachments: bool,
    pub sent_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
    pub is_read: bool,
}

/// Persistence seam for the sync engine. The production implementation is
/// sea-orm over Postgres; tests drive the engine against an in-memory
/// implementation instead.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn load_active_accounts(&self) -> Result<Vec<email_account::Model>, SyncError>;

    async fn find_account(&self, id: Uuid) -> Result<Option<email_account::Model>, SyncError>;

    async fn find_email(
        &self,
        account_id: Uuid,
        external_id: &str,
    ) -> Result<Option<email::Model>, SyncError>;

    async fn thread_exists(&self, account_id: Uuid, thread_id: &str) -> Result<bool, SyncError>;

    async fn insert_email(&self, email: NewEmail) -> Result<(), SyncError>;

    async fn set_read_flag(&self, email_id: Uuid, is_read: bool) -> Result<(), SyncError>;

    /// Close out a successful cycle: cursor, last-sync timestamp, and the
    /// re-encrypted credential blob when the adapter refreshed its token,
    /// written together in a single UPDATE. Must only run after every
    /// message in the batch has been persisted.
    async fn finish_cycle(
        &self,
        account_id: Uuid,
        cursor: Option<serde_json::Value>,
        refreshed_credential: Option<String>,
        last_sync_at: DateTime<Utc>,
    ) -> Result<(), SyncError>;

    /// Exact, case-insensitive contact lookup by email address.
    async fn find_contact_by_email(&self, address: &str) -> Result<Option<Uuid>, SyncError>;

    /// First contact whose email ends with `@domain`, arbitrary tie-break.
    async fn find_contact_by_domain(&self, domain: &str) -> Result<Option<Uuid>, SyncError>;
}

/// Production store over the relational database.
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SyncStore for SeaOrmStore {
    async fn load_active_accounts(&self) -> Result<Vec<email_account::Model>, SyncError> {
        let accounts = email_account::Entity::find()
            .filter(email_account::Column::IsActive.eq(true))
            .all(&self.db)
            .await?;
        Ok(accounts)
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<email_account::Model>, SyncError> {
        let account = email_account::Entity::find_by_id(id).one(&self.db).await?;
        Ok(account)
    }

    async fn find_email(
        &self,
        account_id: Uuid,
        external_id: &str,
    ) -> Result<Option<email::Model>, SyncError> {
        let found = email::Entity::find()
            .filter(email::Column::AccountId.eq(account_id))
            .filter(email::Column::ExternalId.eq(external_id))
            .one(&self.db)
            .await?;
        Ok(found)
    }

    async fn thread_exists(&self, account_id: Uuid, thread_id: &str) -> Result<bool, SyncError> {
        let count = email::Entity::find()
            .filter(email::Column::AccountId.eq(account_id))
            .filter(email::Column::ThreadId.eq(thread_id))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    async fn insert_email(&self, new: NewEmail) -> Result<(), SyncError> {
        let to_addresses = serde_json::to_value(&new.to_addresses)
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        let cc_addresses = new
            .cc_addresses
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| SyncError::Persistence(e.to_string()))?;

        let row = email::ActiveModel {
            id: Set(Uuid::new_v4()),
            account_id: Set(new.account_id),
            external_id: Set(new.external_id),
            thread_id: Set(new.thread_id),
            contact_id: Set(new.contact_id),
            deal_id: Set(None),
            direction: Set(new.direction),
            subject: Set(new.subject),
            body_preview: Set(new.body_preview),
            body_html: Set(new.body_html),
            from_address: Set(new.from_address),
            to_addresses: Set(to_addresses),
            cc_addresses: Set(cc_addresses),
            has_attachments: Set(new.has_attachments),
            sent_at: Set(new.sent_at),
            received_at: Set(new.received_at),
            is_read: Set(new.is_read),
            created_at: Set(Utc::now()),
        };
        row.insert(&self.db).await?;
        Ok(())
    }

    async fn set_read_flag(&self, email_id: Uuid, is_read: bool) -> Result<(), SyncError> {
        let row = email::ActiveModel {
            id: Set(email_id),
            is_read: Set(is_read),
            ..Default::default()
        };
        row.update(&self.db).await?;
        Ok(())
    }

    async fn finish_cycle(
        &self,
        account_id: Uuid,
        cursor: Option<serde_json::Value>,
        refreshed_credential: Option<String>,
        last_sync_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let account = email_account::Entity::find_by_id(account_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| SyncError::Persistence(format!("account {account_id} disappeared")))?;

        let mut active: email_account::ActiveModel = account.into();
        active.sync_cursor = Set(cursor);
        active.last_sync_at = Set(Some(last_sync_at));
        if let Some(blob) = refreshed_credential {
            active.credentials_encrypted = Set(blob);
        }
        active.update(&self.db).await?;
        Ok(())
    }

    async fn find_contact_by_email(&self, address: &str) -> Result<Option<Uuid>, SyncError> {
        let found = contact::Entity::find()
            .filter(
                Expr::expr(Func::lower(Expr::col(contact::Column::Email)))
                    .eq(address.to_lowercase()),
            )
            .one(&self.db)
            .await?;
        Ok(found.map(|c| c.id))
    }

    async fn find_contact_by_domain(&self, domain: &str) -> Result<Option<Uuid>, SyncError> {
        let found = contact::Entity::find()
            .filter(
                Expr::expr(Func::lower(Expr::col(contact::Column::Email)))
                    .like(format!("%@{}", domain.to_lowercase())),
            )
            .one(&self.db)
            .await?;
        Ok(found.map(|c| c.id))
    }
}
