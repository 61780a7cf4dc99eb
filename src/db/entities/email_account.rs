use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One connected mailbox belonging to one user.
///
/// `credentials_encrypted` is an opaque vault ciphertext; it must never be
/// logged or serialized into an API response. The `Serialize` impl skips it.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    /// Provider kind: "outlook" (OAuth cloud) or "imap".
    pub provider: String,
    pub email_address: String,
    pub display_name: Option<String>,
    #[sea_orm(column_type = "Text")]
    #[serde(skip_serializing)]
    pub credentials_encrypted: String,
    pub is_active: bool,
    pub last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Opaque sync cursor maintained by whichever adapter produced it.
    pub sync_cursor: Option<Json>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::email::Entity")]
    Emails,
}

impl Related<super::email::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Emails.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
