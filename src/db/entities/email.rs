use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One synced email message.
///
/// `(account_id, external_id)` is unique — re-fetching the same provider
/// message must never create a duplicate row. After insert, only `is_read`
/// is mutable; provider messages are immutable once sent.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "emails")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub account_id: Uuid,
    /// Provider-assigned id, unique per account.
    pub external_id: String,
    /// Locally assigned conversation grouping key.
    pub thread_id: String,
    pub contact_id: Option<Uuid>,
    pub deal_id: Option<Uuid>,
    /// "inbound" or "outbound".
    pub direction: String,
    pub subject: Option<String>,
    pub body_preview: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub body_html: Option<String>,
    pub from_address: String,
    pub to_addresses: Json,
    pub cc_addresses: Option<Json>,
    pub has_attachments: bool,
    pub sent_at: chrono::DateTime<chrono::Utc>,
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
    pub is_read: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::email_account::Entity",
        from = "Column::AccountId",
        to = "super::email_account::Column::Id"
    )]
    Account,
    #[sea_orm(
        belongs_to = "super::contact::Entity",
        from = "Column::ContactId",
        to = "super::contact::Column::Id"
    )]
    Contact,
}

impl Related<super::email_account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl Related<super::contact::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Contact.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
