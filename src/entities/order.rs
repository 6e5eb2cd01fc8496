use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_CANCELED: &str = "canceled";
pub const STATUS_COMPLETED: &str = "completed";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub status: String,
    pub currency: String,
    /// Order total in integer minor units.
    pub total_amount: i64,
    /// Key/value bag carrying the authorization reference, edit markers
    /// and recovery flags. See [`OrderMetadata`].
    pub metadata: Json,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Typed view over the order's metadata bag.
///
/// Unknown keys written by other subsystems are preserved only at the
/// storage layer; this struct round-trips the fields the saga owns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_status: Option<String>,
    #[serde(default)]
    pub locked_for_capture: bool,
    #[serde(default)]
    pub needs_capture_recovery: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edit_request_id: Option<String>,
}

impl OrderMetadata {
    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

impl Model {
    pub fn is_pending(&self) -> bool {
        self.status == STATUS_PENDING
    }

    pub fn is_canceled(&self) -> bool {
        self.status == STATUS_CANCELED
    }

    /// Reads the metadata bag, tolerating absent or foreign keys.
    pub fn order_metadata(&self) -> OrderMetadata {
        serde_json::from_value(self.metadata.clone()).unwrap_or_default()
    }
}
