/*!
 * # Order Store
 *
 * Local-side collaborator interface for the saga: fetch an order with
 * its line items, read inventory, and persist modification/cancellation
 * commits as single local writes. The SQL implementation is the
 * production path; the in-memory implementation backs tests and local
 * development.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{inventory_level, order, order_item, product_variant};
use crate::errors::ServiceError;

mod memory;
mod sql;

pub use memory::InMemoryOrderStore;
pub use sql::SqlOrderStore;

/// An order together with its line items, as loaded for validation.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

impl OrderSnapshot {
    pub fn item(&self, item_id: Uuid) -> Option<&order_item::Model> {
        self.items.iter().find(|item| item.id == item_id)
    }
}

/// Line-item half of a modification commit.
#[derive(Debug, Clone)]
pub enum LineItemWrite {
    UpdateQuantity { item_id: Uuid, quantity: i32 },
    Insert {
        id: Uuid,
        variant_id: Uuid,
        title: String,
        quantity: i32,
        unit_price: i64,
        tax_inclusive_unit_price: Option<i64>,
    },
}

/// Everything the local commit step persists in one write.
#[derive(Debug, Clone)]
pub struct ModificationCommit {
    pub order_id: Uuid,
    pub line_item: LineItemWrite,
    pub new_total: i64,
    pub metadata: order::OrderMetadata,
}

/// Local half of an order cancellation.
#[derive(Debug, Clone)]
pub struct CancellationCommit {
    pub order_id: Uuid,
    pub reason: Option<String>,
    pub metadata: order::OrderMetadata,
}

/// Operations the saga needs from the local database.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(&self, order_id: Uuid) -> Result<Option<OrderSnapshot>, ServiceError>;

    async fn find_variant(
        &self,
        variant_id: Uuid,
    ) -> Result<Option<product_variant::Model>, ServiceError>;

    /// Inventory rows for a variant across all locations.
    async fn inventory_levels(
        &self,
        variant_id: Uuid,
    ) -> Result<Vec<inventory_level::Model>, ServiceError>;

    /// Persists the line-item change, new total and metadata markers as
    /// a single local write.
    async fn commit_modification(&self, commit: ModificationCommit) -> Result<(), ServiceError>;

    /// Marks the order canceled and persists cancellation metadata.
    async fn commit_cancellation(&self, commit: CancellationCommit) -> Result<(), ServiceError>;

    async fn update_metadata(
        &self,
        order_id: Uuid,
        metadata: &order::OrderMetadata,
    ) -> Result<(), ServiceError>;

    /// Non-canceled orders created before `cutoff`. The caller filters
    /// on authorization metadata, which is not portably queryable.
    async fn stale_authorized_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<order::Model>, ServiceError>;

    /// Orders whose metadata carries the needs-recovery marker.
    async fn recovery_flagged_orders(&self) -> Result<Vec<order::Model>, ServiceError>;
}
