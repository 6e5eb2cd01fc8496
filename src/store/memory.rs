use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::entities::{inventory_level, order, order_item, product_variant};
use crate::errors::ServiceError;

use super::{
    CancellationCommit, LineItemWrite, ModificationCommit, OrderSnapshot, OrderStore,
};

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, OrderSnapshot>,
    variants: HashMap<Uuid, product_variant::Model>,
    inventory: HashMap<Uuid, Vec<inventory_level::Model>>,
}

/// In-memory order store for tests and local development.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    state: Arc<Mutex<State>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_order(&self, order: order::Model, items: Vec<order_item::Model>) {
        self.state
            .lock()
            .unwrap()
            .orders
            .insert(order.id, OrderSnapshot { order, items });
    }

    pub fn insert_variant(&self, variant: product_variant::Model) {
        self.state
            .lock()
            .unwrap()
            .variants
            .insert(variant.id, variant);
    }

    pub fn set_inventory(&self, variant_id: Uuid, levels: Vec<inventory_level::Model>) {
        self.state.lock().unwrap().inventory.insert(variant_id, levels);
    }

    pub fn get_order(&self, order_id: Uuid) -> Option<OrderSnapshot> {
        self.state.lock().unwrap().orders.get(&order_id).cloned()
    }

    /// Makes the next commit fail, simulating a local write error.
    pub fn set_fail_next_commit(&self, fail: bool) {
        self.fail_next_commit.store(fail, Ordering::SeqCst);
    }

    fn take_commit_failure(&self) -> Result<(), ServiceError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            Err(ServiceError::DatabaseError(sea_orm::DbErr::Custom(
                "simulated commit failure".to_string(),
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn find_order(&self, order_id: Uuid) -> Result<Option<OrderSnapshot>, ServiceError> {
        Ok(self.get_order(order_id))
    }

    async fn find_variant(
        &self,
        variant_id: Uuid,
    ) -> Result<Option<product_variant::Model>, ServiceError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .variants
            .get(&variant_id)
            .cloned())
    }

    async fn inventory_levels(
        &self,
        variant_id: Uuid,
    ) -> Result<Vec<inventory_level::Model>, ServiceError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .inventory
            .get(&variant_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit_modification(&self, commit: ModificationCommit) -> Result<(), ServiceError> {
        self.take_commit_failure()?;
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let snapshot = state
            .orders
            .get_mut(&commit.order_id)
            .ok_or(ServiceError::OrderNotFound(commit.order_id))?;

        match commit.line_item {
            LineItemWrite::UpdateQuantity { item_id, quantity } => {
                let item = snapshot
                    .items
                    .iter_mut()
                    .find(|item| item.id == item_id)
                    .ok_or(ServiceError::LineItemNotFound {
                        order_id: commit.order_id,
                        item_id,
                    })?;
                item.quantity = quantity;
                item.updated_at = Some(now);
            }
            LineItemWrite::Insert {
                id,
                variant_id,
                title,
                quantity,
                unit_price,
                tax_inclusive_unit_price,
            } => {
                snapshot.items.push(order_item::Model {
                    id,
                    order_id: commit.order_id,
                    variant_id,
                    title,
                    quantity,
                    unit_price,
                    tax_inclusive_unit_price,
                    created_at: now,
                    updated_at: Some(now),
                });
            }
        }

        snapshot.order.total_amount = commit.new_total;
        snapshot.order.metadata = commit.metadata.to_json();
        snapshot.order.updated_at = Some(now);
        snapshot.order.version += 1;
        Ok(())
    }

    async fn commit_cancellation(&self, commit: CancellationCommit) -> Result<(), ServiceError> {
        self.take_commit_failure()?;
        let mut state = self.state.lock().unwrap();
        let snapshot = state
            .orders
            .get_mut(&commit.order_id)
            .ok_or(ServiceError::OrderNotFound(commit.order_id))?;

        let mut metadata = commit.metadata;
        metadata.cancel_reason = commit.reason;

        snapshot.order.status = order::STATUS_CANCELED.to_string();
        snapshot.order.metadata = metadata.to_json();
        snapshot.order.updated_at = Some(Utc::now());
        snapshot.order.version += 1;
        Ok(())
    }

    async fn update_metadata(
        &self,
        order_id: Uuid,
        metadata: &order::OrderMetadata,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        let snapshot = state
            .orders
            .get_mut(&order_id)
            .ok_or(ServiceError::OrderNotFound(order_id))?;
        snapshot.order.metadata = metadata.to_json();
        snapshot.order.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn stale_authorized_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<order::Model>, ServiceError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|s| !s.order.is_canceled() && s.order.created_at < cutoff)
            .map(|s| s.order.clone())
            .collect())
    }

    async fn recovery_flagged_orders(&self) -> Result<Vec<order::Model>, ServiceError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|s| !s.order.is_canceled() && s.order.order_metadata().needs_capture_recovery)
            .map(|s| s.order.clone())
            .collect())
    }
}
