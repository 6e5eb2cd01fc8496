use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::entities::{
    inventory_level::{self, Entity as InventoryLevelEntity},
    order::{self, Entity as OrderEntity},
    order_item::{self, Entity as OrderItemEntity},
    product_variant::{self, Entity as ProductVariantEntity},
};
use crate::errors::ServiceError;

use super::{
    CancellationCommit, LineItemWrite, ModificationCommit, OrderSnapshot, OrderStore,
};

/// SeaORM-backed order store.
#[derive(Clone)]
pub struct SqlOrderStore {
    db: Arc<DatabaseConnection>,
}

impl SqlOrderStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OrderStore for SqlOrderStore {
    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn find_order(&self, order_id: Uuid) -> Result<Option<OrderSnapshot>, ServiceError> {
        let db = &*self.db;

        let Some(order) = OrderEntity::find_by_id(order_id).one(db).await? else {
            return Ok(None);
        };

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(db)
            .await?;

        Ok(Some(OrderSnapshot { order, items }))
    }

    async fn find_variant(
        &self,
        variant_id: Uuid,
    ) -> Result<Option<product_variant::Model>, ServiceError> {
        Ok(ProductVariantEntity::find_by_id(variant_id)
            .one(&*self.db)
            .await?)
    }

    async fn inventory_levels(
        &self,
        variant_id: Uuid,
    ) -> Result<Vec<inventory_level::Model>, ServiceError> {
        Ok(InventoryLevelEntity::find()
            .filter(inventory_level::Column::VariantId.eq(variant_id))
            .all(&*self.db)
            .await?)
    }

    #[instrument(skip(self, commit), fields(order_id = %commit.order_id))]
    async fn commit_modification(&self, commit: ModificationCommit) -> Result<(), ServiceError> {
        let db = &*self.db;
        let now = Utc::now();

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, order_id = %commit.order_id, "failed to start modification transaction");
            ServiceError::DatabaseError(e)
        })?;

        let order = OrderEntity::find_by_id(commit.order_id)
            .one(&txn)
            .await?
            .ok_or(ServiceError::OrderNotFound(commit.order_id))?;

        match commit.line_item {
            LineItemWrite::UpdateQuantity { item_id, quantity } => {
                let item = OrderItemEntity::find_by_id(item_id)
                    .one(&txn)
                    .await?
                    .ok_or(ServiceError::LineItemNotFound {
                        order_id: commit.order_id,
                        item_id,
                    })?;
                let mut item: order_item::ActiveModel = item.into();
                item.quantity = Set(quantity);
                item.updated_at = Set(Some(now));
                item.update(&txn).await?;
            }
            LineItemWrite::Insert {
                id,
                variant_id,
                title,
                quantity,
                unit_price,
                tax_inclusive_unit_price,
            } => {
                order_item::ActiveModel {
                    id: Set(id),
                    order_id: Set(commit.order_id),
                    variant_id: Set(variant_id),
                    title: Set(title),
                    quantity: Set(quantity),
                    unit_price: Set(unit_price),
                    tax_inclusive_unit_price: Set(tax_inclusive_unit_price),
                    created_at: Set(now),
                    updated_at: Set(Some(now)),
                }
                .insert(&txn)
                .await?;
            }
        }

        let version = order.version;
        let mut order: order::ActiveModel = order.into();
        order.total_amount = Set(commit.new_total);
        order.metadata = Set(commit.metadata.to_json());
        order.updated_at = Set(Some(now));
        order.version = Set(version + 1);
        order.update(&txn).await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %commit.order_id, "failed to commit modification transaction");
            ServiceError::DatabaseError(e)
        })?;

        Ok(())
    }

    #[instrument(skip(self, commit), fields(order_id = %commit.order_id))]
    async fn commit_cancellation(&self, commit: CancellationCommit) -> Result<(), ServiceError> {
        let db = &*self.db;
        let now = Utc::now();

        let order = OrderEntity::find_by_id(commit.order_id)
            .one(db)
            .await?
            .ok_or(ServiceError::OrderNotFound(commit.order_id))?;

        let version = order.version;
        let mut metadata = commit.metadata;
        metadata.cancel_reason = commit.reason;

        let mut order: order::ActiveModel = order.into();
        order.status = Set(order::STATUS_CANCELED.to_string());
        order.metadata = Set(metadata.to_json());
        order.updated_at = Set(Some(now));
        order.version = Set(version + 1);
        order.update(db).await?;

        Ok(())
    }

    async fn update_metadata(
        &self,
        order_id: Uuid,
        metadata: &order::OrderMetadata,
    ) -> Result<(), ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;

        let mut order: order::ActiveModel = order.into();
        order.metadata = Set(metadata.to_json());
        order.updated_at = Set(Some(Utc::now()));
        order.update(&*self.db).await?;

        Ok(())
    }

    async fn stale_authorized_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<order::Model>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::Status.ne(order::STATUS_CANCELED))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .all(&*self.db)
            .await?)
    }

    async fn recovery_flagged_orders(&self) -> Result<Vec<order::Model>, ServiceError> {
        // JSON-path filters are backend-specific; the non-canceled set is
        // small enough to narrow in memory.
        let orders = OrderEntity::find()
            .filter(order::Column::Status.ne(order::STATUS_CANCELED))
            .all(&*self.db)
            .await?;

        Ok(orders
            .into_iter()
            .filter(|o| o.order_metadata().needs_capture_recovery)
            .collect())
    }
}
