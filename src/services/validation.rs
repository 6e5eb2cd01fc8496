use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::auth::{ModificationClaims, TokenVerifier};
use crate::entities::{order, order_item, product_variant};
use crate::errors::ServiceError;
use crate::gateway::{Authorization, AuthorizationGateway};
use crate::idempotency::Operation;
use crate::store::OrderStore;

/// What the caller wants changed.
#[derive(Debug, Clone)]
pub enum ModificationTarget {
    AddItem { variant_id: Uuid, quantity: i32 },
    UpdateQuantity { item_id: Uuid, quantity: i32 },
}

/// A single modification request as received from the API layer.
#[derive(Debug, Clone)]
pub struct ModificationRequest {
    pub order_id: Uuid,
    /// Signed modification token presented by the requester.
    pub token: String,
    /// Stable per-user-action id; feeds idempotency-key derivation.
    pub request_id: String,
    pub target: ModificationTarget,
}

/// The line the modification applies to.
#[derive(Debug, Clone)]
pub enum LineTarget {
    Existing { item: order_item::Model },
    New { variant: product_variant::Model },
}

/// Validated snapshot the rest of the saga operates on.
#[derive(Debug, Clone)]
pub struct ValidatedModification {
    pub operation: Operation,
    pub order: order::Model,
    pub metadata: order::OrderMetadata,
    pub authorization: Authorization,
    pub line: LineTarget,
    pub old_quantity: i32,
    pub new_quantity: i32,
    /// Tax-exclusive unit price in minor units.
    pub unit_price: i64,
    /// Tax-inclusive calculated unit price, when tracked.
    pub tax_inclusive_unit_price: Option<i64>,
}

impl ValidatedModification {
    /// Line item id or variant id, whichever identifies this request in
    /// the idempotency key.
    pub fn key_subject(&self) -> Uuid {
        match &self.line {
            LineTarget::Existing { item } => item.id,
            LineTarget::New { variant } => variant.id,
        }
    }

    pub fn variant_id(&self) -> Uuid {
        match &self.line {
            LineTarget::Existing { item } => item.variant_id,
            LineTarget::New { variant } => variant.id,
        }
    }
}

/// State-machine gate executed before any external write.
///
/// Performs only reads (order fetch, authorization fetch); safe to call
/// repeatedly.
pub struct PreconditionValidator {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn AuthorizationGateway>,
    tokens: TokenVerifier,
}

impl PreconditionValidator {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn AuthorizationGateway>,
        tokens: TokenVerifier,
    ) -> Self {
        Self {
            store,
            gateway,
            tokens,
        }
    }

    /// Token signature/expiry plus order binding.
    pub fn authenticate(
        &self,
        token: &str,
        order_id: Uuid,
    ) -> Result<ModificationClaims, ServiceError> {
        self.tokens.verify(token, order_id)
    }

    /// Runs the precondition chain in order; each check is a hard stop.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn validate(
        &self,
        request: &ModificationRequest,
    ) -> Result<ValidatedModification, ServiceError> {
        self.tokens.verify(&request.token, request.order_id)?;

        match request.target {
            ModificationTarget::AddItem { quantity, .. } if quantity < 1 => {
                return Err(ServiceError::ValidationError(
                    "added quantity must be at least 1".to_string(),
                ));
            }
            ModificationTarget::UpdateQuantity { quantity, .. } if quantity < 0 => {
                return Err(ServiceError::ValidationError(
                    "quantity must not be negative".to_string(),
                ));
            }
            _ => {}
        }

        let snapshot = self
            .store
            .find_order(request.order_id)
            .await?
            .ok_or(ServiceError::OrderNotFound(request.order_id))?;

        if !snapshot.order.is_pending() {
            return Err(ServiceError::InvalidOrderState {
                order_id: request.order_id,
                status: snapshot.order.status.clone(),
            });
        }

        let (operation, line, old_quantity, new_quantity) = match &request.target {
            ModificationTarget::UpdateQuantity { item_id, quantity } => {
                let item = snapshot
                    .item(*item_id)
                    .cloned()
                    .ok_or(ServiceError::LineItemNotFound {
                        order_id: request.order_id,
                        item_id: *item_id,
                    })?;
                let old_quantity = item.quantity;
                (
                    Operation::UpdateQuantity,
                    LineTarget::Existing { item },
                    old_quantity,
                    *quantity,
                )
            }
            ModificationTarget::AddItem {
                variant_id,
                quantity,
            } => {
                let variant = self
                    .store
                    .find_variant(*variant_id)
                    .await?
                    .ok_or(ServiceError::VariantNotFound(*variant_id))?;
                (
                    Operation::AddItem,
                    LineTarget::New { variant },
                    0,
                    *quantity,
                )
            }
        };

        let metadata = snapshot.order.order_metadata();
        let authorization_id = metadata
            .authorization_id
            .clone()
            .ok_or(ServiceError::PaymentIntentMissing(request.order_id))?;

        let authorization = self
            .gateway
            .retrieve(&authorization_id)
            .await
            .map_err(ServiceError::from)?;
        if !authorization.requires_capture() {
            return Err(ServiceError::InvalidPaymentState {
                authorization_id,
                status: authorization.status.to_string(),
            });
        }

        if metadata.locked_for_capture {
            return Err(ServiceError::OrderLocked(request.order_id));
        }

        // Stock is consumed only by increases; decreases release it and
        // skip the check.
        let increase = i64::from(new_quantity) - i64::from(old_quantity);
        if increase > 0 {
            let variant_id = match &line {
                LineTarget::Existing { item } => item.variant_id,
                LineTarget::New { variant } => variant.id,
            };
            let levels = self.store.inventory_levels(variant_id).await?;
            let available: i64 = levels.iter().map(|l| l.available()).sum();
            if available < increase {
                return Err(ServiceError::InsufficientStock {
                    variant_id,
                    available,
                    requested: increase,
                });
            }
        }

        let (unit_price, tax_inclusive_unit_price) = match &line {
            LineTarget::Existing { item } => (item.unit_price, item.tax_inclusive_unit_price),
            LineTarget::New { variant } => (variant.unit_price, variant.tax_inclusive_unit_price),
        };

        Ok(ValidatedModification {
            operation,
            order: snapshot.order,
            metadata,
            authorization,
            line,
            old_quantity,
            new_quantity,
            unit_price,
            tax_inclusive_unit_price,
        })
    }
}
