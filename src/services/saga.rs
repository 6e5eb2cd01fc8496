/*!
 * # Modification Saga
 *
 * The external authorization cannot join a local transaction, so each
 * modification runs as an ordered list of forward steps with
 * compensators invoked in reverse order when a later step fails.
 */

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::entities::order::OrderMetadata;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::{Authorization, AuthorizationGateway, AuthorizationStatus, GatewayError};
use crate::idempotency;
use crate::queue::{capture_job_id, CaptureQueue, QueueError};
use crate::store::{LineItemWrite, ModificationCommit, CancellationCommit, OrderStore};

use super::totals::{self, TotalsDelta};
use super::validation::{
    LineTarget, ModificationRequest, ModificationTarget, PreconditionValidator,
    ValidatedModification,
};

const EDIT_STATUS_EDITED: &str = "edited";

/// Undo half of a saga step.
#[async_trait]
pub trait Compensation: Send + Sync {
    fn describe(&self) -> String;
    async fn compensate(&self) -> Result<(), ServiceError>;
}

/// Compensators for completed forward steps, unwound in reverse order.
#[derive(Default)]
pub struct CompensationStack {
    steps: Vec<Box<dyn Compensation>>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Box<dyn Compensation>) {
        self.steps.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every registered compensator, most recent first. Failures
    /// are fatal-logged and not retried here; an endless compensation
    /// loop would mask a stuck authorization.
    pub async fn unwind(&mut self) {
        for step in self.steps.drain(..).rev() {
            if let Err(e) = step.compensate().await {
                counter!("order_edit.compensations.failed", 1);
                error!(
                    critical = true,
                    step = %step.describe(),
                    error = %e,
                    "compensation failed; external state requires operator attention"
                );
            } else {
                info!(step = %step.describe(), "compensation applied");
            }
        }
    }
}

/// Result of the authorization adjustment forward action.
#[derive(Debug, Clone, Copy)]
pub struct AdjustmentOutcome {
    /// True when the amount was already current and no gateway call was
    /// made.
    pub skipped: bool,
    pub previous_amount: i64,
    pub effective_amount: i64,
}

/// Saga step that changes the external authorization amount.
pub struct AuthorizationAdjustmentStep {
    gateway: Arc<dyn AuthorizationGateway>,
}

impl AuthorizationAdjustmentStep {
    pub fn new(gateway: Arc<dyn AuthorizationGateway>) -> Self {
        Self { gateway }
    }

    /// Forward action. A zero-delta change returns a skipped result
    /// without touching the gateway, so no-op edits burn no idempotency
    /// keys. An idempotency conflict means this exact logical request
    /// already went through; the authorization's current amount is the
    /// effective result.
    #[instrument(skip(self, authorization, idempotency_key), fields(authorization_id = %authorization.id))]
    pub async fn execute(
        &self,
        authorization: &Authorization,
        new_amount: i64,
        idempotency_key: &str,
    ) -> Result<AdjustmentOutcome, ServiceError> {
        if new_amount == authorization.amount {
            return Ok(AdjustmentOutcome {
                skipped: true,
                previous_amount: authorization.amount,
                effective_amount: authorization.amount,
            });
        }

        match self
            .gateway
            .update_amount(&authorization.id, new_amount, idempotency_key)
            .await
        {
            Ok(updated) => {
                counter!("order_edit.authorization_adjustments", 1);
                Ok(AdjustmentOutcome {
                    skipped: false,
                    previous_amount: authorization.amount,
                    effective_amount: updated.amount,
                })
            }
            Err(GatewayError::IdempotencyConflict) => {
                let current = self
                    .gateway
                    .retrieve(&authorization.id)
                    .await
                    .map_err(ServiceError::from)?;
                info!(
                    authorization_id = %authorization.id,
                    effective_amount = current.amount,
                    "idempotency key already applied; adopting current authorization amount"
                );
                Ok(AdjustmentOutcome {
                    skipped: false,
                    previous_amount: authorization.amount,
                    effective_amount: current.amount,
                })
            }
            // Card declines propagate untouched; the amount did not
            // change, so there is nothing to compensate.
            Err(e) => Err(ServiceError::from(e)),
        }
    }
}

/// Reverts an authorization adjustment to the prior amount.
struct AdjustmentCompensator {
    gateway: Arc<dyn AuthorizationGateway>,
    authorization_id: String,
    amount_to_revert_to: i64,
    revert_key: String,
}

#[async_trait]
impl Compensation for AdjustmentCompensator {
    fn describe(&self) -> String {
        format!(
            "revert authorization {} to {}",
            self.authorization_id, self.amount_to_revert_to
        )
    }

    async fn compensate(&self) -> Result<(), ServiceError> {
        self.gateway
            .update_amount(
                &self.authorization_id,
                self.amount_to_revert_to,
                &self.revert_key,
            )
            .await
            .map_err(ServiceError::from)?;
        Ok(())
    }
}

/// Outcome returned to the caller for add-item / update-quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationOutcome {
    pub order_id: Uuid,
    pub new_total: i64,
    pub authorization_amount: i64,
    pub adjustment_skipped: bool,
}

/// Payment side of a cancellation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAction {
    None,
    Voided,
    VoidFailed,
}

#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub order_id: Uuid,
    pub token: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub order_id: Uuid,
    pub payment_action: PaymentAction,
    pub void_failed: bool,
    pub message: String,
}

/// Orchestrates add-item, update-quantity and cancel over the validated
/// precondition snapshot, the gateway and the local store.
pub struct OrderModificationService {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn AuthorizationGateway>,
    queue: Arc<dyn CaptureQueue>,
    validator: PreconditionValidator,
    events: EventSender,
}

impl OrderModificationService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn AuthorizationGateway>,
        queue: Arc<dyn CaptureQueue>,
        tokens: TokenVerifier,
        events: EventSender,
    ) -> Self {
        let validator =
            PreconditionValidator::new(store.clone(), gateway.clone(), tokens);
        Self {
            store,
            gateway,
            queue,
            validator,
            events,
        }
    }

    pub fn validator(&self) -> &PreconditionValidator {
        &self.validator
    }

    /// Adds an item to a pending order, adjusting the authorization up
    /// by the new line's total.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn add_item(
        &self,
        request: ModificationRequest,
    ) -> Result<ModificationOutcome, ServiceError> {
        debug_assert!(matches!(
            request.target,
            ModificationTarget::AddItem { .. }
        ));
        self.modify(request).await
    }

    /// Changes a line item's quantity, adjusting the authorization by
    /// the delta.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn update_quantity(
        &self,
        request: ModificationRequest,
    ) -> Result<ModificationOutcome, ServiceError> {
        debug_assert!(matches!(
            request.target,
            ModificationTarget::UpdateQuantity { .. }
        ));
        self.modify(request).await
    }

    async fn modify(
        &self,
        request: ModificationRequest,
    ) -> Result<ModificationOutcome, ServiceError> {
        let validated = self.validator.validate(&request).await?;
        let totals = totals::compute(&validated);

        let idempotency_key = idempotency::derive_key(
            validated.operation,
            request.order_id,
            validated.key_subject(),
            validated.new_quantity,
            &request.request_id,
        );

        let mut compensations = CompensationStack::new();
        let adjustment = AuthorizationAdjustmentStep::new(self.gateway.clone())
            .execute(
                &validated.authorization,
                totals.new_authorization_amount,
                &idempotency_key,
            )
            .await?;

        if !adjustment.skipped {
            compensations.push(Box::new(AdjustmentCompensator {
                gateway: self.gateway.clone(),
                authorization_id: validated.authorization.id.clone(),
                amount_to_revert_to: adjustment.previous_amount,
                revert_key: format!("{idempotency_key}-revert"),
            }));
        }

        let commit = build_commit(&request, &validated, &totals);
        if let Err(commit_err) = self.store.commit_modification(commit).await {
            if adjustment.skipped {
                // Nothing changed externally; the failure is an ordinary
                // retryable-by-the-caller error.
                return Err(commit_err);
            }

            compensations.unwind().await;
            counter!("order_edit.modifications.auth_mismatch", 1);
            error!(
                critical = true,
                order_id = %request.order_id,
                authorization_id = %validated.authorization.id,
                attempted_amount = totals.new_authorization_amount,
                error = %commit_err,
                "authorization amount changed but the order commit failed"
            );
            return Err(ServiceError::AuthMismatch {
                order_id: request.order_id,
                authorization_id: validated.authorization.id.clone(),
                attempted_amount: totals.new_authorization_amount,
            });
        }

        self.emit_modification_events(&request, &validated, &adjustment)
            .await;
        counter!("order_edit.modifications.completed", 1);
        info!(
            order_id = %request.order_id,
            new_total = totals.new_order_total,
            adjustment_skipped = adjustment.skipped,
            "order modification committed"
        );

        Ok(ModificationOutcome {
            order_id: request.order_id,
            new_total: totals.new_order_total,
            authorization_amount: adjustment.effective_amount,
            adjustment_skipped: adjustment.skipped,
        })
    }

    /// Cancels a pending order: confirm no capture has happened, stop
    /// the scheduled capture job, commit the local cancel, then void
    /// the authorization.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn cancel(&self, request: CancelRequest) -> Result<CancelOutcome, ServiceError> {
        self.validator.authenticate(&request.token, request.order_id)?;

        let snapshot = self
            .store
            .find_order(request.order_id)
            .await?
            .ok_or(ServiceError::OrderNotFound(request.order_id))?;

        if snapshot.order.is_canceled() {
            return Ok(CancelOutcome {
                order_id: request.order_id,
                payment_action: PaymentAction::None,
                void_failed: false,
                message: "Order is already canceled; no payment action was taken.".to_string(),
            });
        }

        if !snapshot.order.is_pending() {
            return Err(ServiceError::InvalidOrderState {
                order_id: request.order_id,
                status: snapshot.order.status.clone(),
            });
        }

        let metadata = snapshot.order.order_metadata();
        if metadata.locked_for_capture {
            return Err(ServiceError::OrderLocked(request.order_id));
        }

        let authorization_id = metadata
            .authorization_id
            .clone()
            .ok_or(ServiceError::PaymentIntentMissing(request.order_id))?;
        let authorization = self
            .gateway
            .retrieve(&authorization_id)
            .await
            .map_err(ServiceError::from)?;

        match authorization.status {
            AuthorizationStatus::Succeeded => {
                return Err(ServiceError::LateCancel(request.order_id));
            }
            AuthorizationStatus::RequiresCapture if authorization.amount_received > 0 => {
                return Err(ServiceError::PartialCapture {
                    order_id: request.order_id,
                    amount_received: authorization.amount_received,
                });
            }
            AuthorizationStatus::Processing => {
                return Err(ServiceError::InvalidPaymentState {
                    authorization_id,
                    status: authorization.status.to_string(),
                });
            }
            AuthorizationStatus::RequiresCapture | AuthorizationStatus::Canceled => {}
        }

        // The cancel must not proceed while a capture job might still
        // fire; an unremovable job would leave a canceled order that
        // still collects payment.
        let job_id = capture_job_id(request.order_id);
        match self.queue.remove(&job_id).await {
            Ok(_) => {}
            Err(QueueError::Unavailable(reason)) => {
                return Err(ServiceError::QueueUnavailable(reason));
            }
            Err(e) => {
                return Err(ServiceError::QueueRemoval {
                    job_id,
                    reason: e.to_string(),
                });
            }
        }

        self.store
            .commit_cancellation(CancellationCommit {
                order_id: request.order_id,
                reason: request.reason,
                metadata,
            })
            .await?;

        // The customer-visible cancellation is already committed; a
        // failed void is surfaced as a flag, never a rollback.
        let (payment_action, void_failed) = match authorization.status {
            AuthorizationStatus::Canceled => (PaymentAction::None, false),
            _ => match self.gateway.cancel(&authorization_id).await {
                Ok(_) => (PaymentAction::Voided, false),
                Err(e) => {
                    warn!(
                        order_id = %request.order_id,
                        authorization_id = %authorization_id,
                        error = %e,
                        "authorization void failed after local cancel; order remains financially trackable"
                    );
                    (PaymentAction::VoidFailed, true)
                }
            },
        };

        if let Err(e) = self
            .events
            .send(Event::OrderCanceled {
                order_id: request.order_id,
                void_failed,
            })
            .await
        {
            warn!(error = %e, order_id = %request.order_id, "failed to send cancel event");
        }
        counter!("order_edit.cancellations.completed", 1);

        let message = match payment_action {
            PaymentAction::Voided => "Order canceled and authorization voided.".to_string(),
            PaymentAction::None => "Order canceled; no payment action was required.".to_string(),
            PaymentAction::VoidFailed => {
                "Order canceled, but the authorization could not be voided; manual follow-up required."
                    .to_string()
            }
        };

        Ok(CancelOutcome {
            order_id: request.order_id,
            payment_action,
            void_failed,
            message,
        })
    }

    async fn emit_modification_events(
        &self,
        request: &ModificationRequest,
        validated: &ValidatedModification,
        adjustment: &AdjustmentOutcome,
    ) {
        if !adjustment.skipped {
            if let Err(e) = self
                .events
                .send(Event::AuthorizationAdjusted {
                    order_id: request.order_id,
                    authorization_id: validated.authorization.id.clone(),
                    previous_amount: adjustment.previous_amount,
                    new_amount: adjustment.effective_amount,
                })
                .await
            {
                warn!(error = %e, order_id = %request.order_id, "failed to send adjustment event");
            }
        }

        let event = match &validated.line {
            LineTarget::New { variant } => Event::OrderItemAdded {
                order_id: request.order_id,
                variant_id: variant.id,
                quantity: validated.new_quantity,
            },
            LineTarget::Existing { item } => Event::OrderItemQuantityChanged {
                order_id: request.order_id,
                item_id: item.id,
                old_quantity: validated.old_quantity,
                new_quantity: validated.new_quantity,
            },
        };
        if let Err(e) = self.events.send(event).await {
            warn!(error = %e, order_id = %request.order_id, "failed to send modification event");
        }
    }
}

fn build_commit(
    request: &ModificationRequest,
    validated: &ValidatedModification,
    totals: &TotalsDelta,
) -> ModificationCommit {
    let line_item = match &validated.line {
        LineTarget::Existing { item } => LineItemWrite::UpdateQuantity {
            item_id: item.id,
            quantity: validated.new_quantity,
        },
        LineTarget::New { variant } => LineItemWrite::Insert {
            id: Uuid::new_v4(),
            variant_id: variant.id,
            title: variant.title.clone(),
            quantity: validated.new_quantity,
            unit_price: variant.unit_price,
            tax_inclusive_unit_price: variant.tax_inclusive_unit_price,
        },
    };

    let mut metadata: OrderMetadata = validated.metadata.clone();
    metadata.edit_status = Some(EDIT_STATUS_EDITED.to_string());
    metadata.last_edited_at = Some(Utc::now());
    metadata.last_edit_request_id = Some(request.request_id.clone());

    ModificationCommit {
        order_id: request.order_id,
        line_item,
        new_total: totals.new_order_total,
        metadata,
    }
}
