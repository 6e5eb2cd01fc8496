//! Shared fixtures: a programmable fake gateway plus order/inventory
//! builders over the in-memory store.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use order_edit_api::auth::{issue_token, TokenVerifier};
use order_edit_api::entities::{inventory_level, order, order_item, product_variant};
use order_edit_api::events::{Event, EventSender};
use order_edit_api::gateway::{
    Authorization, AuthorizationGateway, AuthorizationStatus, GatewayError,
};
use order_edit_api::queue::InMemoryCaptureQueue;
use order_edit_api::services::saga::OrderModificationService;
use order_edit_api::store::InMemoryOrderStore;

pub const TOKEN_SECRET: &str = "integration_test_token_secret_0123456789";

/// Failure the fake gateway injects into `update_amount`.
#[derive(Debug, Clone, Copy)]
pub enum FailMode {
    Decline(&'static str),
    Conflict,
    Transient,
}

#[derive(Default)]
struct Inner {
    authorizations: HashMap<String, Authorization>,
    update_calls: Vec<(String, i64, String)>,
    cancel_calls: Vec<String>,
    fail_update: Option<FailMode>,
    fail_cancel: bool,
}

/// In-process gateway double recording every call.
#[derive(Clone, Default)]
pub struct FakeGateway {
    inner: Arc<Mutex<Inner>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_authorization(&self, auth: Authorization) {
        self.inner
            .lock()
            .unwrap()
            .authorizations
            .insert(auth.id.clone(), auth);
    }

    pub fn authorization(&self, id: &str) -> Option<Authorization> {
        self.inner.lock().unwrap().authorizations.get(id).cloned()
    }

    pub fn set_fail_update(&self, mode: Option<FailMode>) {
        self.inner.lock().unwrap().fail_update = mode;
    }

    pub fn set_fail_cancel(&self, fail: bool) {
        self.inner.lock().unwrap().fail_cancel = fail;
    }

    /// `(authorization_id, amount, idempotency_key)` per successful call.
    pub fn update_calls(&self) -> Vec<(String, i64, String)> {
        self.inner.lock().unwrap().update_calls.clone()
    }

    pub fn cancel_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().cancel_calls.clone()
    }
}

#[async_trait]
impl AuthorizationGateway for FakeGateway {
    async fn retrieve(&self, authorization_id: &str) -> Result<Authorization, GatewayError> {
        self.inner
            .lock()
            .unwrap()
            .authorizations
            .get(authorization_id)
            .cloned()
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!("no such authorization: {authorization_id}"))
            })
    }

    async fn update_amount(
        &self,
        authorization_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<Authorization, GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.fail_update {
            Some(FailMode::Decline(code)) => {
                return Err(GatewayError::CardDeclined {
                    code: "card_declined".to_string(),
                    decline_code: Some(code.to_string()),
                });
            }
            Some(FailMode::Conflict) => return Err(GatewayError::IdempotencyConflict),
            Some(FailMode::Transient) => return Err(GatewayError::Service { status: 503 }),
            None => {}
        }

        inner.update_calls.push((
            authorization_id.to_string(),
            amount,
            idempotency_key.to_string(),
        ));
        let auth = inner
            .authorizations
            .get_mut(authorization_id)
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!("no such authorization: {authorization_id}"))
            })?;
        auth.amount = amount;
        Ok(auth.clone())
    }

    async fn capture(&self, authorization_id: &str) -> Result<Authorization, GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        let auth = inner
            .authorizations
            .get_mut(authorization_id)
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!("no such authorization: {authorization_id}"))
            })?;
        auth.status = AuthorizationStatus::Succeeded;
        auth.amount_received = auth.amount;
        Ok(auth.clone())
    }

    async fn cancel(&self, authorization_id: &str) -> Result<Authorization, GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_cancel {
            return Err(GatewayError::Service { status: 503 });
        }
        inner.cancel_calls.push(authorization_id.to_string());
        let auth = inner
            .authorizations
            .get_mut(authorization_id)
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!("no such authorization: {authorization_id}"))
            })?;
        auth.status = AuthorizationStatus::Canceled;
        Ok(auth.clone())
    }
}

pub fn token_for(order_id: Uuid) -> String {
    issue_token(TOKEN_SECRET, "cus_test", order_id, Duration::minutes(30)).unwrap()
}

pub fn authorization(id: &str, amount: i64) -> Authorization {
    Authorization {
        id: id.to_string(),
        status: AuthorizationStatus::RequiresCapture,
        amount,
        amount_received: 0,
        currency: "usd".to_string(),
        capture_method: "manual".to_string(),
    }
}

/// A pending order created two hours ago, carrying an authorization id.
pub fn pending_order(order_id: Uuid, authorization_id: &str, total: i64) -> order::Model {
    order::Model {
        id: order_id,
        order_number: format!("ORD-{}", &order_id.to_string()[..8]),
        customer_id: Uuid::new_v4(),
        status: order::STATUS_PENDING.to_string(),
        currency: "usd".to_string(),
        total_amount: total,
        metadata: serde_json::json!({ "authorization_id": authorization_id }),
        created_at: Utc::now() - Duration::hours(2),
        updated_at: None,
        version: 1,
    }
}

pub fn line_item(
    order_id: Uuid,
    quantity: i32,
    unit_price: i64,
    tax_inclusive_unit_price: Option<i64>,
) -> order_item::Model {
    order_item::Model {
        id: Uuid::new_v4(),
        order_id,
        variant_id: Uuid::new_v4(),
        title: "Widget".to_string(),
        quantity,
        unit_price,
        tax_inclusive_unit_price,
        created_at: Utc::now() - Duration::hours(2),
        updated_at: None,
    }
}

pub fn variant(unit_price: i64, tax_inclusive_unit_price: Option<i64>) -> product_variant::Model {
    product_variant::Model {
        id: Uuid::new_v4(),
        sku: "SKU-001".to_string(),
        title: "Gadget".to_string(),
        unit_price,
        tax_inclusive_unit_price,
    }
}

pub fn inventory(variant_id: Uuid, stocked: i32, reserved: i32) -> inventory_level::Model {
    inventory_level::Model {
        id: Uuid::new_v4(),
        variant_id,
        location_id: Uuid::new_v4(),
        stocked,
        reserved,
    }
}

/// Fully wired service over in-memory fakes, plus the event receiver.
pub struct TestHarness {
    pub store: InMemoryOrderStore,
    pub gateway: FakeGateway,
    pub queue: InMemoryCaptureQueue,
    pub service: OrderModificationService,
    pub events: tokio::sync::mpsc::Receiver<Event>,
}

pub fn harness() -> TestHarness {
    let store = InMemoryOrderStore::new();
    let gateway = FakeGateway::new();
    let queue = InMemoryCaptureQueue::new();
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let service = OrderModificationService::new(
        Arc::new(store.clone()),
        Arc::new(gateway.clone()),
        Arc::new(queue.clone()),
        TokenVerifier::new(TOKEN_SECRET),
        EventSender::new(tx),
    );
    TestHarness {
        store,
        gateway,
        queue,
        service,
        events: rx,
    }
}
