use uuid::Uuid;

/// Saga operation kinds that adjust the external authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Operation {
    #[strum(serialize = "add-item")]
    AddItem,
    #[strum(serialize = "update-quantity")]
    UpdateQuantity,
}

/// Derives the idempotency key for an authorization adjustment.
///
/// Pure function of the request's stable identifiers: no I/O, no
/// randomness, no wall-clock input. Two submissions with different
/// `request_id`s are distinct logical attempts; callers that supply a
/// stable `request_id` per user action get deduplication on retry.
pub fn derive_key(
    operation: Operation,
    order_id: Uuid,
    item_or_variant_id: Uuid,
    quantity: i32,
    request_id: &str,
) -> String {
    format!("{operation}-{order_id}-{item_or_variant_id}-{quantity}-{request_id}")
}
