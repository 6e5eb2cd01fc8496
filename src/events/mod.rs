use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Domain events emitted by the modification saga and the
/// reconciliation job. Consumed by the notification collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderItemAdded {
        order_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    },
    OrderItemQuantityChanged {
        order_id: Uuid,
        item_id: Uuid,
        old_quantity: i32,
        new_quantity: i32,
    },
    OrderCanceled {
        order_id: Uuid,
        void_failed: bool,
    },
    AuthorizationAdjusted {
        order_id: Uuid,
        authorization_id: String,
        previous_amount: i64,
        new_amount: i64,
    },
    CaptureRequeued {
        order_id: Uuid,
        source: String,
    },
    CaptureFailedAlert {
        order_id: Uuid,
        authorization_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event; delivery failures are reported, never fatal to
    /// the saga that already committed.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("failed to send event: {e}"))
    }
}

/// Creates the shared event channel.
pub fn channel() -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(1024);
    (EventSender::new(tx), rx)
}

/// Drains events, logging them and handing notification-worthy ones to
/// the out-of-process notifier (a collaborator; here the hook is a log
/// line).
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::CaptureFailedAlert {
                order_id,
                authorization_id,
            } => {
                error!(
                    critical = true,
                    order_id = %order_id,
                    authorization_id = %authorization_id,
                    "capture job failed and was not re-queued; manual follow-up required"
                );
            }
            Event::OrderCanceled {
                order_id,
                void_failed: true,
            } => {
                warn!(
                    order_id = %order_id,
                    "order canceled but authorization void failed; flagged for manual intervention"
                );
            }
            other => {
                info!(event = ?other, "domain event");
            }
        }
    }
    info!("event channel closed; event processor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let (sender, mut rx) = channel();
        let order_id = Uuid::new_v4();

        sender
            .send(Event::OrderCanceled {
                order_id,
                void_failed: false,
            })
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Event::OrderCanceled {
                order_id: received, ..
            } => assert_eq!(received, order_id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
