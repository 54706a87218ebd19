use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted by the cart, checkout, and settlement services.
///
/// Events are published after the originating state change has committed,
/// so consumers never observe an event for state that was rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartItemAdded {
        cart_id: Uuid,
        product_id: Uuid,
    },
    CartItemRemoved {
        cart_id: Uuid,
        product_id: Uuid,
    },
    CartCleared(Uuid),
    CartsMerged {
        guest_cart_id: Uuid,
        customer_cart_id: Uuid,
    },

    // Checkout / settlement events
    CheckoutSubmitted {
        cart_id: Uuid,
        settlement_id: Uuid,
    },
    SettlementOpened(Uuid),
    SettlementSucceeded {
        settlement_id: Uuid,
        order_id: Uuid,
    },
    SettlementFailed {
        settlement_id: Uuid,
        reason: String,
    },

    // Order / inventory events
    OrderCreated(Uuid),
    CouponRedeemed {
        coupon_id: Uuid,
        order_id: Uuid,
    },
    StockDecremented {
        product_id: Uuid,
        quantity: i32,
        reference_id: Uuid,
    },
}

/// Handle for publishing events onto the application event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, surfacing channel failures to the caller.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Best-effort send. A full or closed channel is logged and dropped;
    /// event delivery is not durable and must never fail a request.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("event dropped: {}", e);
        }
    }
}

/// Drains the event channel, logging each event. Runs until every sender
/// handle is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::SettlementSucceeded {
                settlement_id,
                order_id,
            } => {
                info!(%settlement_id, %order_id, "settlement succeeded");
            }
            Event::SettlementFailed {
                settlement_id,
                reason,
            } => {
                info!(%settlement_id, %reason, "settlement failed");
            }
            other => {
                info!(event = ?other, "event received");
            }
        }
    }

    info!("event channel closed, stopping event processing loop");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_delivers_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);

        sender.send(Event::CartCreated(Uuid::new_v4())).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Event::CartCreated(_))));
    }

    #[tokio::test]
    async fn test_send_or_log_swallows_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        // Must not panic or error out.
        sender.send_or_log(Event::CartCleared(Uuid::new_v4())).await;
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let event = Event::SettlementFailed {
            settlement_id: Uuid::new_v4(),
            reason: "user_cancelled".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Event::SettlementFailed { .. }));
    }
}
