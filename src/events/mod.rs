use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::OrderStatus;

/// Events emitted by the order engine after a state change has committed.
///
/// Emission is best-effort: a full or closed channel is logged by the caller
/// and never rolls back the write that produced the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled(Uuid),
    PaymentConfirmed {
        order_id: Uuid,
        payment_id: String,
    },
    PaymentFailed {
        order_id: Uuid,
    },
    StockReserved {
        reservation_id: Uuid,
        line_count: usize,
    },
    StockReleased {
        order_id: Uuid,
    },
    RefundInitiated {
        order_id: Uuid,
        refund_id: String,
        amount: Decimal,
    },
    RefundCompleted {
        order_id: Uuid,
        completed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Builds a sender/receiver pair with a bounded queue.
pub fn channel(buffer: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(buffer);
    (EventSender::new(tx), rx)
}

/// Drains the event queue, logging each event. Deployments that fan events
/// out to a real bus replace this loop with their own consumer.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    info!("Event processor started");
    while let Some(event) = receiver.recv().await {
        debug!(?event, "Processing event");
    }
    info!("Event processor stopped");
}
