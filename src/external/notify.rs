use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Contract consumed from the notification subsystem.
///
/// Fire-and-forget from the engine's point of view: callers log a failure at
/// `warn!` and never roll back an order-status change because a notification
/// could not be delivered.
#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn notify(
        &self,
        customer_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), ServiceError>;
}
