use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;

/// One line of a customer's cart: a variant reference and a quantity.
/// Prices are deliberately absent; checkout re-prices against the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CartLine {
    pub product_id: Uuid,
    pub variant_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

/// Contract consumed from the cart subsystem.
#[async_trait]
pub trait CartClient: Send + Sync {
    /// The customer's current cart lines. An empty vec means no active cart.
    async fn active_cart(&self, customer_id: Uuid) -> Result<Vec<CartLine>, ServiceError>;

    /// Marks the cart converted after a successful checkout. Best-effort;
    /// checkout logs a failure and does not roll back.
    async fn mark_converted(&self, customer_id: Uuid) -> Result<(), ServiceError>;
}
