use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Delivery-address snapshot frozen onto the order at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressSnapshot {
    pub recipient_name: String,
    pub phone: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub postal_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Contract consumed from the user/address subsystem.
#[async_trait]
pub trait AddressClient: Send + Sync {
    /// Resolves one of the customer's saved addresses. `None` when the
    /// address does not exist or belongs to a different customer.
    async fn get_address(
        &self,
        customer_id: Uuid,
        address_id: Uuid,
    ) -> Result<Option<AddressSnapshot>, ServiceError>;
}
