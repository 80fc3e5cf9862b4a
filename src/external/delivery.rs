use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// Result of a service-area check for a delivery point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServiceAreaCheck {
    pub deliverable: bool,
    /// Maximum deliverable radius in kilometres, reported back to the
    /// customer when the check fails.
    pub max_radius_km: f64,
}

/// Result of the minimum-order-value check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinimumOrderCheck {
    pub met: bool,
    pub minimum: Decimal,
}

/// Contract consumed from the delivery-eligibility subsystem.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn is_within_service_area(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<ServiceAreaCheck, ServiceError>;

    async fn calculate_delivery_charge(&self, subtotal: Decimal) -> Result<Decimal, ServiceError>;

    async fn meets_minimum_order_value(
        &self,
        subtotal: Decimal,
    ) -> Result<MinimumOrderCheck, ServiceError>;
}
