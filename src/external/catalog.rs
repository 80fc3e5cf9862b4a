use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Live pricing and stock for a single purchasable variant, as the catalog
/// sees it right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSnapshot {
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub product_name: String,
    pub sku: String,
    /// List price before any discount.
    pub price: Decimal,
    /// Price the customer actually pays; frozen into the line item.
    pub selling_price: Decimal,
    pub stock: i32,
    pub active: bool,
}

/// Outcome of a conditional stock decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// Stock was at least the requested quantity and has been decremented.
    Applied,
    /// The precondition failed; nothing changed.
    InsufficientStock { available: i32 },
    /// The variant no longer exists; nothing changed.
    VariantMissing,
}

/// Outcome of a stock increment (the release direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    Applied,
    /// The variant was deleted in the interim; release skips it.
    VariantMissing,
}

/// Contract consumed from the catalog subsystem.
///
/// The decrement is the catalog's own atomic conditional update (stock is
/// only reduced where `stock >= quantity`); the engine builds its
/// all-or-nothing reservation on top of that per-variant guarantee.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn get_variant(
        &self,
        product_id: Uuid,
        variant_id: Uuid,
    ) -> Result<Option<VariantSnapshot>, ServiceError>;

    async fn decrement_stock(
        &self,
        product_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<DecrementOutcome, ServiceError>;

    async fn increment_stock(
        &self,
        product_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<IncrementOutcome, ServiceError>;

    /// Adjusts the product's sales counter. `quantity` is negative when a
    /// cancelled order reverses its sale.
    async fn increment_sales_counter(
        &self,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError>;
}
