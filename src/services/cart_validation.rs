use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    errors::ServiceError,
    external::{CartLine, CatalogClient},
};

/// A cart line that survived re-validation, carrying the frozen price and
/// name snapshot that will become the order's line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedLine {
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub sku: String,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
}

/// Why a cart line was rejected during re-validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    Deleted,
    Deactivated,
    InsufficientStock { requested: i32, available: i32 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Deleted => write!(f, "product no longer exists"),
            RejectionReason::Deactivated => write!(f, "product is no longer available"),
            RejectionReason::InsufficientStock {
                requested,
                available,
            } => write!(
                f,
                "insufficient stock: requested {}, available {}",
                requested, available
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedLine {
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub reason: RejectionReason,
}

/// Re-priced, re-validated view of a cart at checkout time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartSnapshot {
    pub valid: Vec<PricedLine>,
    pub invalid: Vec<RejectedLine>,
}

impl CartSnapshot {
    pub fn subtotal(&self) -> Decimal {
        self.valid.iter().map(|line| line.line_total).sum()
    }
}

/// Re-prices and re-validates cart lines against live catalog data.
///
/// Read-only: no stock is touched here. Callers decide what to do with the
/// invalid partition; checkout rejects the whole cart when it is non-empty.
#[derive(Clone)]
pub struct CartSnapshotValidator {
    catalog: Arc<dyn CatalogClient>,
}

impl CartSnapshotValidator {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self { catalog }
    }

    #[instrument(skip(self, lines), fields(line_count = lines.len()))]
    pub async fn validate(&self, lines: &[CartLine]) -> Result<CartSnapshot, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::ValidationError("Cart is empty".to_string()));
        }

        let mut valid = Vec::with_capacity(lines.len());
        let mut invalid = Vec::new();

        for line in lines {
            line.validate()?;

            let snapshot = self
                .catalog
                .get_variant(line.product_id, line.variant_id)
                .await?;

            let Some(variant) = snapshot else {
                invalid.push(RejectedLine {
                    product_id: line.product_id,
                    variant_id: line.variant_id,
                    reason: RejectionReason::Deleted,
                });
                continue;
            };

            if !variant.active {
                invalid.push(RejectedLine {
                    product_id: line.product_id,
                    variant_id: line.variant_id,
                    reason: RejectionReason::Deactivated,
                });
                continue;
            }

            if variant.stock < line.quantity {
                invalid.push(RejectedLine {
                    product_id: line.product_id,
                    variant_id: line.variant_id,
                    reason: RejectionReason::InsufficientStock {
                        requested: line.quantity,
                        available: variant.stock,
                    },
                });
                continue;
            }

            let unit_price = variant.selling_price;
            valid.push(PricedLine {
                product_id: line.product_id,
                variant_id: line.variant_id,
                sku: variant.sku,
                name: variant.product_name,
                unit_price,
                quantity: line.quantity,
                line_total: unit_price * Decimal::from(line.quantity),
            });
        }

        if !invalid.is_empty() {
            warn!(
                invalid_count = invalid.len(),
                "Cart re-validation rejected lines"
            );
        }

        if valid.is_empty() {
            let detail = invalid
                .iter()
                .map(|r| format!("variant {}: {}", r.variant_id, r.reason))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ServiceError::ValidationError(format!(
                "No valid items in cart: {}",
                detail
            )));
        }

        Ok(CartSnapshot { valid, invalid })
    }
}
