use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{OrderStatus, PaymentMethod, PaymentStatus};

/// The `orders` table.
///
/// Orders are created at checkout and mutated only through approved status
/// transitions; they are never deleted, so terminal orders remain available
/// for audit. Line items and the status history live in their own tables and
/// are owned exclusively by the order.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Human-readable, per-day order number. Unique across all orders.
    #[sea_orm(unique)]
    #[validate(length(min = 1, max = 50, message = "Order number must be between 1 and 50 characters"))]
    pub order_number: String,

    /// Weak reference to the customer who placed the order.
    pub customer_id: Uuid,

    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,

    pub subtotal: Decimal,
    pub discount: Decimal,
    pub delivery_charge: Decimal,
    /// Invariant: `total = subtotal - discount + delivery_charge >= 0`.
    pub total: Decimal,
    pub currency: String,

    /// JSON snapshot of the delivery address, frozen at checkout.
    pub delivery_address: String,
    pub notes: Option<String>,

    // Gateway correlation ids. Amounts and statuses are never taken from the
    // client; these ids are the only payer-supplied values the engine stores,
    // and only after signature verification.
    pub payment_intent_id: Option<String>,
    pub payment_id: Option<String>,
    pub payment_signature: Option<String>,
    pub refund_id: Option<String>,

    /// Tracked for a future payment-window expiry job; nothing cancels on it.
    pub payment_expires_at: Option<DateTime<Utc>>,

    /// Set while this order holds reserved stock; flipped off exactly once by
    /// the release path so retries never double-credit.
    pub stock_reserved: bool,

    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub cancellation_initiator: Option<String>,

    pub refund_initiated_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refund_amount: Option<Decimal>,
    pub refund_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::order_status_history::Entity")]
    StatusHistory,
    #[sea_orm(has_many = "super::payment_attempt::Entity")]
    PaymentAttempts,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::order_status_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StatusHistory.def()
    }
}

impl Related<super::payment_attempt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentAttempts.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        Ok(self)
    }
}
