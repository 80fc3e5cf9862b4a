use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Enum representing the possible statuses of an order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum OrderStatus {
    #[sea_orm(string_value = "Placed")]
    Placed,
    #[sea_orm(string_value = "PaymentPending")]
    PaymentPending,
    #[sea_orm(string_value = "PaymentFailed")]
    PaymentFailed,
    #[sea_orm(string_value = "Confirmed")]
    Confirmed,
    #[sea_orm(string_value = "Packed")]
    Packed,
    #[sea_orm(string_value = "ReadyToDeliver")]
    ReadyToDeliver,
    #[sea_orm(string_value = "HandedToAgent")]
    HandedToAgent,
    #[sea_orm(string_value = "Delivered")]
    Delivered,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
    #[sea_orm(string_value = "RefundInitiated")]
    RefundInitiated,
    #[sea_orm(string_value = "Refunded")]
    Refunded,
}

impl OrderStatus {
    /// Terminal orders persist for audit and accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Refunded)
    }
}

/// Enum representing the payment state of an order, tracked independently of
/// the fulfillment status.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "Pending")]
    Pending,
    #[sea_orm(string_value = "Paid")]
    Paid,
    #[sea_orm(string_value = "Failed")]
    Failed,
    #[sea_orm(string_value = "RefundInitiated")]
    RefundInitiated,
    #[sea_orm(string_value = "Refunded")]
    Refunded,
}

/// Enum representing how the customer pays for an order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum PaymentMethod {
    /// Online payment through the external gateway.
    #[sea_orm(string_value = "Gateway")]
    Gateway,
    /// Settled in cash when the order is delivered.
    #[sea_orm(string_value = "CashOnDelivery")]
    CashOnDelivery,
}
