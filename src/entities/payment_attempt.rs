use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel a confirmation event arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptChannel {
    /// Client callback after the payer completed the gateway flow.
    Client,
    /// Server-to-server gateway notification.
    Webhook,
}

impl AttemptChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptChannel::Client => "client",
            AttemptChannel::Webhook => "webhook",
        }
    }
}

/// What the reconciler did with a confirmation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// The event won the conditional write and changed the order.
    Applied,
    /// A duplicate: the order was already in the target state.
    NoOp,
    /// Signature or intent verification failed.
    Rejected,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Applied => "applied",
            AttemptOutcome::NoOp => "no_op",
            AttemptOutcome::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(AttemptOutcome::Applied),
            "no_op" => Some(AttemptOutcome::NoOp),
            "rejected" => Some(AttemptOutcome::Rejected),
            _ => None,
        }
    }
}

/// The `payment_attempts` table.
///
/// One append-only row per confirmation event received on either channel,
/// kept for idempotency diagnostics and support. `order_id` is null when a
/// verified event could not be matched to any order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_attempts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub channel: String,
    /// Gateway event type: `payment.captured`, `payment.failed`,
    /// `refund.processed`, or `client.confirmation`.
    pub event_type: String,
    pub intent_id: Option<String>,
    pub payment_id: Option<String>,
    pub refund_id: Option<String>,
    pub signature_valid: bool,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;

        if insert {
            if let ActiveValue::NotSet = active_model.id {
                active_model.id = Set(Uuid::new_v4());
            }
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(Utc::now());
            }
        }

        Ok(active_model)
    }
}
