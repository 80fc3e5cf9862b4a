use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status for stock reservation journal rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Decrements applied, order row not yet persisted.
    Pending,
    /// Order persisted; the reservation belongs to that order.
    Committed,
    /// Decrements reversed, either by cancellation or by the stale sweep.
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReservationStatus::Pending),
            "committed" => Some(ReservationStatus::Committed),
            "released" => Some(ReservationStatus::Released),
            _ => None,
        }
    }
}

/// One reserved line inside a journal row, serialized into the `lines` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedLine {
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
}

/// The `stock_reservations` table.
///
/// Journal of the reserve/commit/release saga around checkout. A row is
/// written `pending` before any stock is decremented and stamped `committed`
/// only after the order row exists, so a crash between the two phases leaves
/// a detectable `pending` row for the reconciliation sweep.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_reservations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub status: String,
    /// JSON-encoded `Vec<ReservedLine>`.
    pub lines: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn reserved_lines(&self) -> Result<Vec<ReservedLine>, serde_json::Error> {
        serde_json::from_str(&self.lines)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.id {
                active_model.id = Set(Uuid::new_v4());
            }
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        }

        active_model.updated_at = Set(Some(now));

        Ok(active_model)
    }
}
