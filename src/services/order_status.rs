use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity},
        order_status_history,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    models::OrderStatus,
};

/// Whether the status machine permits `from -> to`.
///
/// PLACED is the initial state; DELIVERED and REFUNDED are terminal. The
/// machine is a pure decision function: side effects (stock release, refund
/// initiation, notifications) belong to the calling workflow.
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Placed, Confirmed)
            | (Placed, PaymentPending)
            | (Placed, PaymentFailed)
            | (Placed, Cancelled)
            | (PaymentPending, Confirmed)
            | (PaymentPending, PaymentFailed)
            | (PaymentPending, Cancelled)
            | (PaymentFailed, Cancelled)
            | (Confirmed, Packed)
            | (Confirmed, Cancelled)
            | (Packed, ReadyToDeliver)
            | (Packed, Cancelled)
            | (ReadyToDeliver, HandedToAgent)
            | (HandedToAgent, Delivered)
            | (Cancelled, RefundInitiated)
            | (RefundInitiated, Refunded)
    )
}

/// Errors with a conflict naming both states unless the transition is legal.
pub fn ensure_transition(from: OrderStatus, to: OrderStatus) -> Result<(), ServiceError> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(ServiceError::Conflict(format!(
            "Cannot transition order from '{}' to '{}'",
            from, to
        )))
    }
}

/// An attempted transition, with the expected current status.
#[derive(Debug, Clone)]
pub struct TransitionCommand {
    pub order_id: Uuid,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub actor: String,
    pub note: Option<String>,
}

/// What happened to a transition attempt.
///
/// `Lost` means another writer moved the order out of the expected status
/// first; per the race policy the loser observes post-update state and
/// no-ops instead of erroring.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(order::Model),
    Lost,
}

/// Applies status transitions with a single conditional write keyed on the
/// current status, appending exactly one history row per accepted
/// transition. This conditional write is the only concurrency guard the
/// engine needs; there is no in-process lock to take.
#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl OrderStatusService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Attempts `cmd`, atomically updating `extra` columns alongside the
    /// status when the conditional write wins.
    #[instrument(skip(self, cmd, extra), fields(order_id = %cmd.order_id, from = %cmd.from, to = %cmd.to))]
    pub async fn apply(
        &self,
        cmd: TransitionCommand,
        extra: Vec<(order::Column, sea_orm::Value)>,
    ) -> Result<TransitionOutcome, ServiceError> {
        ensure_transition(cmd.from, cmd.to)?;

        // The status write and its history row commit together so the last
        // history entry always matches the current status.
        let txn = self.db.begin().await?;

        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(cmd.to))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(cmd.order_id))
            .filter(order::Column::Status.eq(cmd.from));

        for (column, value) in extra {
            update = update.col_expr(column, Expr::value(value));
        }

        let result = update.exec(&txn).await?;

        if result.rows_affected == 0 {
            txn.commit().await?;
            info!(
                order_id = %cmd.order_id,
                "Conditional status write lost; order already moved"
            );
            return Ok(TransitionOutcome::Lost);
        }

        let history = order_status_history::ActiveModel {
            order_id: Set(cmd.order_id),
            status: Set(cmd.to),
            actor: Set(cmd.actor.clone()),
            note: Set(cmd.note.clone()),
            ..Default::default()
        };
        history.insert(&txn).await?;

        txn.commit().await?;

        let updated = OrderEntity::find_by_id(cmd.order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", cmd.order_id))
            })?;

        info!(
            order_id = %cmd.order_id,
            from = %cmd.from,
            to = %cmd.to,
            actor = %cmd.actor,
            "Order status updated"
        );

        if let Err(e) = self
            .event_sender
            .send(Event::OrderStatusChanged {
                order_id: cmd.order_id,
                old_status: cmd.from,
                new_status: cmd.to,
            })
            .await
        {
            warn!(error = %e, order_id = %cmd.order_id, "Failed to send status changed event");
        }

        Ok(TransitionOutcome::Applied(updated))
    }
}
