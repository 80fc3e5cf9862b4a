use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity},
        order_item::{self, Entity as OrderItemEntity},
        order_status_history::{self, Entity as OrderStatusHistoryEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    external::{AuditClient, NotificationClient},
    models::{OrderStatus, PaymentMethod, PaymentStatus},
    services::{
        order_status::{
            ensure_transition, OrderStatusService, TransitionCommand, TransitionOutcome,
        },
        refunds::RefundCoordinator,
        stock_reservation::StockReservationManager,
    },
};

/// An order with its line items and full status timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub history: Vec<order_status_history::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderListPage {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Order workflow beyond checkout: lookups, operator-driven fulfillment
/// progression, and cancellation with its compensating actions.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    status: OrderStatusService,
    reservations: StockReservationManager,
    refunds: RefundCoordinator,
    notifier: Arc<dyn NotificationClient>,
    audit: Arc<dyn AuditClient>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        status: OrderStatusService,
        reservations: StockReservationManager,
        refunds: RefundCoordinator,
        notifier: Arc<dyn NotificationClient>,
        audit: Arc<dyn AuditClient>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            status,
            reservations,
            refunds,
            notifier,
            audit,
            event_sender,
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    #[instrument(skip(self))]
    pub async fn get_order_by_number(&self, order_number: &str) -> Result<order::Model, ServiceError> {
        OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))
    }

    /// The order plus its items and status timeline, the human-readable
    /// reconstruction of everything that happened to it.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn order_details(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = self.get_order(order_id).await?;

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;

        let history = OrderStatusHistoryEntity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(OrderDetails {
            order,
            items,
            history,
        })
    }

    /// Lists a customer's orders, newest first.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn list_orders(
        &self,
        customer_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListPage, ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }
        if per_page == 0 || per_page > 100 {
            return Err(ServiceError::ValidationError(
                "Page size must be between 1 and 100".to_string(),
            ));
        }

        let paginator = OrderEntity::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        Ok(OrderListPage {
            orders,
            total,
            page,
            per_page,
        })
    }

    /// Operator-driven status progression.
    ///
    /// CANCELLED routes through `cancel_order` so its compensations run; the
    /// refund states are owned by the refund workflow and rejected here.
    /// DELIVERED on a cash-on-delivery order also marks the payment PAID.
    #[instrument(skip(self, note), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn transition_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        actor: &str,
        note: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        match new_status {
            OrderStatus::Cancelled => {
                let reason = note.unwrap_or_else(|| "Cancelled by operator".to_string());
                return self.cancel_order(order_id, actor, &reason).await;
            }
            OrderStatus::RefundInitiated | OrderStatus::Refunded => {
                return Err(ServiceError::InvalidOperation(format!(
                    "Status '{}' is managed by the refund workflow",
                    new_status
                )));
            }
            _ => {}
        }

        let order = self.get_order(order_id).await?;
        ensure_transition(order.status, new_status)?;

        let mut extra: Vec<(order::Column, sea_orm::Value)> = Vec::new();
        if new_status == OrderStatus::Delivered
            && order.payment_method == PaymentMethod::CashOnDelivery
        {
            extra.push((
                order::Column::PaymentStatus,
                PaymentStatus::Paid.into(),
            ));
        }

        let cmd = TransitionCommand {
            order_id,
            from: order.status,
            to: new_status,
            actor: actor.to_string(),
            note,
        };

        let updated = match self.status.apply(cmd, extra).await? {
            TransitionOutcome::Applied(updated) => updated,
            TransitionOutcome::Lost => {
                return Err(ServiceError::ConcurrentModification(order_id));
            }
        };

        if let Err(e) = self
            .notifier
            .notify(
                updated.customer_id,
                "order_status_updated",
                json!({
                    "order_id": updated.id,
                    "order_number": updated.order_number,
                    "status": updated.status,
                }),
            )
            .await
        {
            warn!(error = %e, order_id = %updated.id, "Failed to send status notification");
        }

        self.audit_status_change(actor, &order, &updated).await;

        Ok(updated)
    }

    /// Cancels an order and runs its compensations: stock release (guarded by
    /// the persisted flag) and, for a paid order, refund initiation.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> Result<order::Model, ServiceError> {
        let order = self.get_order(order_id).await?;
        ensure_transition(order.status, OrderStatus::Cancelled)?;

        let was_paid = order.payment_status == PaymentStatus::Paid;

        let cmd = TransitionCommand {
            order_id,
            from: order.status,
            to: OrderStatus::Cancelled,
            actor: actor.to_string(),
            note: Some(reason.to_string()),
        };
        let extra = vec![
            (
                order::Column::CancelledAt,
                sea_orm::Value::from(Some(Utc::now())),
            ),
            (
                order::Column::CancelReason,
                sea_orm::Value::from(Some(reason.to_string())),
            ),
            (
                order::Column::CancellationInitiator,
                sea_orm::Value::from(Some(actor.to_string())),
            ),
        ];

        let cancelled = match self.status.apply(cmd, extra).await? {
            TransitionOutcome::Applied(updated) => updated,
            TransitionOutcome::Lost => {
                return Err(ServiceError::ConcurrentModification(order_id));
            }
        };

        self.reservations.release(&cancelled).await?;

        if let Err(e) = self.event_sender.send(Event::OrderCancelled(order_id)).await {
            warn!(error = %e, order_id = %order_id, "Failed to send order cancelled event");
        }

        if let Err(e) = self
            .notifier
            .notify(
                cancelled.customer_id,
                "order_cancelled",
                json!({
                    "order_id": cancelled.id,
                    "order_number": cancelled.order_number,
                    "reason": reason,
                }),
            )
            .await
        {
            warn!(error = %e, order_id = %order_id, "Failed to send cancellation notification");
        }

        self.audit_status_change(actor, &order, &cancelled).await;

        if !was_paid {
            return Ok(cancelled);
        }

        // Paid order: money must flow back. A gateway failure here leaves the
        // order CANCELLED with stock restored and surfaces to the caller, who
        // retries the refund; the duplicate-refund guard keeps that safe.
        match self
            .refunds
            .initiate(order_id, cancelled.total, reason, actor)
            .await
        {
            Ok(refunding) => Ok(refunding),
            Err(e) => {
                error!(
                    error = %e,
                    order_id = %order_id,
                    "Cancellation complete but refund initiation failed"
                );
                Err(e)
            }
        }
    }

    async fn audit_status_change(&self, actor: &str, before: &order::Model, after: &order::Model) {
        if let Err(e) = self
            .audit
            .record(
                actor,
                "order.status_change",
                "order",
                &after.id.to_string(),
                Some(json!({ "status": before.status })),
                Some(json!({ "status": after.status })),
            )
            .await
        {
            warn!(error = %e, order_id = %after.id, "Failed to write audit record");
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn payment_attempts(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<crate::entities::payment_attempt::Model>, ServiceError> {
        use crate::entities::payment_attempt::{self, Entity as PaymentAttemptEntity};

        Ok(PaymentAttemptEntity::find()
            .filter(payment_attempt::Column::OrderId.eq(order_id))
            .order_by_asc(payment_attempt::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }
}
