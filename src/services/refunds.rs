use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec};
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, EntityTrait};
use serde_json::json;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::order::{self, Entity as OrderEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    external::{NotificationClient, PaymentGateway, RefundHandle},
    models::{OrderStatus, PaymentStatus},
    services::order_status::{
        ensure_transition, OrderStatusService, TransitionCommand, TransitionOutcome,
    },
};

lazy_static! {
    static ref REFUNDS_INITIATED: IntCounter = IntCounter::new(
        "refunds_initiated_total",
        "Total number of refunds initiated with the gateway"
    )
    .expect("metric can be created");
    static ref REFUND_FAILURES: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "refund_failures_total",
            "Total number of failed refund initiations"
        ),
        &["error_type"]
    )
    .expect("metric can be created");
}

/// Initiates and tracks refunds for cancelled, paid orders.
///
/// Initiation calls the gateway first and only then records the state
/// change, so a gateway failure leaves the order exactly as it was and the
/// error surfaces to the caller. Finalization to REFUNDED happens only via
/// the asynchronous `refund.processed` webhook, never synchronously here.
#[derive(Clone)]
pub struct RefundCoordinator {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    status: OrderStatusService,
    notifier: Arc<dyn NotificationClient>,
    event_sender: EventSender,
    gateway_timeout: std::time::Duration,
}

impl RefundCoordinator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        status: OrderStatusService,
        notifier: Arc<dyn NotificationClient>,
        event_sender: EventSender,
        gateway_timeout: std::time::Duration,
    ) -> Self {
        Self {
            db,
            gateway,
            status,
            notifier,
            event_sender,
            gateway_timeout,
        }
    }

    #[instrument(skip(self, reason), fields(order_id = %order_id, amount = %amount))]
    pub async fn initiate(
        &self,
        order_id: Uuid,
        amount: Decimal,
        reason: &str,
        actor: &str,
    ) -> Result<order::Model, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        Self::validate_refundable(&order, amount)?;

        let handle = self.request_refund(&order, amount, reason).await.map_err(|e| {
            REFUND_FAILURES.with_label_values(&["gateway_error"]).inc();
            error!(error = %e, order_id = %order_id, "Refund initiation failed at the gateway");
            e
        })?;

        let now = Utc::now();
        let cmd = TransitionCommand {
            order_id: order.id,
            from: order.status,
            to: OrderStatus::RefundInitiated,
            actor: actor.to_string(),
            note: Some(reason.to_string()),
        };
        let extra = vec![
            (
                order::Column::PaymentStatus,
                PaymentStatus::RefundInitiated.into(),
            ),
            (
                order::Column::RefundId,
                sea_orm::Value::from(Some(handle.refund_id.clone())),
            ),
            (
                order::Column::RefundInitiatedAt,
                sea_orm::Value::from(Some(now)),
            ),
            (
                order::Column::RefundAmount,
                sea_orm::Value::from(Some(amount)),
            ),
            (
                order::Column::RefundReason,
                sea_orm::Value::from(Some(reason.to_string())),
            ),
        ];

        let updated = match self.status.apply(cmd, extra).await? {
            TransitionOutcome::Applied(updated) => updated,
            TransitionOutcome::Lost => {
                // The gateway has accepted the refund but the order moved
                // under us. Surface loudly; the refund id is in the logs and
                // the gateway's records for manual reconciliation.
                error!(
                    order_id = %order.id,
                    refund_id = %handle.refund_id,
                    "Order moved while recording refund initiation"
                );
                return Err(ServiceError::ConcurrentModification(order.id));
            }
        };

        REFUNDS_INITIATED.inc();
        info!(
            order_id = %updated.id,
            refund_id = %handle.refund_id,
            amount = %amount,
            "Refund initiated"
        );

        if let Err(e) = self
            .event_sender
            .send(Event::RefundInitiated {
                order_id: updated.id,
                refund_id: handle.refund_id.clone(),
                amount,
            })
            .await
        {
            warn!(error = %e, "Failed to send refund initiated event");
        }

        if let Err(e) = self
            .notifier
            .notify(
                updated.customer_id,
                "refund_initiated",
                json!({
                    "order_id": updated.id,
                    "order_number": updated.order_number,
                    "amount": amount,
                }),
            )
            .await
        {
            warn!(error = %e, order_id = %updated.id, "Failed to send refund initiated notification");
        }

        Ok(updated)
    }

    /// Preconditions for initiating a refund: a captured payment, no prior
    /// refund in flight or completed, a positive amount within the order
    /// total, and an order status the machine allows into REFUND_INITIATED.
    fn validate_refundable(order: &order::Model, amount: Decimal) -> Result<(), ServiceError> {
        if order.payment_id.is_none() {
            return Err(ServiceError::Conflict(format!(
                "Order {} has no captured payment to refund",
                order.id
            )));
        }

        if order.refund_id.is_some()
            || matches!(
                order.payment_status,
                PaymentStatus::RefundInitiated | PaymentStatus::Refunded
            )
        {
            return Err(ServiceError::Conflict(format!(
                "Order {} already has a refund in flight or completed",
                order.id
            )));
        }

        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Refund amount must be positive".to_string(),
            ));
        }

        if amount > order.total {
            return Err(ServiceError::ValidationError(format!(
                "Refund amount {} exceeds order total {}",
                amount, order.total
            )));
        }

        ensure_transition(order.status, OrderStatus::RefundInitiated)
    }

    async fn request_refund(
        &self,
        order: &order::Model,
        amount: Decimal,
        reason: &str,
    ) -> Result<RefundHandle, ServiceError> {
        let payment_id = order.payment_id.as_deref().ok_or_else(|| {
            ServiceError::Conflict(format!(
                "Order {} has no captured payment to refund",
                order.id
            ))
        })?;

        let call = self.gateway.initiate_refund(
            payment_id,
            amount,
            json!({
                "order_id": order.id,
                "order_number": order.order_number,
                "reason": reason,
            }),
        );

        match timeout(self.gateway_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::gateway_retryable(format!(
                "Refund initiation timed out after {:?}",
                self.gateway_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::gateway::MockPaymentGateway;
    use crate::models::PaymentMethod;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn paid_cancelled_order() -> order::Model {
        let now = Utc::now();
        order::Model {
            id: Uuid::new_v4(),
            order_number: "ORD202503090001".to_string(),
            customer_id: Uuid::new_v4(),
            status: OrderStatus::Cancelled,
            payment_status: PaymentStatus::Paid,
            payment_method: PaymentMethod::Gateway,
            subtotal: dec!(500.00),
            discount: dec!(0),
            delivery_charge: dec!(50.00),
            total: dec!(550.00),
            currency: "BDT".to_string(),
            delivery_address: "{}".to_string(),
            notes: None,
            payment_intent_id: Some("pi_1".to_string()),
            payment_id: Some("pay_1".to_string()),
            payment_signature: Some("sig".to_string()),
            refund_id: None,
            payment_expires_at: None,
            stock_reserved: false,
            cancelled_at: Some(now),
            cancel_reason: Some("customer request".to_string()),
            cancellation_initiator: Some("customer".to_string()),
            refund_initiated_at: None,
            refunded_at: None,
            refund_amount: None,
            refund_reason: None,
            created_at: now,
            updated_at: Some(now),
            version: 3,
        }
    }

    #[test]
    fn refund_requires_captured_payment() {
        let mut order = paid_cancelled_order();
        order.payment_id = None;
        let err = RefundCoordinator::validate_refundable(&order, dec!(100)).unwrap_err();
        assert_matches!(err, ServiceError::Conflict(_));
    }

    #[test]
    fn duplicate_refund_is_a_conflict() {
        let mut order = paid_cancelled_order();
        order.refund_id = Some("re_1".to_string());
        let err = RefundCoordinator::validate_refundable(&order, dec!(100)).unwrap_err();
        assert_matches!(err, ServiceError::Conflict(_));

        let mut order = paid_cancelled_order();
        order.payment_status = PaymentStatus::RefundInitiated;
        let err = RefundCoordinator::validate_refundable(&order, dec!(100)).unwrap_err();
        assert_matches!(err, ServiceError::Conflict(_));
    }

    #[test]
    fn refund_amount_bounds() {
        let order = paid_cancelled_order();
        assert_matches!(
            RefundCoordinator::validate_refundable(&order, dec!(0)).unwrap_err(),
            ServiceError::ValidationError(_)
        );
        assert_matches!(
            RefundCoordinator::validate_refundable(&order, dec!(550.01)).unwrap_err(),
            ServiceError::ValidationError(_)
        );
        assert!(RefundCoordinator::validate_refundable(&order, dec!(550.00)).is_ok());
    }

    #[test]
    fn refund_only_from_cancelled_orders() {
        let mut order = paid_cancelled_order();
        order.status = OrderStatus::Confirmed;
        let err = RefundCoordinator::validate_refundable(&order, dec!(100)).unwrap_err();
        assert_matches!(err, ServiceError::Conflict(_));
    }

    struct NoopNotifier;

    #[async_trait::async_trait]
    impl NotificationClient for NoopNotifier {
        async fn notify(
            &self,
            _customer_id: Uuid,
            _event_type: &str,
            _payload: serde_json::Value,
        ) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    fn coordinator_with(gateway: Arc<dyn PaymentGateway>) -> RefundCoordinator {
        let (event_sender, _rx) = crate::events::channel(4);
        let db = Arc::new(DatabaseConnection::Disconnected);
        RefundCoordinator::new(
            db.clone(),
            gateway,
            OrderStatusService::new(db, event_sender.clone()),
            Arc::new(NoopNotifier),
            event_sender,
            std::time::Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn gateway_timeout_surfaces_as_retryable() {
        struct SlowGateway;

        #[async_trait::async_trait]
        impl PaymentGateway for SlowGateway {
            async fn create_intent(
                &self,
                _amount: Decimal,
                _currency: &str,
                _reference: &str,
                _metadata: serde_json::Value,
            ) -> Result<crate::external::PaymentIntent, ServiceError> {
                unreachable!()
            }

            async fn verify_client_signature(
                &self,
                _intent_id: &str,
                _payment_id: &str,
                _signature: &str,
            ) -> Result<bool, ServiceError> {
                unreachable!()
            }

            async fn verify_webhook_signature(
                &self,
                _raw_payload: &[u8],
                _signature: &str,
            ) -> Result<bool, ServiceError> {
                unreachable!()
            }

            async fn initiate_refund(
                &self,
                _payment_id: &str,
                _amount: Decimal,
                _metadata: serde_json::Value,
            ) -> Result<RefundHandle, ServiceError> {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(RefundHandle {
                    refund_id: "re_never".to_string(),
                })
            }
        }

        let coordinator = coordinator_with(Arc::new(SlowGateway));
        let order = paid_cancelled_order();
        let err = coordinator
            .request_refund(&order, dec!(550.00), "cancelled")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn gateway_rejection_propagates_untouched() {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_initiate_refund()
            .returning(|_, _, _| Err(ServiceError::gateway_rejected("refund declined")));

        let coordinator = coordinator_with(Arc::new(gateway));
        let order = paid_cancelled_order();
        let err = coordinator
            .request_refund(&order, dec!(100.00), "cancelled")
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::GatewayError { retryable: false, .. });
    }
}
