use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity},
        payment_attempt::{self, AttemptChannel, AttemptOutcome},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    external::{NotificationClient, PaymentGateway},
    models::{OrderStatus, PaymentStatus},
    services::{
        order_status::{OrderStatusService, TransitionCommand, TransitionOutcome},
        stock_reservation::StockReservationManager,
    },
};

lazy_static! {
    static ref PAYMENT_CONFIRMATIONS: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "payment_confirmations_total",
            "Total number of applied payment confirmations"
        ),
        &["channel"]
    )
    .expect("metric can be created");
    static ref DUPLICATE_CONFIRMATIONS: IntCounter = IntCounter::new(
        "duplicate_payment_confirmations_total",
        "Confirmation events that found the order already settled"
    )
    .expect("metric can be created");
    static ref SIGNATURE_REJECTIONS: IntCounter = IntCounter::new(
        "payment_signature_rejections_total",
        "Confirmation events rejected on signature verification"
    )
    .expect("metric can be created");
}

/// Signed server-to-server event from the payment gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
    #[serde(rename = "payment.captured")]
    PaymentCaptured {
        intent_id: String,
        payment_id: String,
    },

    #[serde(rename = "payment.failed")]
    PaymentFailed {
        intent_id: String,
        reason: Option<String>,
    },

    #[serde(rename = "refund.processed")]
    RefundProcessed {
        payment_id: String,
        refund_id: String,
        amount: Decimal,
    },
}

impl GatewayEvent {
    fn event_type(&self) -> &'static str {
        match self {
            GatewayEvent::PaymentCaptured { .. } => "payment.captured",
            GatewayEvent::PaymentFailed { .. } => "payment.failed",
            GatewayEvent::RefundProcessed { .. } => "refund.processed",
        }
    }
}

/// Acknowledgement returned to the webhook transport. Gateways retry until
/// they see an ack, so every verified event acks even when it is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub event_type: String,
    pub outcome: AttemptOutcome,
}

/// Converges the client-confirmation path and the webhook path into one
/// idempotent status update.
///
/// Both paths end in the same conditional write keyed on the order's current
/// status: whichever arrives first performs the transition, the other
/// observes post-update state and no-ops. No lock is taken anywhere.
#[derive(Clone)]
pub struct PaymentReconciler {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    status: OrderStatusService,
    reservations: StockReservationManager,
    notifier: Arc<dyn NotificationClient>,
    event_sender: EventSender,
    gateway_timeout: std::time::Duration,
}

impl PaymentReconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        status: OrderStatusService,
        reservations: StockReservationManager,
        notifier: Arc<dyn NotificationClient>,
        event_sender: EventSender,
        gateway_timeout: std::time::Duration,
    ) -> Self {
        Self {
            db,
            gateway,
            status,
            reservations,
            notifier,
            event_sender,
            gateway_timeout,
        }
    }

    /// Client-callback confirmation path.
    ///
    /// Verifies the stored intent id and the gateway signature before
    /// trusting anything from the client; amounts and statuses are always
    /// re-derived from the engine's own records.
    #[instrument(skip(self, signature), fields(order_id = %order_id, intent_id = %intent_id))]
    pub async fn confirm_client_payment(
        &self,
        order_id: Uuid,
        intent_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<order::Model, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let intent_matches = order.payment_intent_id.as_deref() == Some(intent_id);
        let signature_valid = intent_matches
            && self
                .verify_client_signature(intent_id, payment_id, signature)
                .await?;

        if !signature_valid {
            SIGNATURE_REJECTIONS.inc();
            self.record_attempt(
                Some(order.id),
                AttemptChannel::Client,
                "client.confirmation",
                Some(intent_id),
                Some(payment_id),
                None,
                false,
                AttemptOutcome::Rejected,
            )
            .await;

            self.fail_payment(&order, "Client confirmation rejected: signature verification failed")
                .await?;

            return Err(ServiceError::InvalidSignature(format!(
                "Payment confirmation for order {} failed verification",
                order_id
            )));
        }

        let (updated, outcome) = self
            .apply_capture(order, payment_id, Some(signature), AttemptChannel::Client)
            .await?;

        self.record_attempt(
            Some(updated.id),
            AttemptChannel::Client,
            "client.confirmation",
            Some(intent_id),
            Some(payment_id),
            None,
            true,
            outcome,
        )
        .await;

        Ok(updated)
    }

    /// Webhook confirmation path. The payload signature is verified before
    /// the payload is even parsed; unverified bytes never touch an order.
    #[instrument(skip(self, raw_payload, signature))]
    pub async fn handle_webhook(
        &self,
        raw_payload: &[u8],
        signature: &str,
    ) -> Result<WebhookAck, ServiceError> {
        let verified = self.verify_webhook_signature(raw_payload, signature).await?;
        if !verified {
            SIGNATURE_REJECTIONS.inc();
            self.record_attempt(
                None,
                AttemptChannel::Webhook,
                "unverified",
                None,
                None,
                None,
                false,
                AttemptOutcome::Rejected,
            )
            .await;
            return Err(ServiceError::InvalidSignature(
                "Webhook payload failed signature verification".to_string(),
            ));
        }

        let event: GatewayEvent = serde_json::from_slice(raw_payload).map_err(|e| {
            ServiceError::ValidationError(format!("Unparseable webhook payload: {}", e))
        })?;

        let event_type = event.event_type().to_string();
        let outcome = match event {
            GatewayEvent::PaymentCaptured {
                intent_id,
                payment_id,
            } => self.webhook_captured(&intent_id, &payment_id).await?,
            GatewayEvent::PaymentFailed { intent_id, reason } => {
                self.webhook_failed(&intent_id, reason.as_deref()).await?
            }
            GatewayEvent::RefundProcessed {
                payment_id,
                refund_id,
                amount,
            } => self.webhook_refund(&payment_id, &refund_id, amount).await?,
        };

        Ok(WebhookAck {
            event_type,
            outcome,
        })
    }

    async fn webhook_captured(
        &self,
        intent_id: &str,
        payment_id: &str,
    ) -> Result<AttemptOutcome, ServiceError> {
        let Some(order) = self.find_by_intent(intent_id).await? else {
            warn!(intent_id = %intent_id, "Captured event matches no order");
            self.record_attempt(
                None,
                AttemptChannel::Webhook,
                "payment.captured",
                Some(intent_id),
                Some(payment_id),
                None,
                true,
                AttemptOutcome::NoOp,
            )
            .await;
            return Ok(AttemptOutcome::NoOp);
        };

        let order_id = order.id;
        let (_, outcome) = self
            .apply_capture(order, payment_id, None, AttemptChannel::Webhook)
            .await?;

        self.record_attempt(
            Some(order_id),
            AttemptChannel::Webhook,
            "payment.captured",
            Some(intent_id),
            Some(payment_id),
            None,
            true,
            outcome,
        )
        .await;

        Ok(outcome)
    }

    async fn webhook_failed(
        &self,
        intent_id: &str,
        reason: Option<&str>,
    ) -> Result<AttemptOutcome, ServiceError> {
        let Some(order) = self.find_by_intent(intent_id).await? else {
            warn!(intent_id = %intent_id, "Failed event matches no order");
            return Ok(AttemptOutcome::NoOp);
        };

        let note = match reason {
            Some(reason) => format!("Gateway reported payment failure: {}", reason),
            None => "Gateway reported payment failure".to_string(),
        };
        let applied = self.fail_payment(&order, &note).await?;

        let outcome = if applied {
            AttemptOutcome::Applied
        } else {
            AttemptOutcome::NoOp
        };
        self.record_attempt(
            Some(order.id),
            AttemptChannel::Webhook,
            "payment.failed",
            Some(intent_id),
            None,
            None,
            true,
            outcome,
        )
        .await;

        Ok(outcome)
    }

    async fn webhook_refund(
        &self,
        payment_id: &str,
        refund_id: &str,
        amount: Decimal,
    ) -> Result<AttemptOutcome, ServiceError> {
        let Some(order) = OrderEntity::find()
            .filter(order::Column::PaymentId.eq(payment_id))
            .one(&*self.db)
            .await?
        else {
            warn!(payment_id = %payment_id, "Refund event matches no order");
            return Ok(AttemptOutcome::NoOp);
        };

        if order.refund_id.as_deref() != Some(refund_id) {
            self.record_attempt(
                Some(order.id),
                AttemptChannel::Webhook,
                "refund.processed",
                None,
                Some(payment_id),
                Some(refund_id),
                true,
                AttemptOutcome::Rejected,
            )
            .await;
            return Err(ServiceError::Conflict(format!(
                "Refund {} does not match the refund recorded for order {}",
                refund_id, order.id
            )));
        }

        if order.status == OrderStatus::Refunded {
            DUPLICATE_CONFIRMATIONS.inc();
            self.record_attempt(
                Some(order.id),
                AttemptChannel::Webhook,
                "refund.processed",
                None,
                Some(payment_id),
                Some(refund_id),
                true,
                AttemptOutcome::NoOp,
            )
            .await;
            return Ok(AttemptOutcome::NoOp);
        }

        let completed_at = Utc::now();
        let cmd = TransitionCommand {
            order_id: order.id,
            from: OrderStatus::RefundInitiated,
            to: OrderStatus::Refunded,
            actor: "gateway-webhook".to_string(),
            note: Some(format!("Refund {} processed", refund_id)),
        };
        let extra = vec![
            (
                order::Column::PaymentStatus,
                PaymentStatus::Refunded.into(),
            ),
            (
                order::Column::RefundedAt,
                sea_orm::Value::from(Some(completed_at)),
            ),
            (
                order::Column::RefundAmount,
                sea_orm::Value::from(Some(amount)),
            ),
        ];

        let outcome = match self.status.apply(cmd, extra).await? {
            TransitionOutcome::Applied(updated) => {
                info!(order_id = %updated.id, refund_id = %refund_id, "Refund completed");

                if let Err(e) = self
                    .event_sender
                    .send(Event::RefundCompleted {
                        order_id: updated.id,
                        completed_at,
                    })
                    .await
                {
                    warn!(error = %e, "Failed to send refund completed event");
                }

                if let Err(e) = self
                    .notifier
                    .notify(
                        updated.customer_id,
                        "refund_completed",
                        json!({
                            "order_id": updated.id,
                            "order_number": updated.order_number,
                            "amount": amount,
                        }),
                    )
                    .await
                {
                    warn!(error = %e, order_id = %updated.id, "Failed to send refund completed notification");
                }

                AttemptOutcome::Applied
            }
            TransitionOutcome::Lost => {
                DUPLICATE_CONFIRMATIONS.inc();
                AttemptOutcome::NoOp
            }
        };

        self.record_attempt(
            Some(order.id),
            AttemptChannel::Webhook,
            "refund.processed",
            None,
            Some(payment_id),
            Some(refund_id),
            true,
            outcome,
        )
        .await;

        Ok(outcome)
    }

    /// The single conditional update both confirmation paths converge on.
    ///
    /// Returns the (possibly unchanged) order and whether this caller applied
    /// the transition. A duplicate event against an already-settled order is
    /// a silent no-op: no history row, no notification, no error.
    async fn apply_capture(
        &self,
        order: order::Model,
        payment_id: &str,
        signature: Option<&str>,
        channel: AttemptChannel,
    ) -> Result<(order::Model, AttemptOutcome), ServiceError> {
        if order.status == OrderStatus::Confirmed && order.payment_status == PaymentStatus::Paid {
            DUPLICATE_CONFIRMATIONS.inc();
            info!(order_id = %order.id, "Order already settled; duplicate confirmation ignored");
            return Ok((order, AttemptOutcome::NoOp));
        }

        if !matches!(
            order.status,
            OrderStatus::Placed | OrderStatus::PaymentPending
        ) {
            return Err(ServiceError::Conflict(format!(
                "Order {} cannot accept a payment confirmation while '{}'",
                order.id, order.status
            )));
        }

        let actor = match channel {
            AttemptChannel::Client => order.customer_id.to_string(),
            AttemptChannel::Webhook => "gateway-webhook".to_string(),
        };

        let cmd = TransitionCommand {
            order_id: order.id,
            from: order.status,
            to: OrderStatus::Confirmed,
            actor,
            note: Some("Payment confirmed".to_string()),
        };
        let extra = vec![
            (
                order::Column::PaymentStatus,
                PaymentStatus::Paid.into(),
            ),
            (
                order::Column::PaymentId,
                sea_orm::Value::from(Some(payment_id.to_string())),
            ),
            (
                order::Column::PaymentSignature,
                sea_orm::Value::from(signature.map(|s| s.to_string())),
            ),
        ];

        match self.status.apply(cmd, extra).await? {
            TransitionOutcome::Applied(updated) => {
                PAYMENT_CONFIRMATIONS
                    .with_label_values(&[channel.as_str()])
                    .inc();
                info!(order_id = %updated.id, channel = channel.as_str(), "Payment confirmed");

                if let Err(e) = self
                    .event_sender
                    .send(Event::PaymentConfirmed {
                        order_id: updated.id,
                        payment_id: payment_id.to_string(),
                    })
                    .await
                {
                    warn!(error = %e, "Failed to send payment confirmed event");
                }

                if let Err(e) = self
                    .notifier
                    .notify(
                        updated.customer_id,
                        "payment_confirmed",
                        json!({
                            "order_id": updated.id,
                            "order_number": updated.order_number,
                            "total": updated.total,
                        }),
                    )
                    .await
                {
                    warn!(error = %e, order_id = %updated.id, "Failed to send payment confirmed notification");
                }

                Ok((updated, AttemptOutcome::Applied))
            }
            TransitionOutcome::Lost => {
                // The other path won the conditional write; observe its
                // result and converge.
                let current = OrderEntity::find_by_id(order.id)
                    .one(&*self.db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Order {} not found", order.id))
                    })?;

                if current.status == OrderStatus::Confirmed {
                    DUPLICATE_CONFIRMATIONS.inc();
                    Ok((current, AttemptOutcome::NoOp))
                } else {
                    Err(ServiceError::Conflict(format!(
                        "Order {} moved to '{}' while confirming payment",
                        current.id, current.status
                    )))
                }
            }
        }
    }

    /// Moves an unpaid order toward PAYMENT_FAILED and releases its stock.
    /// Idempotent; a settled or already-failed order is left untouched.
    /// Returns whether this call applied the failure transition.
    async fn fail_payment(&self, order: &order::Model, note: &str) -> Result<bool, ServiceError> {
        if !matches!(
            order.status,
            OrderStatus::Placed | OrderStatus::PaymentPending
        ) {
            info!(
                order_id = %order.id,
                status = %order.status,
                "Payment failure ignored; order is not awaiting payment"
            );
            return Ok(false);
        }

        let cmd = TransitionCommand {
            order_id: order.id,
            from: order.status,
            to: OrderStatus::PaymentFailed,
            actor: "gateway-webhook".to_string(),
            note: Some(note.to_string()),
        };
        let extra = vec![(
            order::Column::PaymentStatus,
            PaymentStatus::Failed.into(),
        )];

        match self.status.apply(cmd, extra).await? {
            TransitionOutcome::Applied(updated) => {
                self.reservations.release(&updated).await?;

                if let Err(e) = self
                    .event_sender
                    .send(Event::PaymentFailed {
                        order_id: updated.id,
                    })
                    .await
                {
                    warn!(error = %e, "Failed to send payment failed event");
                }

                if let Err(e) = self
                    .notifier
                    .notify(
                        updated.customer_id,
                        "payment_failed",
                        json!({
                            "order_id": updated.id,
                            "order_number": updated.order_number,
                        }),
                    )
                    .await
                {
                    warn!(error = %e, order_id = %updated.id, "Failed to send payment failed notification");
                }

                Ok(true)
            }
            TransitionOutcome::Lost => Ok(false),
        }
    }

    async fn find_by_intent(&self, intent_id: &str) -> Result<Option<order::Model>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::PaymentIntentId.eq(intent_id))
            .one(&*self.db)
            .await?)
    }

    async fn verify_client_signature(
        &self,
        intent_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, ServiceError> {
        let call = self
            .gateway
            .verify_client_signature(intent_id, payment_id, signature);
        match timeout(self.gateway_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::gateway_retryable(
                "Signature verification timed out",
            )),
        }
    }

    async fn verify_webhook_signature(
        &self,
        raw_payload: &[u8],
        signature: &str,
    ) -> Result<bool, ServiceError> {
        let call = self.gateway.verify_webhook_signature(raw_payload, signature);
        match timeout(self.gateway_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::gateway_retryable(
                "Webhook signature verification timed out",
            )),
        }
    }

    /// Appends one ledger row per confirmation event received, regardless of
    /// outcome. Ledger failures are logged, never propagated: the ledger is
    /// diagnostics, not the idempotency guard.
    #[allow(clippy::too_many_arguments)]
    async fn record_attempt(
        &self,
        order_id: Option<Uuid>,
        channel: AttemptChannel,
        event_type: &str,
        intent_id: Option<&str>,
        payment_id: Option<&str>,
        refund_id: Option<&str>,
        signature_valid: bool,
        outcome: AttemptOutcome,
    ) {
        let attempt = payment_attempt::ActiveModel {
            order_id: Set(order_id),
            channel: Set(channel.as_str().to_string()),
            event_type: Set(event_type.to_string()),
            intent_id: Set(intent_id.map(|s| s.to_string())),
            payment_id: Set(payment_id.map(|s| s.to_string())),
            refund_id: Set(refund_id.map(|s| s.to_string())),
            signature_valid: Set(signature_valid),
            outcome: Set(outcome.as_str().to_string()),
            ..Default::default()
        };

        if let Err(e) = attempt.insert(&*self.db).await {
            error!(error = %e, "Failed to append payment attempt ledger row");
        }
    }
}
