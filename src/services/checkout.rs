use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::AppConfig,
    entities::{order, order_item, order_status_history, stock_reservation::ReservedLine},
    errors::ServiceError,
    events::{Event, EventSender},
    external::{
        AddressClient, AuditClient, CartClient, NotificationClient, PaymentGateway, PaymentIntent,
    },
    external::delivery::DeliveryClient,
    models::{OrderStatus, PaymentMethod, PaymentStatus},
    services::{
        cart_validation::CartSnapshotValidator,
        order_numbers::OrderNumberGenerator,
        order_status::{OrderStatusService, TransitionCommand, TransitionOutcome},
        stock_reservation::StockReservationManager,
    },
};

lazy_static! {
    static ref CHECKOUTS: IntCounter = IntCounter::new(
        "checkouts_total",
        "Total number of successfully placed orders"
    )
    .expect("metric can be created");
    static ref CHECKOUT_FAILURES: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "checkout_failures_total",
            "Total number of failed checkouts"
        ),
        &["error_type"]
    )
    .expect("metric can be created");
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    pub customer_id: Uuid,
    pub address_id: Uuid,
    pub payment_method: PaymentMethod,
    #[validate(length(max = 500, message = "Notes must be at most 500 characters"))]
    pub notes: Option<String>,
}

/// A placed order together with the payment intent, when the chosen payment
/// method requires one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutOutcome {
    pub order: order::Model,
    pub payment_intent: Option<PaymentIntent>,
}

/// Orchestrates checkout: cart re-validation, delivery eligibility, atomic
/// stock reservation, order persistence, and payment-intent creation, with
/// compensating actions at every stage that can fail.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    cart: Arc<dyn CartClient>,
    validator: CartSnapshotValidator,
    addresses: Arc<dyn AddressClient>,
    delivery: Arc<dyn DeliveryClient>,
    reservations: StockReservationManager,
    order_numbers: OrderNumberGenerator,
    status: OrderStatusService,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn NotificationClient>,
    audit: Arc<dyn AuditClient>,
    event_sender: EventSender,
    currency: String,
    payment_window: ChronoDuration,
    gateway_timeout: std::time::Duration,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        cart: Arc<dyn CartClient>,
        validator: CartSnapshotValidator,
        addresses: Arc<dyn AddressClient>,
        delivery: Arc<dyn DeliveryClient>,
        reservations: StockReservationManager,
        order_numbers: OrderNumberGenerator,
        status: OrderStatusService,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationClient>,
        audit: Arc<dyn AuditClient>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            cart,
            validator,
            addresses,
            delivery,
            reservations,
            order_numbers,
            status,
            gateway,
            notifier,
            audit,
            event_sender,
            currency: config.currency.clone(),
            payment_window: ChronoDuration::minutes(config.gateway.payment_window_minutes),
            gateway_timeout: config.gateway.timeout(),
        }
    }

    /// Places an order from the customer's active cart.
    ///
    /// Reservation plus order creation behaves as one atomic unit: the stock
    /// decrements and the order row either both stand or both are undone,
    /// with the reservation journal covering the crash window in between.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<CheckoutOutcome, ServiceError> {
        request.validate().map_err(|e| {
            CHECKOUT_FAILURES.with_label_values(&["validation_error"]).inc();
            ServiceError::ValidationError(e.to_string())
        })?;

        let lines = self.cart.active_cart(request.customer_id).await?;
        if lines.is_empty() {
            CHECKOUT_FAILURES.with_label_values(&["empty_cart"]).inc();
            return Err(ServiceError::ValidationError("Cart is empty".to_string()));
        }

        let snapshot = self.validator.validate(&lines).await.map_err(|e| {
            CHECKOUT_FAILURES.with_label_values(&["validation_error"]).inc();
            e
        })?;

        // All-or-nothing policy: one bad line rejects the whole checkout, and
        // the response names every rejected line so the customer can fix it.
        if !snapshot.invalid.is_empty() {
            CHECKOUT_FAILURES.with_label_values(&["invalid_items"]).inc();
            let detail = snapshot
                .invalid
                .iter()
                .map(|r| format!("variant {}: {}", r.variant_id, r.reason))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ServiceError::ValidationError(format!(
                "Cart contains unavailable items: {}",
                detail
            )));
        }

        let address = self
            .addresses
            .get_address(request.customer_id, request.address_id)
            .await?
            .ok_or_else(|| {
                CHECKOUT_FAILURES.with_label_values(&["address_not_found"]).inc();
                ServiceError::NotFound(format!("Address {} not found", request.address_id))
            })?;

        let area = self
            .delivery
            .is_within_service_area(address.latitude, address.longitude)
            .await?;
        if !area.deliverable {
            CHECKOUT_FAILURES.with_label_values(&["out_of_area"]).inc();
            return Err(ServiceError::ValidationError(format!(
                "Delivery address is outside the service area (maximum radius {} km)",
                area.max_radius_km
            )));
        }

        let subtotal = snapshot.subtotal();
        let minimum = self.delivery.meets_minimum_order_value(subtotal).await?;
        if !minimum.met {
            CHECKOUT_FAILURES.with_label_values(&["below_minimum"]).inc();
            return Err(ServiceError::ValidationError(format!(
                "Order value {} is below the minimum {}; add {} more",
                subtotal,
                minimum.minimum,
                minimum.minimum - subtotal
            )));
        }

        let delivery_charge = self.delivery.calculate_delivery_charge(subtotal).await?;
        let discount = Decimal::ZERO;
        let total = subtotal - discount + delivery_charge;
        if total < Decimal::ZERO {
            return Err(ServiceError::InternalError(format!(
                "Computed negative order total {} for customer {}",
                total, request.customer_id
            )));
        }

        let order_number = self.order_numbers.next().await?;

        let reservation_id = Uuid::new_v4();
        let reserved_lines: Vec<ReservedLine> = snapshot
            .valid
            .iter()
            .map(|line| ReservedLine {
                product_id: line.product_id,
                variant_id: line.variant_id,
                quantity: line.quantity,
            })
            .collect();

        self.reservations
            .reserve(reservation_id, &reserved_lines)
            .await
            .map_err(|e| {
                CHECKOUT_FAILURES.with_label_values(&["reservation_failed"]).inc();
                e
            })?;

        let order = match self
            .persist_order(&request, &snapshot, &address, &order_number, subtotal, discount, delivery_charge, total)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                // Phase 2 failed after phase 1 decremented stock: credit the
                // journalled reservation back before surfacing the error.
                error!(error = %e, order_number = %order_number, "Order persistence failed; aborting reservation");
                self.reservations.abort(reservation_id).await;
                CHECKOUT_FAILURES.with_label_values(&["database_error"]).inc();
                return Err(e);
            }
        };

        if let Err(e) = self.reservations.commit(reservation_id, order.id).await {
            error!(error = %e, order_id = %order.id, "Reservation commit failed; cancelling order");
            self.cancel_unpayable_order(&order, "Stock reservation could not be committed")
                .await;
            CHECKOUT_FAILURES.with_label_values(&["reservation_conflict"]).inc();
            return Err(e);
        }

        let payment_intent = match request.payment_method {
            PaymentMethod::Gateway => {
                match self.create_intent(&order).await {
                    Ok(intent) => Some(intent),
                    Err(e) => {
                        error!(error = %e, order_id = %order.id, "Payment intent creation failed; compensating");
                        if let Err(release_err) = self.reservations.release(&order).await {
                            error!(
                                error = %release_err,
                                order_id = %order.id,
                                "Stock release failed during intent compensation"
                            );
                        }
                        self.cancel_unpayable_order(&order, "Payment intent creation failed")
                            .await;
                        CHECKOUT_FAILURES.with_label_values(&["gateway_error"]).inc();
                        return Err(e);
                    }
                }
            }
            PaymentMethod::CashOnDelivery => None,
        };

        let order = match &payment_intent {
            Some(intent) => {
                let mut active: order::ActiveModel = order.into();
                active.payment_intent_id = Set(Some(intent.intent_id.clone()));
                active.updated_at = Set(Some(Utc::now()));
                active.update(&*self.db).await?
            }
            None => order,
        };

        CHECKOUTS.inc();
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total,
            "Order placed"
        );

        if let Err(e) = self.event_sender.send(Event::OrderCreated(order.id)).await {
            warn!(error = %e, order_id = %order.id, "Failed to send order created event");
        }

        if let Err(e) = self.cart.mark_converted(request.customer_id).await {
            warn!(error = %e, customer_id = %request.customer_id, "Failed to mark cart converted");
        }

        if let Err(e) = self
            .notifier
            .notify(
                request.customer_id,
                "order_placed",
                json!({
                    "order_id": order.id,
                    "order_number": order.order_number,
                    "total": order.total,
                }),
            )
            .await
        {
            warn!(error = %e, order_id = %order.id, "Failed to send order placed notification");
        }

        if let Err(e) = self
            .audit
            .record(
                &request.customer_id.to_string(),
                "order.place",
                "order",
                &order.id.to_string(),
                None,
                serde_json::to_value(&order).ok(),
            )
            .await
        {
            warn!(error = %e, order_id = %order.id, "Failed to write audit record");
        }

        Ok(CheckoutOutcome {
            order,
            payment_intent,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_order(
        &self,
        request: &PlaceOrderRequest,
        snapshot: &crate::services::cart_validation::CartSnapshot,
        address: &crate::external::AddressSnapshot,
        order_number: &str,
        subtotal: Decimal,
        discount: Decimal,
        delivery_charge: Decimal,
        total: Decimal,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let payment_expires_at = match request.payment_method {
            PaymentMethod::Gateway => Some(now + self.payment_window),
            PaymentMethod::CashOnDelivery => None,
        };

        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.to_string()),
            customer_id: Set(request.customer_id),
            status: Set(OrderStatus::Placed),
            payment_status: Set(PaymentStatus::Pending),
            payment_method: Set(request.payment_method),
            subtotal: Set(subtotal),
            discount: Set(discount),
            delivery_charge: Set(delivery_charge),
            total: Set(total),
            currency: Set(self.currency.clone()),
            delivery_address: Set(serde_json::to_string(address)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?),
            notes: Set(request.notes.clone()),
            payment_intent_id: Set(None),
            payment_id: Set(None),
            payment_signature: Set(None),
            refund_id: Set(None),
            payment_expires_at: Set(payment_expires_at),
            stock_reserved: Set(true),
            cancelled_at: Set(None),
            cancel_reason: Set(None),
            cancellation_initiator: Set(None),
            refund_initiated_at: Set(None),
            refunded_at: Set(None),
            refund_amount: Set(None),
            refund_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        };
        let order_row = order_model.insert(&txn).await?;

        for line in &snapshot.valid {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                variant_id: Set(line.variant_id),
                sku: Set(line.sku.clone()),
                name: Set(line.name.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                line_total: Set(line.line_total),
                created_at: Set(now),
            };
            item.insert(&txn).await?;
        }

        let history = order_status_history::ActiveModel {
            order_id: Set(order_id),
            status: Set(OrderStatus::Placed),
            actor: Set(request.customer_id.to_string()),
            note: Set(Some("Order placed".to_string())),
            ..Default::default()
        };
        history.insert(&txn).await?;

        txn.commit().await?;
        Ok(order_row)
    }

    async fn create_intent(&self, order: &order::Model) -> Result<PaymentIntent, ServiceError> {
        let call = self.gateway.create_intent(
            order.total,
            &self.currency,
            &order.order_number,
            json!({
                "order_id": order.id,
                "customer_id": order.customer_id,
            }),
        );

        match timeout(self.gateway_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::gateway_retryable(format!(
                "Payment intent creation timed out after {:?}",
                self.gateway_timeout
            ))),
        }
    }

    /// Compensating cancellation for an order that can never be paid (intent
    /// creation failed, or its reservation was reclaimed under it).
    async fn cancel_unpayable_order(&self, order: &order::Model, reason: &str) {
        let cmd = TransitionCommand {
            order_id: order.id,
            from: OrderStatus::Placed,
            to: OrderStatus::Cancelled,
            actor: "system".to_string(),
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
                sea_orm::Value::from(Some("system".to_string())),
            ),
        ];

        match self.status.apply(cmd, extra).await {
            Ok(TransitionOutcome::Applied(_)) => {}
            Ok(TransitionOutcome::Lost) => {
                warn!(order_id = %order.id, "Order moved during compensation; leaving as-is");
            }
            Err(e) => {
                error!(error = %e, order_id = %order.id, "Compensating cancellation failed");
            }
        }
    }
}
