//! Orderflow API Library
//!
//! Order lifecycle and payment reconciliation engine: checkout against a
//! re-validated cart, atomic stock reservation across independently-stored
//! variants, a finite order-status state machine with an append-only history,
//! dual-path (client callback + signed webhook) payment confirmation that
//! converges on one idempotent conditional write, and cancellation/refund
//! compensation.
//!
//! Transport is out of scope: the exposed surface is the verb-level methods
//! on [`AppServices`], which a HTTP/gRPC adapter wires to the wire.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod cache;
pub mod config;
pub mod entities;
pub mod errors;
pub mod events;
pub mod external;
pub mod models;
pub mod services;

use std::sync::Arc;

use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use uuid::Uuid;

use crate::{
    cache::CacheBackend,
    config::AppConfig,
    entities::order,
    errors::ServiceError,
    events::EventSender,
    external::{
        AddressClient, AuditClient, CartClient, CatalogClient, DeliveryClient,
        NotificationClient, PaymentGateway,
    },
    models::OrderStatus,
    services::{
        cart_validation::CartSnapshotValidator,
        checkout::{CheckoutOutcome, CheckoutService, PlaceOrderRequest},
        order_numbers::OrderNumberGenerator,
        order_status::OrderStatusService,
        orders::OrderService,
        payment_reconciliation::{PaymentReconciler, WebhookAck},
        refunds::RefundCoordinator,
        stock_reservation::StockReservationManager,
    },
};

/// Everything the engine consumes from the rest of the platform.
#[derive(Clone)]
pub struct ExternalClients {
    pub cart: Arc<dyn CartClient>,
    pub catalog: Arc<dyn CatalogClient>,
    pub addresses: Arc<dyn AddressClient>,
    pub delivery: Arc<dyn DeliveryClient>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn NotificationClient>,
    pub audit: Arc<dyn AuditClient>,
}

/// Wired service graph for the order engine.
#[derive(Clone)]
pub struct AppServices {
    pub db: Arc<DatabaseConnection>,
    pub config: AppConfig,
    pub event_sender: EventSender,
    pub checkout: CheckoutService,
    pub orders: OrderService,
    pub payments: PaymentReconciler,
    pub refunds: RefundCoordinator,
    pub reservations: StockReservationManager,
}

impl AppServices {
    pub fn build(
        db: Arc<DatabaseConnection>,
        config: AppConfig,
        cache: Arc<dyn CacheBackend>,
        clients: ExternalClients,
        event_sender: EventSender,
    ) -> Self {
        let status = OrderStatusService::new(db.clone(), event_sender.clone());
        let reservations = StockReservationManager::new(
            db.clone(),
            clients.catalog.clone(),
            event_sender.clone(),
        );
        let order_numbers = OrderNumberGenerator::new(
            db.clone(),
            cache,
            config.order_number_prefix.clone(),
        );
        let validator = CartSnapshotValidator::new(clients.catalog.clone());

        let checkout = CheckoutService::new(
            db.clone(),
            &config,
            clients.cart.clone(),
            validator,
            clients.addresses.clone(),
            clients.delivery.clone(),
            reservations.clone(),
            order_numbers,
            status.clone(),
            clients.gateway.clone(),
            clients.notifier.clone(),
            clients.audit.clone(),
            event_sender.clone(),
        );

        let payments = PaymentReconciler::new(
            db.clone(),
            clients.gateway.clone(),
            status.clone(),
            reservations.clone(),
            clients.notifier.clone(),
            event_sender.clone(),
            config.gateway.timeout(),
        );

        let refunds = RefundCoordinator::new(
            db.clone(),
            clients.gateway.clone(),
            status.clone(),
            clients.notifier.clone(),
            event_sender.clone(),
            config.gateway.timeout(),
        );

        let orders = OrderService::new(
            db.clone(),
            status,
            reservations.clone(),
            refunds.clone(),
            clients.notifier.clone(),
            clients.audit.clone(),
            event_sender.clone(),
        );

        Self {
            db,
            config,
            event_sender,
            checkout,
            orders,
            payments,
            refunds,
            reservations,
        }
    }

    // Verb-level contract, one method per exposed operation.

    pub async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<CheckoutOutcome, ServiceError> {
        self.checkout.place_order(request).await
    }

    pub async fn confirm_client_payment(
        &self,
        order_id: Uuid,
        intent_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<order::Model, ServiceError> {
        self.payments
            .confirm_client_payment(order_id, intent_id, payment_id, signature)
            .await
    }

    pub async fn handle_gateway_webhook(
        &self,
        raw_payload: &[u8],
        signature: &str,
    ) -> Result<WebhookAck, ServiceError> {
        self.payments.handle_webhook(raw_payload, signature).await
    }

    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> Result<order::Model, ServiceError> {
        self.orders.cancel_order(order_id, actor, reason).await
    }

    pub async fn initiate_refund(
        &self,
        order_id: Uuid,
        amount: Decimal,
        reason: &str,
        actor: &str,
    ) -> Result<order::Model, ServiceError> {
        self.refunds.initiate(order_id, amount, reason, actor).await
    }

    pub async fn transition_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        actor: &str,
        note: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        self.orders
            .transition_status(order_id, new_status, actor, note)
            .await
    }
}
