//! Shared harness for integration tests: an in-memory SQLite database plus
//! stateful fakes for every external collaborator.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseBackend, Statement};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use orderflow_api::{
    cache::InMemoryCache,
    config::AppConfig,
    errors::ServiceError,
    events,
    external::{
        gateway::signature, AddressClient, AddressSnapshot, AuditClient, CartClient, CartLine,
        CatalogClient, DecrementOutcome, DeliveryClient, IncrementOutcome, MinimumOrderCheck,
        NotificationClient, PaymentGateway, PaymentIntent, RefundHandle, ServiceAreaCheck,
        VariantSnapshot,
    },
    models::PaymentMethod,
    services::checkout::{CheckoutOutcome, PlaceOrderRequest},
    AppServices, ExternalClients,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE orders (
        id TEXT PRIMARY KEY,
        order_number TEXT NOT NULL UNIQUE,
        customer_id TEXT NOT NULL,
        status TEXT NOT NULL,
        payment_status TEXT NOT NULL,
        payment_method TEXT NOT NULL,
        subtotal REAL NOT NULL,
        discount REAL NOT NULL,
        delivery_charge REAL NOT NULL,
        total REAL NOT NULL,
        currency TEXT NOT NULL,
        delivery_address TEXT NOT NULL,
        notes TEXT,
        payment_intent_id TEXT,
        payment_id TEXT,
        payment_signature TEXT,
        refund_id TEXT,
        payment_expires_at TEXT,
        stock_reserved INTEGER NOT NULL,
        cancelled_at TEXT,
        cancel_reason TEXT,
        cancellation_initiator TEXT,
        refund_initiated_at TEXT,
        refunded_at TEXT,
        refund_amount REAL,
        refund_reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        version INTEGER NOT NULL
    )",
    "CREATE TABLE order_items (
        id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL,
        product_id TEXT NOT NULL,
        variant_id TEXT NOT NULL,
        sku TEXT NOT NULL,
        name TEXT NOT NULL,
        quantity INTEGER NOT NULL,
        unit_price REAL NOT NULL,
        line_total REAL NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE order_status_history (
        id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL,
        status TEXT NOT NULL,
        actor TEXT NOT NULL,
        note TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE payment_attempts (
        id TEXT PRIMARY KEY,
        order_id TEXT,
        channel TEXT NOT NULL,
        event_type TEXT NOT NULL,
        intent_id TEXT,
        payment_id TEXT,
        refund_id TEXT,
        signature_valid INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE stock_reservations (
        id TEXT PRIMARY KEY,
        order_id TEXT,
        status TEXT NOT NULL,
        lines TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT
    )",
];

const WEBHOOK_SECRET: &str = "test_webhook_secret";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct VariantRecord {
    snapshot: VariantSnapshot,
    sales: i64,
}

/// In-memory catalog with honest conditional decrements.
pub struct FakeCatalog {
    variants: Mutex<HashMap<Uuid, VariantRecord>>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self {
            variants: Mutex::new(HashMap::new()),
        }
    }

    pub fn seed(&self, sku: &str, selling_price: Decimal, stock: i32) -> (Uuid, Uuid) {
        let product_id = Uuid::new_v4();
        let variant_id = Uuid::new_v4();
        self.variants.lock().unwrap().insert(
            variant_id,
            VariantRecord {
                snapshot: VariantSnapshot {
                    product_id,
                    variant_id,
                    product_name: format!("Product {}", sku),
                    sku: sku.to_string(),
                    price: selling_price + dec!(5.00),
                    selling_price,
                    stock,
                    active: true,
                },
                sales: 0,
            },
        );
        (product_id, variant_id)
    }

    pub fn stock_of(&self, variant_id: Uuid) -> i32 {
        self.variants.lock().unwrap()[&variant_id].snapshot.stock
    }

    pub fn sales_of(&self, product_id: Uuid) -> i64 {
        self.variants
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.snapshot.product_id == product_id)
            .map(|r| r.sales)
            .sum()
    }

    pub fn deactivate(&self, variant_id: Uuid) {
        if let Some(record) = self.variants.lock().unwrap().get_mut(&variant_id) {
            record.snapshot.active = false;
        }
    }

    pub fn remove(&self, variant_id: Uuid) {
        self.variants.lock().unwrap().remove(&variant_id);
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn get_variant(
        &self,
        _product_id: Uuid,
        variant_id: Uuid,
    ) -> Result<Option<VariantSnapshot>, ServiceError> {
        Ok(self
            .variants
            .lock()
            .unwrap()
            .get(&variant_id)
            .map(|r| r.snapshot.clone()))
    }

    async fn decrement_stock(
        &self,
        _product_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<DecrementOutcome, ServiceError> {
        let mut variants = self.variants.lock().unwrap();
        let Some(record) = variants.get_mut(&variant_id) else {
            return Ok(DecrementOutcome::VariantMissing);
        };
        if record.snapshot.stock < quantity {
            return Ok(DecrementOutcome::InsufficientStock {
                available: record.snapshot.stock,
            });
        }
        record.snapshot.stock -= quantity;
        Ok(DecrementOutcome::Applied)
    }

    async fn increment_stock(
        &self,
        _product_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<IncrementOutcome, ServiceError> {
        let mut variants = self.variants.lock().unwrap();
        let Some(record) = variants.get_mut(&variant_id) else {
            return Ok(IncrementOutcome::VariantMissing);
        };
        record.snapshot.stock += quantity;
        Ok(IncrementOutcome::Applied)
    }

    async fn increment_sales_counter(
        &self,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        let mut variants = self.variants.lock().unwrap();
        for record in variants.values_mut() {
            if record.snapshot.product_id == product_id {
                record.sales += i64::from(quantity);
            }
        }
        Ok(())
    }
}

pub struct FakeCart {
    carts: Mutex<HashMap<Uuid, Vec<CartLine>>>,
    pub converted: Mutex<Vec<Uuid>>,
}

impl FakeCart {
    pub fn new() -> Self {
        Self {
            carts: Mutex::new(HashMap::new()),
            converted: Mutex::new(Vec::new()),
        }
    }

    pub fn fill(&self, customer_id: Uuid, lines: Vec<CartLine>) {
        self.carts.lock().unwrap().insert(customer_id, lines);
    }
}

#[async_trait]
impl CartClient for FakeCart {
    async fn active_cart(&self, customer_id: Uuid) -> Result<Vec<CartLine>, ServiceError> {
        Ok(self
            .carts
            .lock()
            .unwrap()
            .get(&customer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_converted(&self, customer_id: Uuid) -> Result<(), ServiceError> {
        self.carts.lock().unwrap().remove(&customer_id);
        self.converted.lock().unwrap().push(customer_id);
        Ok(())
    }
}

pub struct FakeAddressBook {
    missing: Mutex<HashSet<Uuid>>,
}

impl FakeAddressBook {
    pub fn new() -> Self {
        Self {
            missing: Mutex::new(HashSet::new()),
        }
    }

    pub fn mark_missing(&self, address_id: Uuid) {
        self.missing.lock().unwrap().insert(address_id);
    }
}

#[async_trait]
impl AddressClient for FakeAddressBook {
    async fn get_address(
        &self,
        _customer_id: Uuid,
        address_id: Uuid,
    ) -> Result<Option<AddressSnapshot>, ServiceError> {
        if self.missing.lock().unwrap().contains(&address_id) {
            return Ok(None);
        }
        Ok(Some(AddressSnapshot {
            recipient_name: "Test Customer".to_string(),
            phone: "+8801700000000".to_string(),
            line1: "House 7, Road 11".to_string(),
            line2: None,
            city: "Dhaka".to_string(),
            postal_code: "1209".to_string(),
            latitude: 23.78,
            longitude: 90.40,
        }))
    }
}

pub struct FakeDelivery {
    pub deliverable: AtomicBool,
    pub max_radius_km: f64,
    charge: Decimal,
    minimum: Decimal,
}

impl FakeDelivery {
    pub fn new() -> Self {
        Self {
            deliverable: AtomicBool::new(true),
            max_radius_km: 15.0,
            charge: dec!(50.00),
            minimum: dec!(100.00),
        }
    }
}

#[async_trait]
impl DeliveryClient for FakeDelivery {
    async fn is_within_service_area(
        &self,
        _latitude: f64,
        _longitude: f64,
    ) -> Result<ServiceAreaCheck, ServiceError> {
        Ok(ServiceAreaCheck {
            deliverable: self.deliverable.load(Ordering::SeqCst),
            max_radius_km: self.max_radius_km,
        })
    }

    async fn calculate_delivery_charge(&self, _subtotal: Decimal) -> Result<Decimal, ServiceError> {
        Ok(self.charge)
    }

    async fn meets_minimum_order_value(
        &self,
        subtotal: Decimal,
    ) -> Result<MinimumOrderCheck, ServiceError> {
        Ok(MinimumOrderCheck {
            met: subtotal >= self.minimum,
            minimum: self.minimum,
        })
    }
}

/// Gateway fake that signs and verifies with the same HMAC helpers a real
/// adapter would use.
pub struct FakeGateway {
    secret: String,
    counter: AtomicU64,
    pub fail_intents: AtomicBool,
    pub fail_refunds: AtomicBool,
    pub intents: Mutex<Vec<PaymentIntent>>,
    pub refunds: Mutex<Vec<(String, Decimal)>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            secret: WEBHOOK_SECRET.to_string(),
            counter: AtomicU64::new(0),
            fail_intents: AtomicBool::new(false),
            fail_refunds: AtomicBool::new(false),
            intents: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
        }
    }

    /// The signature a legitimate client callback would carry.
    pub fn client_signature(&self, intent_id: &str, payment_id: &str) -> String {
        signature::sign_payload(&self.secret, format!("{}:{}", intent_id, payment_id).as_bytes())
    }

    /// Signs a webhook payload the way the gateway's servers would.
    pub fn sign_webhook(&self, payload: &[u8]) -> String {
        signature::sign_payload(&self.secret, payload)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        _reference: &str,
        _metadata: Value,
    ) -> Result<PaymentIntent, ServiceError> {
        if self.fail_intents.load(Ordering::SeqCst) {
            return Err(ServiceError::gateway_rejected("intent creation declined"));
        }
        let intent = PaymentIntent {
            intent_id: format!("pi_{}", self.counter.fetch_add(1, Ordering::SeqCst)),
            amount,
            currency: currency.to_string(),
        };
        self.intents.lock().unwrap().push(intent.clone());
        Ok(intent)
    }

    async fn verify_client_signature(
        &self,
        intent_id: &str,
        payment_id: &str,
        signature_value: &str,
    ) -> Result<bool, ServiceError> {
        Ok(signature::verify_payload(
            &self.secret,
            format!("{}:{}", intent_id, payment_id).as_bytes(),
            signature_value,
        ))
    }

    async fn verify_webhook_signature(
        &self,
        raw_payload: &[u8],
        signature_value: &str,
    ) -> Result<bool, ServiceError> {
        Ok(signature::verify_payload(
            &self.secret,
            raw_payload,
            signature_value,
        ))
    }

    async fn initiate_refund(
        &self,
        payment_id: &str,
        amount: Decimal,
        _metadata: Value,
    ) -> Result<RefundHandle, ServiceError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(ServiceError::gateway_retryable("refund endpoint timed out"));
        }
        let handle = RefundHandle {
            refund_id: format!("re_{}", self.counter.fetch_add(1, Ordering::SeqCst)),
        };
        self.refunds
            .lock()
            .unwrap()
            .push((payment_id.to_string(), amount));
        Ok(handle)
    }
}

pub struct FakeNotifier {
    pub sent: Mutex<Vec<(Uuid, String, Value)>>,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t, _)| t == event_type)
            .count()
    }
}

#[async_trait]
impl NotificationClient for FakeNotifier {
    async fn notify(
        &self,
        customer_id: Uuid,
        event_type: &str,
        payload: Value,
    ) -> Result<(), ServiceError> {
        self.sent
            .lock()
            .unwrap()
            .push((customer_id, event_type.to_string(), payload));
        Ok(())
    }
}

pub struct FakeAudit {
    pub records: Mutex<Vec<String>>,
}

impl FakeAudit {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AuditClient for FakeAudit {
    async fn record(
        &self,
        actor: &str,
        action: &str,
        _entity_type: &str,
        entity_id: &str,
        _before: Option<Value>,
        _after: Option<Value>,
    ) -> Result<(), ServiceError> {
        self.records
            .lock()
            .unwrap()
            .push(format!("{}:{}:{}", actor, action, entity_id));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Application state backed by an in-memory SQLite database and fakes for
/// every external collaborator.
pub struct TestApp {
    pub services: AppServices,
    pub catalog: Arc<FakeCatalog>,
    pub cart: Arc<FakeCart>,
    pub addresses: Arc<FakeAddressBook>,
    pub delivery: Arc<FakeDelivery>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<FakeNotifier>,
    pub audit: Arc<FakeAudit>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        // A single pooled connection keeps every query on the same in-memory
        // database.
        let mut opts = ConnectOptions::new("sqlite::memory:".to_owned());
        opts.max_connections(1).min_connections(1);
        let db = Database::connect(opts).await.expect("sqlite connects");

        for ddl in SCHEMA {
            db.execute(Statement::from_string(
                DatabaseBackend::Sqlite,
                (*ddl).to_string(),
            ))
            .await
            .expect("schema statement applies");
        }

        let db = Arc::new(db);
        let config = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());

        let catalog = Arc::new(FakeCatalog::new());
        let cart = Arc::new(FakeCart::new());
        let addresses = Arc::new(FakeAddressBook::new());
        let delivery = Arc::new(FakeDelivery::new());
        let gateway = Arc::new(FakeGateway::new());
        let notifier = Arc::new(FakeNotifier::new());
        let audit = Arc::new(FakeAudit::new());

        let (event_sender, receiver) = events::channel(config.event_buffer);
        let event_task = tokio::spawn(events::process_events(receiver));

        let services = AppServices::build(
            db,
            config,
            Arc::new(InMemoryCache::new()),
            ExternalClients {
                cart: cart.clone(),
                catalog: catalog.clone(),
                addresses: addresses.clone(),
                delivery: delivery.clone(),
                gateway: gateway.clone(),
                notifier: notifier.clone(),
                audit: audit.clone(),
            },
            event_sender,
        );

        Self {
            services,
            catalog,
            cart,
            addresses,
            delivery,
            gateway,
            notifier,
            audit,
            _event_task: event_task,
        }
    }

    /// Fills the customer's cart and places an order.
    pub async fn checkout(
        &self,
        customer_id: Uuid,
        items: &[(Uuid, Uuid, i32)],
        payment_method: PaymentMethod,
    ) -> Result<CheckoutOutcome, ServiceError> {
        let lines = items
            .iter()
            .map(|&(product_id, variant_id, quantity)| CartLine {
                product_id,
                variant_id,
                quantity,
            })
            .collect();
        self.cart.fill(customer_id, lines);

        self.services
            .place_order(PlaceOrderRequest {
                customer_id,
                address_id: Uuid::new_v4(),
                payment_method,
                notes: None,
            })
            .await
    }

    /// Places a gateway order and confirms its payment through the client
    /// callback path, returning the confirmed order.
    pub async fn checkout_and_pay(
        &self,
        customer_id: Uuid,
        items: &[(Uuid, Uuid, i32)],
    ) -> orderflow_api::entities::order::Model {
        let outcome = self
            .checkout(customer_id, items, PaymentMethod::Gateway)
            .await
            .expect("checkout succeeds");
        let intent = outcome.payment_intent.expect("gateway order has intent");
        let payment_id = format!("pay_{}", outcome.order.id.simple());
        let signature = self.gateway.client_signature(&intent.intent_id, &payment_id);

        self.services
            .confirm_client_payment(outcome.order.id, &intent.intent_id, &payment_id, &signature)
            .await
            .expect("payment confirms")
    }
}
