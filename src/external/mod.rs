//! Contracts for the engine's external collaborators.
//!
//! Everything the order engine consumes from the rest of the platform is an
//! async trait here, so deployments wire in real clients and tests wire in
//! fakes without touching the services.

pub mod address;
pub mod audit;
pub mod cart;
pub mod catalog;
pub mod delivery;
pub mod gateway;
pub mod notify;

pub use address::{AddressClient, AddressSnapshot};
pub use audit::AuditClient;
pub use cart::{CartClient, CartLine};
pub use catalog::{CatalogClient, DecrementOutcome, IncrementOutcome, VariantSnapshot};
pub use delivery::{DeliveryClient, MinimumOrderCheck, ServiceAreaCheck};
pub use gateway::{PaymentGateway, PaymentIntent, RefundHandle};
pub use notify::NotificationClient;
