pub mod order;

pub use order::{OrderStatus, PaymentMethod, PaymentStatus};
