pub mod cart_validation;
pub mod checkout;
pub mod order_numbers;
pub mod order_status;
pub mod orders;
pub mod payment_reconciliation;
pub mod refunds;
pub mod stock_reservation;
