use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ServiceError;

/// The gateway's record of a pending payment, created before the payer
/// completes the flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Handle for a refund accepted by the gateway. Completion arrives later as
/// a `refund.processed` webhook event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundHandle {
    pub refund_id: String,
}

/// Contract for the external payment gateway.
///
/// The engine never trusts client-supplied amounts or statuses. Only the
/// identifiers that survive signature verification are stored, and every
/// status change is re-derived from the engine's own records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        reference: &str,
        metadata: Value,
    ) -> Result<PaymentIntent, ServiceError>;

    async fn verify_client_signature(
        &self,
        intent_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, ServiceError>;

    async fn verify_webhook_signature(
        &self,
        raw_payload: &[u8],
        signature: &str,
    ) -> Result<bool, ServiceError>;

    async fn initiate_refund(
        &self,
        payment_id: &str,
        amount: Decimal,
        metadata: Value,
    ) -> Result<RefundHandle, ServiceError>;
}

/// HMAC-SHA256 signing helpers shared by gateway adapters and test doubles.
pub mod signature {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    /// Hex-encoded HMAC-SHA256 over `payload`.
    pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time verification of a hex-encoded HMAC-SHA256 signature.
    pub fn verify_payload(secret: &str, payload: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }

}
