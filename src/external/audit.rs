use async_trait::async_trait;
use serde_json::Value;

use crate::errors::ServiceError;

/// Contract consumed from the audit subsystem. Best-effort and append-only;
/// a failed audit write is logged and never fails the calling operation.
#[async_trait]
pub trait AuditClient: Send + Sync {
    async fn record(
        &self,
        actor: &str,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Result<(), ServiceError>;
}
