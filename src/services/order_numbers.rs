use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use tracing::{info, instrument};

use crate::{
    cache::CacheBackend,
    entities::order::{self, Entity as OrderEntity},
    errors::ServiceError,
};

/// One calendar day, matching the counter's cache TTL.
const COUNTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Produces human-readable per-day order numbers: `<prefix><YYYYMMDD><seq>`
/// with a 4-digit zero-padded sequence.
///
/// The counter lives in the cache keyed by date. On a miss (restart,
/// eviction, day rollover) it is reseeded by counting that day's persisted
/// orders, which makes numbering monotonic and gap-tolerant but not gap-free.
/// A duplicate number is an integrity bug: the unique index on
/// `orders.order_number` rejects the insert and the error propagates.
#[derive(Clone)]
pub struct OrderNumberGenerator {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
    prefix: String,
}

impl OrderNumberGenerator {
    pub fn new(db: Arc<DatabaseConnection>, cache: Arc<dyn CacheBackend>, prefix: String) -> Self {
        Self { db, cache, prefix }
    }

    /// Next order number for the current UTC day.
    pub async fn next(&self) -> Result<String, ServiceError> {
        self.next_at(Utc::now()).await
    }

    /// Next order number for the day containing `now`. Split out so tests can
    /// drive the clock.
    #[instrument(skip(self))]
    pub async fn next_at(&self, now: DateTime<Utc>) -> Result<String, ServiceError> {
        let day = now.date_naive();
        let key = format!("order_number_seq:{}", day.format("%Y%m%d"));

        let seed = if self
            .cache
            .exists(&key)
            .await
            .map_err(|e| ServiceError::CacheError(e.to_string()))?
        {
            // Live counter; the initial value is ignored by incr_from.
            0
        } else {
            let count = self.count_orders_for_day(day).await?;
            info!(day = %day, count, "Reseeding order-number counter from persisted orders");
            count
        };

        let seq = self
            .cache
            .incr_from(&key, seed, Some(COUNTER_TTL))
            .await
            .map_err(|e| ServiceError::CacheError(e.to_string()))?;

        Ok(format_order_number(&self.prefix, day, seq))
    }

    async fn count_orders_for_day(&self, day: NaiveDate) -> Result<i64, ServiceError> {
        let start = day.and_hms_opt(0, 0, 0).expect("midnight exists").and_utc();
        let end = start + chrono::Duration::days(1);

        let count = OrderEntity::find()
            .filter(order::Column::CreatedAt.gte(start))
            .filter(order::Column::CreatedAt.lt(end))
            .count(&*self.db)
            .await?;

        Ok(count as i64)
    }
}

fn format_order_number(prefix: &str, day: NaiveDate, seq: i64) -> String {
    format!("{}{}{:04}", prefix, day.format("%Y%m%d"), seq)
}
