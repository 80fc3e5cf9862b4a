use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use sea_orm::sea_query::Expr;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity},
        order_item::{self, Entity as OrderItemEntity},
        stock_reservation::{
            self, Entity as StockReservationEntity, ReservationStatus, ReservedLine,
        },
    },
    errors::ServiceError,
    events::{Event, EventSender},
    external::{CatalogClient, DecrementOutcome, IncrementOutcome},
};

lazy_static! {
    static ref STOCK_RESERVATIONS: IntCounter = IntCounter::new(
        "stock_reservations_total",
        "Total number of successful stock reservations"
    )
    .expect("metric can be created");
    static ref STOCK_RESERVATION_FAILURES: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "stock_reservation_failures_total",
            "Total number of failed stock reservations"
        ),
        &["error_type"]
    )
    .expect("metric can be created");
    static ref STOCK_RELEASES: IntCounter = IntCounter::new(
        "stock_releases_total",
        "Total number of stock releases"
    )
    .expect("metric can be created");
}

/// Result of a stale-reservation sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    /// Journal rows claimed and re-credited by this sweep.
    pub released_count: u64,
    pub swept_at: DateTime<Utc>,
}

/// Reserves and releases inventory across many independently-stored variants.
///
/// The catalog only guarantees per-variant conditional decrements, so the
/// all-or-nothing checkout reservation is a compensating saga: a journal row
/// is written before any decrement, failures roll the applied decrements
/// back, and a sweep recovers rows orphaned by a crash between reservation
/// and order persistence.
#[derive(Clone)]
pub struct StockReservationManager {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn CatalogClient>,
    event_sender: EventSender,
}

impl StockReservationManager {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn CatalogClient>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            catalog,
            event_sender,
        }
    }

    /// Atomically reserves stock for every line, or nothing at all.
    ///
    /// Decrements run one variant at a time against the catalog's conditional
    /// update; the first failure rolls back every decrement already applied
    /// and surfaces an error naming the offending variant.
    #[instrument(skip(self, lines), fields(reservation_id = %reservation_id, line_count = lines.len()))]
    pub async fn reserve(
        &self,
        reservation_id: Uuid,
        lines: &[ReservedLine],
    ) -> Result<(), ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "Nothing to reserve".to_string(),
            ));
        }

        let journal = stock_reservation::ActiveModel {
            id: Set(reservation_id),
            order_id: Set(None),
            status: Set(ReservationStatus::Pending.as_str().to_string()),
            lines: Set(serde_json::to_string(lines)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?),
            ..Default::default()
        };
        journal.insert(&*self.db).await.map_err(|e| {
            error!(error = %e, reservation_id = %reservation_id, "Failed to journal reservation");
            ServiceError::DatabaseError(e)
        })?;

        let mut applied: Vec<&ReservedLine> = Vec::with_capacity(lines.len());

        for line in lines {
            let outcome = match self
                .catalog
                .decrement_stock(line.product_id, line.variant_id, line.quantity)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.rollback(reservation_id, &applied).await;
                    STOCK_RESERVATION_FAILURES
                        .with_label_values(&["catalog_error"])
                        .inc();
                    return Err(e);
                }
            };

            match outcome {
                DecrementOutcome::Applied => {
                    if let Err(e) = self
                        .catalog
                        .increment_sales_counter(line.product_id, line.quantity)
                        .await
                    {
                        warn!(
                            error = %e,
                            product_id = %line.product_id,
                            "Failed to bump sales counter after decrement"
                        );
                    }
                    applied.push(line);
                }
                DecrementOutcome::InsufficientStock { available } => {
                    self.rollback(reservation_id, &applied).await;
                    STOCK_RESERVATION_FAILURES
                        .with_label_values(&["insufficient_stock"])
                        .inc();
                    return Err(ServiceError::InsufficientStock(format!(
                        "Variant {}: requested {}, available {}",
                        line.variant_id, line.quantity, available
                    )));
                }
                DecrementOutcome::VariantMissing => {
                    self.rollback(reservation_id, &applied).await;
                    STOCK_RESERVATION_FAILURES
                        .with_label_values(&["variant_missing"])
                        .inc();
                    return Err(ServiceError::NotFound(format!(
                        "Variant {} no longer exists",
                        line.variant_id
                    )));
                }
            }
        }

        STOCK_RESERVATIONS.inc();
        info!(reservation_id = %reservation_id, "Stock reserved");

        if let Err(e) = self
            .event_sender
            .send(Event::StockReserved {
                reservation_id,
                line_count: lines.len(),
            })
            .await
        {
            warn!(error = %e, "Failed to send stock reserved event");
        }

        Ok(())
    }

    /// Stamps a pending reservation as belonging to a persisted order.
    ///
    /// Fails with a conflict if the stale sweep already claimed the row; the
    /// reserved stock has been re-credited in that case and the checkout must
    /// not proceed.
    #[instrument(skip(self), fields(reservation_id = %reservation_id, order_id = %order_id))]
    pub async fn commit(&self, reservation_id: Uuid, order_id: Uuid) -> Result<(), ServiceError> {
        let result = StockReservationEntity::update_many()
            .col_expr(
                stock_reservation::Column::Status,
                Expr::value(ReservationStatus::Committed.as_str()),
            )
            .col_expr(stock_reservation::Column::OrderId, Expr::value(order_id))
            .col_expr(
                stock_reservation::Column::UpdatedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(stock_reservation::Column::Id.eq(reservation_id))
            .filter(stock_reservation::Column::Status.eq(ReservationStatus::Pending.as_str()))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "Reservation {} is no longer pending; its stock has been reclaimed",
                reservation_id
            )));
        }

        Ok(())
    }

    /// Returns every reserved unit (and sales counter) of a cancelled or
    /// failed order to the catalog.
    ///
    /// Idempotent: the order's `stock_reserved` flag is flipped with a
    /// conditional write, so a retry or a racing caller observes `false` and
    /// no-ops. Returns whether this call performed the release.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn release(&self, order: &order::Model) -> Result<bool, ServiceError> {
        let claimed = OrderEntity::update_many()
            .col_expr(order::Column::StockReserved, Expr::value(false))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::StockReserved.eq(true))
            .exec(&*self.db)
            .await?;

        if claimed.rows_affected == 0 {
            info!(order_id = %order.id, "Stock already released; skipping");
            return Ok(false);
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;

        for item in &items {
            match self
                .catalog
                .increment_stock(item.product_id, item.variant_id, item.quantity)
                .await?
            {
                IncrementOutcome::Applied => {
                    if let Err(e) = self
                        .catalog
                        .increment_sales_counter(item.product_id, -item.quantity)
                        .await
                    {
                        warn!(
                            error = %e,
                            product_id = %item.product_id,
                            "Failed to reverse sales counter on release"
                        );
                    }
                }
                IncrementOutcome::VariantMissing => {
                    warn!(
                        variant_id = %item.variant_id,
                        order_id = %order.id,
                        "Variant deleted before release; skipping"
                    );
                }
            }
        }

        StockReservationEntity::update_many()
            .col_expr(
                stock_reservation::Column::Status,
                Expr::value(ReservationStatus::Released.as_str()),
            )
            .col_expr(
                stock_reservation::Column::UpdatedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(stock_reservation::Column::OrderId.eq(order.id))
            .filter(stock_reservation::Column::Status.ne(ReservationStatus::Released.as_str()))
            .exec(&*self.db)
            .await?;

        STOCK_RELEASES.inc();
        info!(order_id = %order.id, item_count = items.len(), "Stock released");

        if let Err(e) = self
            .event_sender
            .send(Event::StockReleased { order_id: order.id })
            .await
        {
            warn!(error = %e, "Failed to send stock released event");
        }

        Ok(true)
    }

    /// Credits back a journalled reservation whose order never persisted.
    /// Used by checkout when phase 2 (order persistence) fails after phase 1
    /// (decrements) succeeded. Errors are logged, not returned; anything left
    /// behind is picked up by the stale sweep.
    #[instrument(skip(self), fields(reservation_id = %reservation_id))]
    pub async fn abort(&self, reservation_id: Uuid) {
        let row = match StockReservationEntity::find_by_id(reservation_id)
            .one(&*self.db)
            .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(reservation_id = %reservation_id, "No journal row to abort");
                return;
            }
            Err(e) => {
                error!(error = %e, reservation_id = %reservation_id, "Failed to load journal row for abort");
                return;
            }
        };

        let claimed = StockReservationEntity::update_many()
            .col_expr(
                stock_reservation::Column::Status,
                Expr::value(ReservationStatus::Released.as_str()),
            )
            .col_expr(
                stock_reservation::Column::UpdatedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(stock_reservation::Column::Id.eq(reservation_id))
            .filter(stock_reservation::Column::Status.eq(ReservationStatus::Pending.as_str()))
            .exec(&*self.db)
            .await;

        match claimed {
            Ok(result) if result.rows_affected == 1 => match row.reserved_lines() {
                Ok(lines) => {
                    self.credit_lines(&lines).await;
                    info!(reservation_id = %reservation_id, "Aborted reservation credited back");
                }
                Err(e) => {
                    error!(error = %e, reservation_id = %reservation_id, "Corrupt journal lines on abort");
                }
            },
            Ok(_) => {
                info!(reservation_id = %reservation_id, "Reservation no longer pending; abort skipped");
            }
            Err(e) => {
                error!(error = %e, reservation_id = %reservation_id, "Failed to claim journal row for abort");
            }
        }
    }

    /// Crash-window recovery: re-credits reservations that decremented stock
    /// but never reached a persisted order.
    ///
    /// Each stale row is claimed with a conditional write before any credit,
    /// so a checkout commit racing the sweep can win on one side only.
    #[instrument(skip(self))]
    pub async fn reconcile_stale(
        &self,
        older_than: chrono::Duration,
    ) -> Result<ReconcileResult, ServiceError> {
        let cutoff = Utc::now() - older_than;

        let stale = StockReservationEntity::find()
            .filter(stock_reservation::Column::Status.eq(ReservationStatus::Pending.as_str()))
            .filter(stock_reservation::Column::CreatedAt.lt(cutoff))
            .all(&*self.db)
            .await?;

        let mut released_count = 0u64;

        for row in stale {
            let claimed = StockReservationEntity::update_many()
                .col_expr(
                    stock_reservation::Column::Status,
                    Expr::value(ReservationStatus::Released.as_str()),
                )
                .col_expr(
                    stock_reservation::Column::UpdatedAt,
                    Expr::value(Some(Utc::now())),
                )
                .filter(stock_reservation::Column::Id.eq(row.id))
                .filter(stock_reservation::Column::Status.eq(ReservationStatus::Pending.as_str()))
                .exec(&*self.db)
                .await?;

            if claimed.rows_affected == 0 {
                continue;
            }

            let lines = row.reserved_lines().map_err(|e| {
                ServiceError::InternalError(format!(
                    "Corrupt reservation journal {}: {}",
                    row.id, e
                ))
            })?;

            self.credit_lines(&lines).await;
            released_count += 1;
            info!(reservation_id = %row.id, "Reclaimed stale reservation");
        }

        Ok(ReconcileResult {
            released_count,
            swept_at: Utc::now(),
        })
    }

    /// Reverses already-applied decrements after a mid-reservation failure.
    /// Lines whose rollback fails stay journalled as pending so the stale
    /// sweep retries them; everything else is marked released.
    async fn rollback(&self, reservation_id: Uuid, applied: &[&ReservedLine]) {
        let mut failed: Vec<ReservedLine> = Vec::new();

        for line in applied {
            let rolled_back = match self
                .catalog
                .increment_stock(line.product_id, line.variant_id, line.quantity)
                .await
            {
                Ok(_) => {
                    if let Err(e) = self
                        .catalog
                        .increment_sales_counter(line.product_id, -line.quantity)
                        .await
                    {
                        warn!(
                            error = %e,
                            product_id = %line.product_id,
                            "Failed to reverse sales counter during rollback"
                        );
                    }
                    true
                }
                Err(e) => {
                    error!(
                        error = %e,
                        variant_id = %line.variant_id,
                        reservation_id = %reservation_id,
                        "Rollback increment failed; leaving line for the stale sweep"
                    );
                    false
                }
            };

            if !rolled_back {
                failed.push((*line).clone());
            }
        }

        let (status, lines) = if failed.is_empty() {
            (ReservationStatus::Released, None)
        } else {
            (
                ReservationStatus::Pending,
                serde_json::to_string(&failed).ok(),
            )
        };

        let mut update = StockReservationEntity::update_many()
            .col_expr(
                stock_reservation::Column::Status,
                Expr::value(status.as_str()),
            )
            .col_expr(
                stock_reservation::Column::UpdatedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(stock_reservation::Column::Id.eq(reservation_id));

        if let Some(lines) = lines {
            update = update.col_expr(stock_reservation::Column::Lines, Expr::value(lines));
        }

        if let Err(e) = update.exec(&*self.db).await {
            error!(
                error = %e,
                reservation_id = %reservation_id,
                "Failed to update reservation journal after rollback"
            );
        }
    }

    async fn credit_lines(&self, lines: &[ReservedLine]) {
        for line in lines {
            match self
                .catalog
                .increment_stock(line.product_id, line.variant_id, line.quantity)
                .await
            {
                Ok(IncrementOutcome::Applied) => {
                    if let Err(e) = self
                        .catalog
                        .increment_sales_counter(line.product_id, -line.quantity)
                        .await
                    {
                        warn!(
                            error = %e,
                            product_id = %line.product_id,
                            "Failed to reverse sales counter during sweep"
                        );
                    }
                }
                Ok(IncrementOutcome::VariantMissing) => {
                    warn!(
                        variant_id = %line.variant_id,
                        "Variant deleted before sweep credit; skipping"
                    );
                }
                Err(e) => {
                    error!(
                        error = %e,
                        variant_id = %line.variant_id,
                        "Sweep credit failed"
                    );
                }
            }
        }
    }
}
