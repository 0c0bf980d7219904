//! Monthly quota counters.
//!
//! Every write is one `INSERT ... ON CONFLICT DO UPDATE ... RETURNING`
//! statement, so Postgres row locking serializes concurrent increments on
//! the same (tenant, provider, month) key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ratekeeper_common::{PersistenceResult, ProviderId, TenantId, Timestamp, YearMonth};
use ratekeeper_fx::store::QuotaTrackingRepository;
use ratekeeper_fx::{QuotaKey, QuotaTracking};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::map_sqlx_error;

const QUOTA_COLUMNS: &str =
    "tenant_id, provider_id, year, month, requests_made, quota_limit, last_reset_at, created_at";

#[derive(sqlx::FromRow)]
struct QuotaRow {
    tenant_id: String,
    provider_id: Uuid,
    year: i32,
    month: i32,
    requests_made: i64,
    quota_limit: Option<i64>,
    last_reset_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<QuotaRow> for QuotaTracking {
    fn from(row: QuotaRow) -> Self {
        QuotaTracking {
            key: QuotaKey::new(
                TenantId::new(row.tenant_id),
                ProviderId::from_uuid(row.provider_id),
                YearMonth::new(row.year, row.month as u32),
            ),
            requests_made: row.requests_made,
            quota_limit: row.quota_limit,
            last_reset_at: row.last_reset_at,
            created_at: row.created_at,
        }
    }
}

/// `quota_tracking` table.
#[derive(Clone)]
pub struct PgQuotaRepository {
    pool: PgPool,
}

impl PgQuotaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the key with `initial` requests, or apply `on_conflict` to the
    /// existing row, returning the row either way.
    async fn write(
        &self,
        key: &QuotaKey,
        quota_limit: Option<i64>,
        now: Timestamp,
        initial: i64,
        on_conflict: &str,
    ) -> PersistenceResult<QuotaTracking> {
        let query = format!(
            r#"
            INSERT INTO quota_tracking (
                tenant_id, provider_id, year, month, requests_made,
                quota_limit, last_reset_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (tenant_id, provider_id, year, month) DO UPDATE SET {}
            RETURNING {}
            "#,
            on_conflict, QUOTA_COLUMNS
        );

        let row: QuotaRow = sqlx::query_as(&query)
            .bind(key.tenant_id.as_str())
            .bind(*key.provider_id.as_uuid())
            .bind(key.period.year)
            .bind(key.period.month as i32)
            .bind(initial)
            .bind(quota_limit)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.into())
    }
}

#[async_trait]
impl QuotaTrackingRepository for PgQuotaRepository {
    async fn get(&self, key: &QuotaKey) -> PersistenceResult<Option<QuotaTracking>> {
        let query = format!(
            "SELECT {} FROM quota_tracking \
             WHERE tenant_id = $1 AND provider_id = $2 AND year = $3 AND month = $4",
            QUOTA_COLUMNS
        );
        let row: Option<QuotaRow> = sqlx::query_as(&query)
            .bind(key.tenant_id.as_str())
            .bind(*key.provider_id.as_uuid())
            .bind(key.period.year)
            .bind(key.period.month as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(QuotaTracking::from))
    }

    async fn get_or_create(
        &self,
        key: &QuotaKey,
        quota_limit: Option<i64>,
        now: Timestamp,
    ) -> PersistenceResult<QuotaTracking> {
        // No-op update so RETURNING yields the existing row.
        self.write(
            key,
            quota_limit,
            now,
            0,
            "requests_made = quota_tracking.requests_made",
        )
        .await
    }

    async fn increment(
        &self,
        key: &QuotaKey,
        quota_limit: Option<i64>,
        now: Timestamp,
    ) -> PersistenceResult<QuotaTracking> {
        self.write(
            key,
            quota_limit,
            now,
            1,
            "requests_made = quota_tracking.requests_made + 1",
        )
        .await
    }

    async fn reset(
        &self,
        key: &QuotaKey,
        quota_limit: Option<i64>,
        now: Timestamp,
    ) -> PersistenceResult<QuotaTracking> {
        self.write(
            key,
            quota_limit,
            now,
            0,
            "requests_made = 0, quota_limit = EXCLUDED.quota_limit, \
             last_reset_at = EXCLUDED.last_reset_at",
        )
        .await
    }
}
