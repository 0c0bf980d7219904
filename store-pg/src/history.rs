//! Rate history and provider switch audit tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ratekeeper_common::{
    Currency, CurrencyPair, EventId, PersistenceError, PersistenceResult, ProviderId, TenantId,
};
use ratekeeper_fx::store::HistoryRepository;
use ratekeeper_fx::{ExchangeRateHistory, ProviderSwitchEvent, RateSource};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{decode_enum, map_sqlx_error};

const HISTORY_COLUMNS: &str = "id, tenant_id, base_currency, quote_currency, rate, provider_id, \
     source, event_type, metadata, fetched_at, created_at";

const SWITCH_COLUMNS: &str =
    "id, tenant_id, old_provider_id, new_provider_id, reason, metadata, created_at";

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    tenant_id: String,
    base_currency: String,
    quote_currency: String,
    rate: Decimal,
    provider_id: Option<Uuid>,
    source: String,
    event_type: String,
    metadata: serde_json::Value,
    fetched_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for ExchangeRateHistory {
    type Error = PersistenceError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(ExchangeRateHistory {
            id: EventId::from_uuid(row.id),
            tenant_id: TenantId::new(row.tenant_id),
            pair: CurrencyPair::new(
                Currency::new(row.base_currency.trim()),
                Currency::new(row.quote_currency.trim()),
            ),
            rate: row.rate,
            provider_id: row.provider_id.map(ProviderId::from_uuid),
            source: decode_enum("source", row.source)?,
            event_type: decode_enum("event_type", row.event_type)?,
            metadata: row.metadata,
            fetched_at: row.fetched_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SwitchRow {
    id: Uuid,
    tenant_id: String,
    old_provider_id: Option<Uuid>,
    new_provider_id: Option<Uuid>,
    reason: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<SwitchRow> for ProviderSwitchEvent {
    fn from(row: SwitchRow) -> Self {
        ProviderSwitchEvent {
            id: EventId::from_uuid(row.id),
            tenant_id: TenantId::new(row.tenant_id),
            old_provider_id: row.old_provider_id.map(ProviderId::from_uuid),
            new_provider_id: row.new_provider_id.map(ProviderId::from_uuid),
            reason: row.reason,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

/// `exchange_rate_history` and `provider_switch_events` tables.
#[derive(Clone)]
pub struct PgHistoryRepository {
    pool: PgPool,
}

impl PgHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryRepository for PgHistoryRepository {
    async fn append(&self, entry: ExchangeRateHistory) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO exchange_rate_history (
                id, tenant_id, base_currency, quote_currency, rate, provider_id,
                source, event_type, metadata, fetched_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(*entry.id.as_uuid())
        .bind(entry.tenant_id.as_str())
        .bind(entry.pair.base.code())
        .bind(entry.pair.quote.code())
        .bind(entry.rate)
        .bind(entry.provider_id.map(|id| *id.as_uuid()))
        .bind(entry.source.as_str())
        .bind(entry.event_type.as_str())
        .bind(&entry.metadata)
        .bind(entry.fetched_at)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn latest_by_source(
        &self,
        tenant: &TenantId,
        pair: &CurrencyPair,
        source: RateSource,
    ) -> PersistenceResult<Option<ExchangeRateHistory>> {
        let query = format!(
            "SELECT {} FROM exchange_rate_history \
             WHERE tenant_id = $1 AND base_currency = $2 AND quote_currency = $3 \
             AND source = $4 \
             ORDER BY created_at DESC LIMIT 1",
            HISTORY_COLUMNS
        );
        let row: Option<HistoryRow> = sqlx::query_as(&query)
            .bind(tenant.as_str())
            .bind(pair.base.code())
            .bind(pair.quote.code())
            .bind(source.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(ExchangeRateHistory::try_from).transpose()
    }

    async fn recent(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> PersistenceResult<Vec<ExchangeRateHistory>> {
        let query = format!(
            "SELECT {} FROM exchange_rate_history WHERE tenant_id = $1 \
             ORDER BY created_at DESC LIMIT $2",
            HISTORY_COLUMNS
        );
        let rows: Vec<HistoryRow> = sqlx::query_as(&query)
            .bind(tenant.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(ExchangeRateHistory::try_from).collect()
    }

    async fn append_switch(&self, event: ProviderSwitchEvent) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_switch_events (
                id, tenant_id, old_provider_id, new_provider_id, reason, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*event.id.as_uuid())
        .bind(event.tenant_id.as_str())
        .bind(event.old_provider_id.map(|id| *id.as_uuid()))
        .bind(event.new_provider_id.map(|id| *id.as_uuid()))
        .bind(&event.reason)
        .bind(&event.metadata)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn recent_switches(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> PersistenceResult<Vec<ProviderSwitchEvent>> {
        let query = format!(
            "SELECT {} FROM provider_switch_events WHERE tenant_id = $1 \
             ORDER BY created_at DESC LIMIT $2",
            SWITCH_COLUMNS
        );
        let rows: Vec<SwitchRow> = sqlx::query_as(&query)
            .bind(tenant.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(ProviderSwitchEvent::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratekeeper_fx::EventType;
    use rust_decimal_macros::dec;

    #[test]
    fn test_row_conversion_keeps_precision() {
        let now = Utc::now();
        let row = HistoryRow {
            id: Uuid::now_v7(),
            tenant_id: "shop_eu".to_string(),
            base_currency: "USD".to_string(),
            quote_currency: "EUR".to_string(),
            rate: dec!(0.918273645512),
            provider_id: None,
            source: "cache".to_string(),
            event_type: "fallback".to_string(),
            metadata: serde_json::json!({ "age_hours": 2.0 }),
            fetched_at: now,
            created_at: now,
        };

        let entry = ExchangeRateHistory::try_from(row).unwrap();
        assert_eq!(entry.rate.to_string(), "0.918273645512");
        assert_eq!(entry.source, RateSource::Cache);
        assert_eq!(entry.event_type, EventType::Fallback);
        assert_eq!(entry.pair, CurrencyPair::default());
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let now = Utc::now();
        let row = HistoryRow {
            id: Uuid::now_v7(),
            tenant_id: "shop_eu".to_string(),
            base_currency: "USD".to_string(),
            quote_currency: "EUR".to_string(),
            rate: dec!(1),
            provider_id: None,
            source: "api".to_string(),
            event_type: "rollback".to_string(),
            metadata: serde_json::Value::Null,
            fetched_at: now,
            created_at: now,
        };

        assert!(ExchangeRateHistory::try_from(row).is_err());
    }
}
