//! Per-tenant exchange rate settings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ratekeeper_common::{
    Currency, CurrencyPair, PersistenceError, PersistenceResult, ProviderId, TenantId,
};
use ratekeeper_fx::store::SettingsRepository;
use ratekeeper_fx::ExchangeRateSetting;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{decode_enum, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct SettingRow {
    tenant_id: String,
    base_currency: String,
    quote_currency: String,
    mode: String,
    manual_rate: Option<Decimal>,
    manual_rate_set_at: Option<DateTime<Utc>>,
    current_rate: Option<Decimal>,
    current_rate_fetched_at: Option<DateTime<Utc>>,
    active_provider_id: Option<Uuid>,
    fallback_active: bool,
    stale_level: String,
    update_time: DateTime<Utc>,
}

impl TryFrom<SettingRow> for ExchangeRateSetting {
    type Error = PersistenceError;

    fn try_from(row: SettingRow) -> Result<Self, Self::Error> {
        Ok(ExchangeRateSetting {
            tenant_id: TenantId::new(row.tenant_id),
            pair: CurrencyPair::new(
                Currency::new(row.base_currency.trim()),
                Currency::new(row.quote_currency.trim()),
            ),
            mode: decode_enum("mode", row.mode)?,
            manual_rate: row.manual_rate,
            manual_rate_set_at: row.manual_rate_set_at,
            current_rate: row.current_rate,
            current_rate_fetched_at: row.current_rate_fetched_at,
            active_provider_id: row.active_provider_id.map(ProviderId::from_uuid),
            fallback_active: row.fallback_active,
            stale_level: decode_enum("stale_level", row.stale_level)?,
            update_time: row.update_time,
        })
    }
}

/// `exchange_rate_settings` table.
#[derive(Clone)]
pub struct PgSettingsRepository {
    pool: PgPool,
}

impl PgSettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for PgSettingsRepository {
    async fn get(&self, tenant: &TenantId) -> PersistenceResult<Option<ExchangeRateSetting>> {
        let row: Option<SettingRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, base_currency, quote_currency, mode, manual_rate,
                   manual_rate_set_at, current_rate, current_rate_fetched_at,
                   active_provider_id, fallback_active, stale_level, update_time
            FROM exchange_rate_settings
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(ExchangeRateSetting::try_from).transpose()
    }

    async fn save(&self, setting: ExchangeRateSetting) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO exchange_rate_settings (
                tenant_id, base_currency, quote_currency, mode, manual_rate,
                manual_rate_set_at, current_rate, current_rate_fetched_at,
                active_provider_id, fallback_active, stale_level, update_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (tenant_id) DO UPDATE SET
                base_currency = EXCLUDED.base_currency,
                quote_currency = EXCLUDED.quote_currency,
                mode = EXCLUDED.mode,
                manual_rate = EXCLUDED.manual_rate,
                manual_rate_set_at = EXCLUDED.manual_rate_set_at,
                current_rate = EXCLUDED.current_rate,
                current_rate_fetched_at = EXCLUDED.current_rate_fetched_at,
                active_provider_id = EXCLUDED.active_provider_id,
                fallback_active = EXCLUDED.fallback_active,
                stale_level = EXCLUDED.stale_level,
                update_time = EXCLUDED.update_time
            "#,
        )
        .bind(setting.tenant_id.as_str())
        .bind(setting.pair.base.code())
        .bind(setting.pair.quote.code())
        .bind(setting.mode.as_str())
        .bind(setting.manual_rate)
        .bind(setting.manual_rate_set_at)
        .bind(setting.current_rate)
        .bind(setting.current_rate_fetched_at)
        .bind(setting.active_provider_id.map(|id| *id.as_uuid()))
        .bind(setting.fallback_active)
        .bind(setting.stale_level.as_str())
        .bind(setting.update_time)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }
}
