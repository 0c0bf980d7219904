//! Provider catalog table.

use async_trait::async_trait;
use ratekeeper_common::{PersistenceResult, ProviderId, TenantId};
use ratekeeper_fx::store::ProviderRepository;
use ratekeeper_fx::{Provider, ResponseFormat};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::map_sqlx_error;

const PROVIDER_COLUMNS: &str = "id, tenant_id, code, name, api_url, api_key, requires_api_key, \
     is_unlimited, monthly_quota, priority, is_enabled, warning_threshold, critical_threshold, \
     response_format";

#[derive(sqlx::FromRow)]
struct ProviderRow {
    id: Uuid,
    tenant_id: String,
    code: String,
    name: String,
    api_url: String,
    api_key: Option<String>,
    requires_api_key: bool,
    is_unlimited: bool,
    monthly_quota: Option<i64>,
    priority: i32,
    is_enabled: bool,
    warning_threshold: i64,
    critical_threshold: i64,
    response_format: Json<ResponseFormat>,
}

impl From<ProviderRow> for Provider {
    fn from(row: ProviderRow) -> Self {
        Provider {
            id: ProviderId::from_uuid(row.id),
            tenant_id: TenantId::new(row.tenant_id),
            code: row.code,
            name: row.name,
            api_url: row.api_url,
            api_key: row.api_key,
            requires_api_key: row.requires_api_key,
            is_unlimited: row.is_unlimited,
            monthly_quota: row.monthly_quota,
            priority: row.priority,
            is_enabled: row.is_enabled,
            warning_threshold: row.warning_threshold,
            critical_threshold: row.critical_threshold,
            response_format: row.response_format.0,
        }
    }
}

/// `rate_providers` table.
#[derive(Clone)]
pub struct PgProviderRepository {
    pool: PgPool,
}

impl PgProviderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderRepository for PgProviderRepository {
    async fn list_for_tenant(&self, tenant: &TenantId) -> PersistenceResult<Vec<Provider>> {
        let query = format!(
            "SELECT {} FROM rate_providers WHERE tenant_id = $1",
            PROVIDER_COLUMNS
        );
        let rows: Vec<ProviderRow> = sqlx::query_as(&query)
            .bind(tenant.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(Provider::from).collect())
    }

    async fn get(&self, id: ProviderId) -> PersistenceResult<Option<Provider>> {
        let query = format!("SELECT {} FROM rate_providers WHERE id = $1", PROVIDER_COLUMNS);
        let row: Option<ProviderRow> = sqlx::query_as(&query)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(Provider::from))
    }

    async fn upsert(&self, provider: Provider) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_providers (
                id, tenant_id, code, name, api_url, api_key, requires_api_key,
                is_unlimited, monthly_quota, priority, is_enabled,
                warning_threshold, critical_threshold, response_format
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                code = EXCLUDED.code,
                name = EXCLUDED.name,
                api_url = EXCLUDED.api_url,
                api_key = EXCLUDED.api_key,
                requires_api_key = EXCLUDED.requires_api_key,
                is_unlimited = EXCLUDED.is_unlimited,
                monthly_quota = EXCLUDED.monthly_quota,
                priority = EXCLUDED.priority,
                is_enabled = EXCLUDED.is_enabled,
                warning_threshold = EXCLUDED.warning_threshold,
                critical_threshold = EXCLUDED.critical_threshold,
                response_format = EXCLUDED.response_format
            "#,
        )
        .bind(*provider.id.as_uuid())
        .bind(provider.tenant_id.as_str())
        .bind(&provider.code)
        .bind(&provider.name)
        .bind(&provider.api_url)
        .bind(&provider.api_key)
        .bind(provider.requires_api_key)
        .bind(provider.is_unlimited)
        .bind(provider.monthly_quota)
        .bind(provider.priority)
        .bind(provider.is_enabled)
        .bind(provider.warning_threshold)
        .bind(provider.critical_threshold)
        .bind(Json(&provider.response_format))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn set_enabled(&self, id: ProviderId, enabled: bool) -> PersistenceResult<bool> {
        let result = sqlx::query("UPDATE rate_providers SET is_enabled = $2 WHERE id = $1")
            .bind(*id.as_uuid())
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_priority(&self, id: ProviderId, priority: i32) -> PersistenceResult<bool> {
        let result = sqlx::query("UPDATE rate_providers SET priority = $2 WHERE id = $1")
            .bind(*id.as_uuid())
            .bind(priority)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}
