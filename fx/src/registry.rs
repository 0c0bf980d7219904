//! Ordered catalog of providers per tenant.

use std::sync::Arc;

use ratekeeper_common::{ProviderId, TenantId};
use tracing::info;

use crate::error::{FxError, FxResult};
use crate::provider::{order_providers, Provider};
use crate::store::{with_persistence_retry, ProviderRepository};

/// Provider catalog with invariant checks on write.
pub struct ProviderRegistry {
    repo: Arc<dyn ProviderRepository>,
}

impl ProviderRegistry {
    pub fn new(repo: Arc<dyn ProviderRepository>) -> Self {
        Self { repo }
    }

    /// Every provider for `tenant`, in selection order.
    pub async fn all_providers(&self, tenant: &TenantId) -> FxResult<Vec<Provider>> {
        let mut providers =
            with_persistence_retry("providers.list", || self.repo.list_for_tenant(tenant)).await?;
        order_providers(&mut providers);
        Ok(providers)
    }

    /// Enabled providers for `tenant`, in selection order.
    pub async fn enabled_providers(&self, tenant: &TenantId) -> FxResult<Vec<Provider>> {
        let mut providers = self.all_providers(tenant).await?;
        providers.retain(|p| p.is_enabled);
        Ok(providers)
    }

    pub async fn get(&self, id: ProviderId) -> FxResult<Option<Provider>> {
        Ok(with_persistence_retry("providers.get", || self.repo.get(id)).await?)
    }

    /// Validate and store a provider.
    pub async fn register(&self, provider: Provider) -> FxResult<()> {
        provider.validate()?;

        info!(
            tenant = %provider.tenant_id,
            provider = %provider.code,
            priority = provider.priority,
            "Registering provider"
        );

        with_persistence_retry("providers.upsert", || self.repo.upsert(provider.clone())).await?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: ProviderId, enabled: bool) -> FxResult<()> {
        let found =
            with_persistence_retry("providers.set_enabled", || self.repo.set_enabled(id, enabled))
                .await?;
        if !found {
            return Err(FxError::ProviderNotFound(id));
        }

        info!(provider_id = %id, enabled, "Provider availability changed");
        Ok(())
    }

    pub async fn set_priority(&self, id: ProviderId, priority: i32) -> FxResult<()> {
        let found = with_persistence_retry("providers.set_priority", || {
            self.repo.set_priority(id, priority)
        })
        .await?;
        if !found {
            return Err(FxError::ProviderNotFound(id));
        }

        info!(provider_id = %id, priority, "Provider priority changed");
        Ok(())
    }
}
