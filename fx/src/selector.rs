//! Active and next-available provider selection.

use std::sync::Arc;

use ratekeeper_common::{ProviderId, TenantId};
use tracing::{debug, warn};

use crate::error::FxResult;
use crate::model::ExchangeRateSetting;
use crate::provider::Provider;
use crate::quota::QuotaTracker;
use crate::registry::ProviderRegistry;

/// Picks which provider an acquisition run should call.
pub struct ProviderSelector {
    registry: Arc<ProviderRegistry>,
    quota: Arc<QuotaTracker>,
}

impl ProviderSelector {
    pub fn new(registry: Arc<ProviderRegistry>, quota: Arc<QuotaTracker>) -> Self {
        Self { registry, quota }
    }

    /// The configured provider if it is still enabled, else the first enabled
    /// provider in selection order. `enabled` must already be ordered.
    pub fn pick_active(enabled: &[Provider], configured: Option<ProviderId>) -> Option<&Provider> {
        configured
            .and_then(|id| enabled.iter().find(|p| p.id == id))
            .or_else(|| enabled.first())
    }

    /// Active provider for the tenant described by `setting`.
    pub async fn get_active(&self, setting: &ExchangeRateSetting) -> FxResult<Option<Provider>> {
        let enabled = self.registry.enabled_providers(&setting.tenant_id).await?;
        Ok(Self::pick_active(&enabled, setting.active_provider_id).cloned())
    }

    /// First enabled provider after `current` whose quota is not exhausted.
    pub async fn get_next_available(
        &self,
        tenant: &TenantId,
        current: &Provider,
    ) -> FxResult<Option<Provider>> {
        let enabled = self.registry.enabled_providers(tenant).await?;
        Ok(self.next_available_in(&enabled, current).await)
    }

    /// Scan an ordered provider list for the next usable provider after
    /// `current`. Candidates whose quota cannot be read are skipped.
    pub async fn next_available_in(
        &self,
        enabled: &[Provider],
        current: &Provider,
    ) -> Option<Provider> {
        let current_key = current.sort_key();

        for candidate in enabled.iter().filter(|p| p.sort_key() > current_key) {
            if candidate.is_unlimited {
                return Some(candidate.clone());
            }

            match self.quota.is_exhausted(candidate).await {
                Ok(false) => return Some(candidate.clone()),
                Ok(true) => {
                    debug!(provider = %candidate.code, "Skipping exhausted provider");
                }
                Err(e) => {
                    warn!(
                        provider = %candidate.code,
                        error = %e,
                        "Quota unreadable, skipping provider"
                    );
                }
            }
        }

        None
    }
}
