use tracing::{debug, info};

use crate::db::Cache;
use crate::error::Result;
use crate::models::{ObservationSet, RiskSeries};
use crate::risk::RiskModel;

/// Serves risk series for observation sets, consulting the cache first.
pub struct RiskGateway<M> {
    cache: Cache,
    model: M,
}

impl<M: RiskModel> RiskGateway<M> {
    pub fn new(cache: Cache, model: M) -> Self {
        Self { cache, model }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Returns the risk series for `set`. With `use_cache` the set is stored
    /// under its fingerprint and a previously stored series is returned
    /// without recomputing; cache failures propagate. Without it the model
    /// runs directly and the cache is not touched.
    pub async fn compute(&self, set: &ObservationSet, use_cache: bool) -> Result<RiskSeries> {
        if !use_cache {
            return Ok(self.model.compute(set));
        }

        let key = self.cache.store_observations(set).await?;

        if let Some(cached) = self.cache.get_risk(&key).await? {
            debug!(key = key.short(), "using cached risk series");
            return Ok(cached);
        }

        info!(key = key.short(), points = set.len(), "computing new risk series");
        let series = self.model.compute(set);
        self.cache.store_risk(&key, &series).await?;
        Ok(series)
    }
}
