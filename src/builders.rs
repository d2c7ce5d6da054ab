//! Feature Builder Contracts
//!
//! Builders produce raw feature values; the engine never computes them itself.
//! Every record a builder returns must carry `observed_at` and `source`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{BuilderCategory, FeatureRecord, FeatureRef, FeatureSet, Window};
use crate::store::FeatureStore;

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub entity_id: String,
    pub window: Window,
    /// Builders must only use data at or before this instant.
    pub cutoff: DateTime<Utc>,
    /// Restrict the build to these features (correction path). `None` builds all.
    pub only: Option<Vec<FeatureRef>>,
}

impl BuildRequest {
    pub fn wants(&self, feature: &FeatureRef) -> bool {
        self.only.as_ref().map_or(true, |only| only.contains(feature))
    }
}

/// Base builder for one category (team, player, context).
#[async_trait]
pub trait FeatureBuilder: Send + Sync {
    fn category(&self) -> BuilderCategory;

    /// Returning `Ok` without a requested feature means "insufficient data".
    async fn build(&self, request: &BuildRequest) -> Result<Vec<FeatureRecord>>;
}

/// Derived-feature builder run after the base builders.
#[async_trait]
pub trait AdaptiveBuilder: Send + Sync {
    fn name(&self) -> &str;

    async fn derive(
        &self,
        entity_id: &str,
        window: Window,
        cutoff: DateTime<Utc>,
        base: &FeatureSet,
    ) -> Result<Vec<FeatureRecord>>;
}

/// Base builders keyed by category, plus adaptive builders in run order.
#[derive(Clone, Default)]
pub struct BuilderSet {
    pub base: Vec<Arc<dyn FeatureBuilder>>,
    pub adaptive: Vec<Arc<dyn AdaptiveBuilder>>,
}

impl BuilderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(mut self, builder: Arc<dyn FeatureBuilder>) -> Self {
        self.base.push(builder);
        self
    }

    pub fn with_adaptive(mut self, builder: Arc<dyn AdaptiveBuilder>) -> Self {
        self.adaptive.push(builder);
        self
    }

    pub fn for_category(&self, category: BuilderCategory) -> Option<&Arc<dyn FeatureBuilder>> {
        self.base.iter().find(|b| b.category() == category)
    }
}

/// Re-emits the latest stored version of each feature as of the request cutoff.
///
/// Used when import jobs write feature history straight into the store: a build
/// then selects what was known at the cutoff, and a correction under a tightened
/// cutoff falls back to an older version.
pub struct StoredFeatureBuilder {
    category: BuilderCategory,
    store: Arc<dyn FeatureStore>,
}

impl StoredFeatureBuilder {
    pub fn new(category: BuilderCategory, store: Arc<dyn FeatureStore>) -> Self {
        Self { category, store }
    }

    /// One stored-feature builder per base category.
    pub fn all(store: Arc<dyn FeatureStore>) -> BuilderSet {
        BuilderCategory::ALL
            .iter()
            .fold(BuilderSet::new(), |set, category| {
                set.with_base(Arc::new(Self::new(*category, store.clone())))
            })
    }
}

#[async_trait]
impl FeatureBuilder for StoredFeatureBuilder {
    fn category(&self) -> BuilderCategory {
        self.category
    }

    async fn build(&self, request: &BuildRequest) -> Result<Vec<FeatureRecord>> {
        let known = self
            .store
            .features_as_of(&request.entity_id, request.cutoff)
            .await?;
        Ok(known
            .into_values()
            .filter(|r| self.category.covers(&r.feature.scope))
            .filter(|r| request.wants(&r.feature))
            .collect())
    }
}
