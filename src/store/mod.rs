//! Feature/Event Store
//!
//! The engine reads entity features and event records through [`FeatureStore`] and
//! writes pipeline runs back. Implementations keep feature history so values can be
//! re-read "as of" an earlier instant.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{EventRecord, FeatureRecord, FeatureRef, FeatureSet, PipelineRun, RawRecord, Window};

pub use memory::MemoryFeatureStore;
pub use sqlite::SqliteFeatureStore;

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Primary record of an entity.
    async fn event(&self, entity_id: &str) -> Result<EventRecord>;

    /// Latest version of every feature attached to the entity.
    async fn features(&self, entity_id: &str) -> Result<FeatureSet>;

    /// Latest version of every feature with `observed_at <= as_of`.
    async fn features_as_of(&self, entity_id: &str, as_of: DateTime<Utc>) -> Result<FeatureSet>;

    /// Append feature versions. Existing versions are kept as history.
    async fn put_features(&self, entity_id: &str, records: &[FeatureRecord]) -> Result<()>;

    /// The last `limit` raw records that fed an aggregate feature, newest first.
    async fn contributing_records(
        &self,
        entity_id: &str,
        feature: &FeatureRef,
        limit: usize,
    ) -> Result<Vec<RawRecord>>;

    /// Long-run average of a feature before `before`, if enough history exists.
    async fn long_run_average(
        &self,
        entity_id: &str,
        feature: &FeatureRef,
        before: DateTime<Utc>,
    ) -> Result<Option<f64>>;

    async fn save_run(&self, run: &PipelineRun) -> Result<()>;

    /// Most recent run for (entity, window) by execution time.
    async fn latest_run(&self, entity_id: &str, window: Window) -> Result<Option<PipelineRun>>;

    /// Events with `from <= event_start <= until`.
    async fn upcoming_events(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>>;
}
