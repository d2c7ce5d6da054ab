//! In-process feature store.
//!
//! Used by tests and by short-lived tooling. Fault injection hooks let tests
//! exercise the read-failure paths.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::FeatureStore;
use crate::models::{
    EventRecord, FeatureRecord, FeatureRef, FeatureSet, PipelineRun, RawRecord, Window,
};

#[derive(Default)]
struct Inner {
    events: HashMap<String, EventRecord>,
    /// entity -> every feature version in insertion order
    features: HashMap<String, Vec<FeatureRecord>>,
    contributors: HashMap<(String, FeatureRef), Vec<RawRecord>>,
    runs: Vec<PipelineRun>,
    unreadable: Vec<String>,
}

#[derive(Default)]
pub struct MemoryFeatureStore {
    inner: RwLock<Inner>,
}

impl MemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_event(&self, event: EventRecord) {
        self.inner
            .write()
            .events
            .insert(event.entity_id.clone(), event);
    }

    pub fn insert_features(&self, entity_id: &str, records: impl IntoIterator<Item = FeatureRecord>) {
        self.inner
            .write()
            .features
            .entry(entity_id.to_string())
            .or_default()
            .extend(records);
    }

    /// Register raw records behind an aggregate feature. Stored newest first.
    pub fn insert_contributors(&self, entity_id: &str, feature: FeatureRef, mut records: Vec<RawRecord>) {
        records.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        self.inner
            .write()
            .contributors
            .insert((entity_id.to_string(), feature), records);
    }

    /// Make every read for this entity fail.
    pub fn mark_unreadable(&self, entity_id: &str) {
        self.inner.write().unreadable.push(entity_id.to_string());
    }

    pub fn runs(&self) -> Vec<PipelineRun> {
        self.inner.read().runs.clone()
    }

    fn check_readable(inner: &Inner, entity_id: &str) -> Result<()> {
        if inner.unreadable.iter().any(|e| e == entity_id) {
            bail!("entity {} is unreadable", entity_id);
        }
        Ok(())
    }
}

fn latest_versions<'a, I>(versions: I) -> FeatureSet
where
    I: IntoIterator<Item = &'a FeatureRecord>,
{
    let mut set = FeatureSet::new();
    for record in versions {
        let newer = set
            .get(&record.feature)
            .map_or(true, |existing| record.observed_at >= existing.observed_at);
        if newer {
            set.insert(record.feature.clone(), record.clone());
        }
    }
    set
}

#[async_trait]
impl FeatureStore for MemoryFeatureStore {
    async fn event(&self, entity_id: &str) -> Result<EventRecord> {
        let inner = self.inner.read();
        Self::check_readable(&inner, entity_id)?;
        inner
            .events
            .get(entity_id)
            .cloned()
            .ok_or_else(|| anyhow!("no event record for {}", entity_id))
    }

    async fn features(&self, entity_id: &str) -> Result<FeatureSet> {
        let inner = self.inner.read();
        Self::check_readable(&inner, entity_id)?;
        Ok(inner
            .features
            .get(entity_id)
            .map(|v| latest_versions(v.iter()))
            .unwrap_or_default())
    }

    async fn features_as_of(&self, entity_id: &str, as_of: DateTime<Utc>) -> Result<FeatureSet> {
        let inner = self.inner.read();
        Self::check_readable(&inner, entity_id)?;
        Ok(inner
            .features
            .get(entity_id)
            .map(|v| latest_versions(v.iter().filter(|r| r.observed_at <= as_of)))
            .unwrap_or_default())
    }

    async fn put_features(&self, entity_id: &str, records: &[FeatureRecord]) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_readable(&inner, entity_id)?;
        let versions = inner.features.entry(entity_id.to_string()).or_default();
        for record in records {
            // One version per (ref, observed_at, source); re-emitted history is not new.
            let known = versions.iter().any(|v| {
                v.feature == record.feature
                    && v.observed_at == record.observed_at
                    && v.source == record.source
            });
            if !known {
                versions.push(record.clone());
            }
        }
        Ok(())
    }

    async fn contributing_records(
        &self,
        entity_id: &str,
        feature: &FeatureRef,
        limit: usize,
    ) -> Result<Vec<RawRecord>> {
        let inner = self.inner.read();
        Self::check_readable(&inner, entity_id)?;
        Ok(inner
            .contributors
            .get(&(entity_id.to_string(), feature.clone()))
            .map(|v| v.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn long_run_average(
        &self,
        entity_id: &str,
        feature: &FeatureRef,
        before: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let inner = self.inner.read();
        Self::check_readable(&inner, entity_id)?;
        let values: Vec<f64> = inner
            .features
            .get(entity_id)
            .into_iter()
            .flatten()
            .filter(|r| &r.feature == feature && r.observed_at <= before)
            .map(|r| r.value)
            .collect();
        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        self.inner.write().runs.push(run.clone());
        Ok(())
    }

    async fn latest_run(&self, entity_id: &str, window: Window) -> Result<Option<PipelineRun>> {
        let inner = self.inner.read();
        Self::check_readable(&inner, entity_id)?;
        // Later inserts win ties so a rerun in the same instant is "latest".
        let mut best: Option<&PipelineRun> = None;
        for run in inner
            .runs
            .iter()
            .filter(|r| r.entity_id == entity_id && r.window == window)
        {
            if best.map_or(true, |b| run.executed_at >= b.executed_at) {
                best = Some(run);
            }
        }
        Ok(best.cloned())
    }

    async fn upcoming_events(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        let inner = self.inner.read();
        let mut events: Vec<EventRecord> = inner
            .events
            .values()
            .filter(|e| e.event_start >= from && e.event_start <= until)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.event_start
                .cmp(&b.event_start)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_as_of_returns_older_version() {
        let store = MemoryFeatureStore::new();
        let feature = FeatureRef::team("ARS", "form_last5");
        store.insert_features(
            "fx-1",
            vec![
                FeatureRecord::new(feature.clone(), 2.0, t0() - Duration::days(3), "team_stats"),
                FeatureRecord::new(feature.clone(), 3.0, t0(), "team_stats"),
            ],
        );

        let latest = store.features("fx-1").await.unwrap();
        assert_eq!(latest[&feature].value, 3.0);

        let older = store
            .features_as_of("fx-1", t0() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(older[&feature].value, 2.0);

        let avg = store
            .long_run_average("fx-1", &feature, t0())
            .await
            .unwrap();
        assert_eq!(avg, Some(2.5));
    }

    #[tokio::test]
    async fn test_rewritten_versions_are_not_duplicated() {
        let store = MemoryFeatureStore::new();
        let feature = FeatureRef::team("ARS", "form_last5");
        let history = vec![
            FeatureRecord::new(feature.clone(), 1.0, t0() - Duration::days(10), "team_stats"),
            FeatureRecord::new(feature.clone(), 2.0, t0() - Duration::days(3), "team_stats"),
        ];
        store.put_features("fx-1", &history).await.unwrap();
        store.put_features("fx-1", &history[1..]).await.unwrap();
        store.put_features("fx-1", &history).await.unwrap();

        let avg = store.long_run_average("fx-1", &feature, t0()).await.unwrap();
        assert_eq!(avg, Some(1.5));
    }

    #[tokio::test]
    async fn test_unreadable_entity_errors() {
        let store = MemoryFeatureStore::new();
        store.mark_unreadable("fx-9");
        assert!(store.features("fx-9").await.is_err());
        assert!(store.event("fx-9").await.is_err());
    }

    #[tokio::test]
    async fn test_contributors_limited_newest_first() {
        let store = MemoryFeatureStore::new();
        let feature = FeatureRef::team("ARS", "form_last5");
        let records = (0..8)
            .map(|i| RawRecord {
                record_id: format!("m{}", i),
                occurred_at: t0() - Duration::days(i),
                recorded_at: t0() - Duration::days(i),
            })
            .collect();
        store.insert_contributors("fx-1", feature.clone(), records);

        let last3 = store
            .contributing_records("fx-1", &feature, 3)
            .await
            .unwrap();
        assert_eq!(last3.len(), 3);
        assert_eq!(last3[0].record_id, "m0");
    }
}
