//! Correction Engine
//!
//! Heals a contaminated feature set in four steps, each a no-op when it has
//! nothing to act on:
//! 1. recompute violated features under a cutoff tightened by a safety margin;
//!    a recomputed "last N" aggregate must also have every input inside it
//! 2. strip violated features that could not be recomputed
//! 3. substitute population priors for load-bearing team features still missing
//! 4. smooth recomputed volatile features toward their long-run average
//!
//! The engine never returns an error. Step failures are recorded on the report,
//! and a feature that cannot be produced safely is absent rather than stale.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::builders::{BuildRequest, BuilderSet};
use crate::config::TemporalConfig;
use crate::models::{
    BuilderCategory, CorrectionReport, FeatureRecord, FeatureRef, FeatureSet, Provenance,
    Violation, Window,
};
use crate::store::FeatureStore;
use crate::temporal::cutoff::CutoffPolicy;
use crate::temporal::detector::contributor_is_late;

#[derive(Debug, Clone)]
pub struct CorrectionOutcome {
    pub features: FeatureSet,
    pub report: CorrectionReport,
}

pub struct CorrectionEngine {
    store: Arc<dyn FeatureStore>,
    builders: BuilderSet,
    config: Arc<TemporalConfig>,
}

impl CorrectionEngine {
    pub fn new(store: Arc<dyn FeatureStore>, builders: BuilderSet, config: Arc<TemporalConfig>) -> Self {
        Self {
            store,
            builders,
            config,
        }
    }

    pub async fn correct(
        &self,
        entity_id: &str,
        window: Window,
        decision_time: DateTime<Utc>,
        features: FeatureSet,
        violations: &[Violation],
    ) -> CorrectionOutcome {
        let affected: BTreeSet<FeatureRef> = violations
            .iter()
            .map(|v| &v.feature_ref)
            .filter(|r| !r.is_entity_level() && features.contains_key(*r))
            .cloned()
            .collect();

        if affected.is_empty() {
            return CorrectionOutcome {
                features,
                report: CorrectionReport::default(),
            };
        }

        let policy = CutoffPolicy::derive(window, decision_time, &self.config);
        let stricter = policy.tightened(self.config.correction.safety_margin());
        let mut features = features;
        let mut report = CorrectionReport {
            applied: true,
            stricter_cutoff: Some(stricter.cutoff_time),
            ..CorrectionReport::default()
        };

        self.recompute(entity_id, window, &stricter, &affected, &mut features, &mut report)
            .await;

        for feature in &affected {
            if !report.recomputed.contains(feature) && features.remove(feature).is_some() {
                report.stripped.push(feature.clone());
            }
        }

        self.substitute(entity_id, &policy, &stricter, &mut features, &mut report)
            .await;
        self.smooth(entity_id, &stricter, &mut features, &mut report)
            .await;

        info!(
            entity = entity_id,
            window = %window,
            recomputed = report.recomputed.len(),
            stripped = report.stripped.len(),
            substituted = report.substituted.len(),
            smoothed = report.smoothed.len(),
            errors = report.errors.len(),
            "correction applied"
        );

        CorrectionOutcome { features, report }
    }

    /// Step 1. Overwrites only the affected refs, and only with admissible values.
    async fn recompute(
        &self,
        entity_id: &str,
        window: Window,
        stricter: &CutoffPolicy,
        affected: &BTreeSet<FeatureRef>,
        features: &mut FeatureSet,
        report: &mut CorrectionReport,
    ) {
        let mut by_category: BTreeMap<String, (BuilderCategory, Vec<FeatureRef>)> = BTreeMap::new();
        for feature in affected {
            if let Some(category) = BuilderCategory::for_scope(&feature.scope) {
                by_category
                    .entry(category.to_string())
                    .or_insert_with(|| (category, Vec::new()))
                    .1
                    .push(feature.clone());
            }
        }

        let timeout = self.config.orchestrator.builder_timeout();
        for (category, refs) in by_category.into_values() {
            let Some(builder) = self.builders.for_category(category) else {
                report
                    .errors
                    .push(format!("no {} builder available for recomputation", category));
                continue;
            };

            let request = BuildRequest {
                entity_id: entity_id.to_string(),
                window,
                cutoff: stricter.cutoff_time,
                only: Some(refs.clone()),
            };

            let records = match tokio::time::timeout(timeout, builder.build(&request)).await {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    warn!(entity = entity_id, category = %category, error = %e, "recompute failed");
                    report.errors.push(format!("{} recompute failed: {:#}", category, e));
                    continue;
                }
                Err(_) => {
                    warn!(entity = entity_id, category = %category, "recompute timed out");
                    report.errors.push(format!(
                        "{} recompute timed out after {}s",
                        category,
                        timeout.as_secs()
                    ));
                    continue;
                }
            };

            for record in records {
                if !refs.contains(&record.feature) || report.recomputed.contains(&record.feature) {
                    continue;
                }
                if !stricter.admits(&record) {
                    report.errors.push(format!(
                        "recomputed {} still inadmissible (observed {}, source '{}')",
                        record.feature, record.observed_at, record.source
                    ));
                    continue;
                }
                if let Some(reason) = self.late_inputs(entity_id, &record, stricter).await {
                    warn!(entity = entity_id, feature = %record.feature, "{}", reason);
                    report.errors.push(reason);
                    continue;
                }
                report.recomputed.push(record.feature.clone());
                features.insert(
                    record.feature.clone(),
                    record.with_provenance(Provenance::Recomputed),
                );
            }
        }
    }

    /// Re-opens a recomputed aggregate. `Some(reason)` when an input is still late.
    async fn late_inputs(
        &self,
        entity_id: &str,
        record: &FeatureRecord,
        stricter: &CutoffPolicy,
    ) -> Option<String> {
        let n = record.lookback.filter(|n| *n > 0)? as usize;
        match self
            .store
            .contributing_records(entity_id, &record.feature, n)
            .await
        {
            Ok(raw) => {
                let late = raw.iter().filter(|r| contributor_is_late(r, stricter)).count();
                (late > 0).then(|| {
                    format!(
                        "recomputed {} still has {} of {} contributing records after {}",
                        record.feature,
                        late,
                        raw.len(),
                        stricter.cutoff_time
                    )
                })
            }
            Err(e) => Some(format!(
                "contributing records for recomputed {} unreadable: {:#}",
                record.feature, e
            )),
        }
    }

    /// Step 3. Gives every team of the event its load-bearing priors.
    async fn substitute(
        &self,
        entity_id: &str,
        policy: &CutoffPolicy,
        stricter: &CutoffPolicy,
        features: &mut FeatureSet,
        report: &mut CorrectionReport,
    ) {
        let correction = &self.config.correction;
        if correction.priors.is_empty() {
            return;
        }
        if !policy.admits_source(&correction.prior_source) {
            report.errors.push(format!(
                "prior source '{}' not admissible at {}",
                correction.prior_source, policy.window
            ));
            return;
        }

        let event = match self.store.event(entity_id).await {
            Ok(event) => event,
            Err(e) => {
                report
                    .errors
                    .push(format!("substitution skipped, event unreadable: {:#}", e));
                return;
            }
        };

        for team in event.teams() {
            for prior in &correction.priors {
                let feature = FeatureRef::team(team, prior.feature.as_str());
                if features.contains_key(&feature) {
                    continue;
                }
                let record = FeatureRecord::new(
                    feature.clone(),
                    prior.value,
                    stricter.cutoff_time,
                    correction.prior_source.as_str(),
                )
                .with_provenance(Provenance::Substituted);
                features.insert(feature.clone(), record);
                report.substituted.push(feature);
            }
        }
    }

    /// Step 4. `w * corrected + (1 - w) * long_run_average` for volatile features.
    async fn smooth(
        &self,
        entity_id: &str,
        stricter: &CutoffPolicy,
        features: &mut FeatureSet,
        report: &mut CorrectionReport,
    ) {
        let correction = &self.config.correction;
        let weight = correction.smoothing_weight;

        let volatile: Vec<FeatureRef> = report
            .recomputed
            .iter()
            .filter(|r| correction.volatile_features.contains(&r.name))
            .cloned()
            .collect();

        for feature in volatile {
            let average = match self
                .store
                .long_run_average(entity_id, &feature, stricter.cutoff_time)
                .await
            {
                Ok(Some(avg)) => avg,
                Ok(None) => continue,
                Err(e) => {
                    report
                        .errors
                        .push(format!("long-run average for {} unavailable: {:#}", feature, e));
                    continue;
                }
            };
            if let Some(record) = features.get_mut(&feature) {
                record.value = weight * record.value + (1.0 - weight) * average;
                record.provenance = Provenance::Smoothed;
                report.smoothed.push(feature);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{FeatureBuilder, StoredFeatureBuilder};
    use crate::models::{feature_set, EventRecord, RawRecord, Severity, ViolationKind};
    use crate::store::MemoryFeatureStore;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    fn kickoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap()
    }

    fn store_with_event() -> Arc<MemoryFeatureStore> {
        let store = Arc::new(MemoryFeatureStore::new());
        store.insert_event(EventRecord {
            entity_id: "fx-1".into(),
            home_team: "ARS".into(),
            away_team: "CHE".into(),
            event_start: kickoff(),
            updated_at: kickoff() - Duration::days(5),
            source: "historical_results".into(),
        });
        store
    }

    fn future_violation(feature: &FeatureRef, at: DateTime<Utc>) -> Violation {
        Violation {
            feature_ref: feature.clone(),
            kind: ViolationKind::FutureData,
            observed_at: Some(at),
            cutoff_at: kickoff() - Duration::hours(2),
            severity: Severity::Critical,
            description: "late".into(),
        }
    }

    struct FailingBuilder;

    #[async_trait]
    impl FeatureBuilder for FailingBuilder {
        fn category(&self) -> BuilderCategory {
            BuilderCategory::Team
        }

        async fn build(&self, _request: &BuildRequest) -> Result<Vec<FeatureRecord>> {
            bail!("upstream stats API unavailable")
        }
    }

    #[tokio::test]
    async fn test_no_feature_violations_returns_input() {
        let store = store_with_event();
        let engine = CorrectionEngine::new(
            store.clone(),
            StoredFeatureBuilder::all(store.clone()),
            Arc::new(TemporalConfig::default()),
        );
        let features = feature_set(vec![FeatureRecord::new(
            FeatureRef::team("ARS", "win_rate"),
            0.5,
            kickoff() - Duration::days(1),
            "team_stats",
        )]);
        let entity_warning = Violation {
            feature_ref: FeatureRef::entity("bulk_write_cluster"),
            kind: ViolationKind::SuspiciousTiming,
            observed_at: None,
            cutoff_at: kickoff(),
            severity: Severity::Warning,
            description: "cluster".into(),
        };

        let outcome = engine
            .correct("fx-1", Window::T90m, kickoff(), features.clone(), &[entity_warning])
            .await;
        assert!(!outcome.report.applied);
        assert_eq!(outcome.features, features);
    }

    #[tokio::test]
    async fn test_recompute_from_older_version_and_smooth() {
        let store = store_with_event();
        let form = FeatureRef::team("ARS", "form_last5");
        let late_at = kickoff() - Duration::minutes(110);
        store.insert_features(
            "fx-1",
            vec![
                FeatureRecord::new(form.clone(), 1.0, kickoff() - Duration::days(10), "team_stats"),
                FeatureRecord::new(form.clone(), 2.0, kickoff() - Duration::days(3), "team_stats"),
                FeatureRecord::new(form.clone(), 3.0, late_at, "team_stats"),
            ],
        );
        let engine = CorrectionEngine::new(
            store.clone(),
            StoredFeatureBuilder::all(store.clone()),
            Arc::new(TemporalConfig::default()),
        );
        let features = store.features("fx-1").await.unwrap();

        let outcome = engine
            .correct(
                "fx-1",
                Window::T90m,
                kickoff(),
                features,
                &[future_violation(&form, late_at)],
            )
            .await;

        let record = &outcome.features[&form];
        // 0.7 * 2.0 + 0.3 * avg(1.0, 2.0)
        assert!((record.value - 1.85).abs() < 1e-9);
        assert_eq!(record.provenance, Provenance::Smoothed);
        assert!(record.observed_at <= kickoff() - Duration::hours(2));
        assert_eq!(outcome.report.recomputed, vec![form.clone()]);
        assert_eq!(outcome.report.smoothed, vec![form]);
        assert!(outcome.report.stripped.is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_with_late_input_is_stripped_not_recomputed() {
        let store = store_with_event();
        let goals = FeatureRef::team("ARS", "goals_scored_last5");
        let cutoff = kickoff() - Duration::minutes(390);
        store.insert_features(
            "fx-1",
            vec![FeatureRecord::new(goals.clone(), 1.8, kickoff() - Duration::days(3), "team_stats")
                .with_lookback(5)],
        );
        store.insert_contributors(
            "fx-1",
            goals.clone(),
            (0..5)
                .map(|i| {
                    let at = if i == 0 {
                        cutoff + Duration::minutes(20)
                    } else {
                        cutoff - Duration::days(4 * i)
                    };
                    RawRecord {
                        record_id: format!("m{}", i),
                        occurred_at: at,
                        recorded_at: at,
                    }
                })
                .collect(),
        );
        let engine = CorrectionEngine::new(
            store.clone(),
            StoredFeatureBuilder::all(store.clone()),
            Arc::new(TemporalConfig::default()),
        );
        let features = store.features("fx-1").await.unwrap();
        let nested = Violation {
            feature_ref: goals.clone(),
            kind: ViolationKind::FutureData,
            observed_at: Some(cutoff + Duration::minutes(20)),
            cutoff_at: cutoff,
            severity: Severity::Warning,
            description: "1 of 5 contributing records are newer than the cutoff".into(),
        };

        let outcome = engine
            .correct("fx-1", Window::T6h, kickoff(), features, &[nested])
            .await;

        assert!(outcome.report.applied);
        assert!(!outcome.features.contains_key(&goals));
        assert!(outcome.report.recomputed.is_empty());
        assert!(outcome.report.smoothed.is_empty());
        assert_eq!(outcome.report.stripped, vec![goals]);
        assert!(outcome
            .report
            .errors
            .iter()
            .any(|e| e.contains("contributing records")));
    }

    #[tokio::test]
    async fn test_unrecoverable_feature_is_stripped_and_priors_fill_gaps() {
        let store = store_with_event();
        let win_rate = FeatureRef::team("ARS", "win_rate");
        let odd = FeatureRef::team("ARS", "pressing_index");
        let late_at = kickoff() - Duration::minutes(100);
        store.insert_features(
            "fx-1",
            vec![
                FeatureRecord::new(win_rate.clone(), 0.61, late_at, "team_stats"),
                FeatureRecord::new(odd.clone(), 4.2, late_at, "team_stats"),
            ],
        );
        let engine = CorrectionEngine::new(
            store.clone(),
            BuilderSet::new().with_base(Arc::new(FailingBuilder)),
            Arc::new(TemporalConfig::default()),
        );
        let features = store.features("fx-1").await.unwrap();

        let outcome = engine
            .correct(
                "fx-1",
                Window::T90m,
                kickoff(),
                features,
                &[future_violation(&win_rate, late_at), future_violation(&odd, late_at)],
            )
            .await;

        assert!(outcome.report.applied);
        assert!(!outcome.features.contains_key(&odd));
        let prior = &outcome.features[&win_rate];
        assert_eq!(prior.provenance, Provenance::Substituted);
        assert_eq!(prior.value, 0.45);
        assert_eq!(outcome.report.stripped.len(), 2);
        // Four priors for each of the two teams.
        assert_eq!(outcome.report.substituted.len(), 8);
        assert!(!outcome.report.errors.is_empty());

        let cutoff = kickoff() - Duration::hours(2);
        assert!(outcome.features.values().all(|r| r.observed_at <= cutoff));
    }
}
