//! Suspicious Pattern Detector
//!
//! Aggregate heuristics that catch leakage correct-looking timestamps would hide,
//! e.g. a backfill that stamps records with a fabricated historical time.
//! Everything emitted here is `Warning` severity and advisory.

use chrono::Duration;
use tracing::debug;

use crate::config::SuspiciousConfig;
use crate::models::{
    FeatureRef, FeatureScope, FeatureSet, Provenance, Severity, Violation, ViolationKind,
};
use crate::temporal::cutoff::CutoffPolicy;

pub const BULK_WRITE_CLUSTER: &str = "bulk_write_cluster";
pub const OVER_PRECISE_ESTIMATES: &str = "over_precise_estimates";

pub struct SuspiciousPatternDetector {
    config: SuspiciousConfig,
}

impl SuspiciousPatternDetector {
    pub fn new(config: SuspiciousConfig) -> Self {
        Self { config }
    }

    pub fn scan(&self, features: &FeatureSet, policy: &CutoffPolicy) -> Vec<Violation> {
        let mut violations = Vec::new();
        if let Some(v) = self.bulk_write_cluster(features, policy) {
            violations.push(v);
        }
        violations.extend(self.over_precise_estimates(features, policy));
        violations
    }

    /// More than `cluster_threshold` records written within ±band of the cutoff.
    fn bulk_write_cluster(&self, features: &FeatureSet, policy: &CutoffPolicy) -> Option<Violation> {
        let band = Duration::minutes(self.config.cluster_band_minutes);
        let lo = policy.cutoff_time - band;
        let hi = policy.cutoff_time + band;

        let clustered: Vec<_> = features
            .values()
            .filter(|r| r.provenance != Provenance::Substituted)
            .filter(|r| r.observed_at >= lo && r.observed_at <= hi)
            .map(|r| r.observed_at)
            .collect();

        if clustered.len() <= self.config.cluster_threshold {
            return None;
        }

        let latest = clustered.iter().max().copied();
        debug!(
            window = %policy.window,
            clustered = clustered.len(),
            "bulk write cluster around cutoff"
        );
        Some(Violation {
            feature_ref: FeatureRef::entity(BULK_WRITE_CLUSTER),
            kind: ViolationKind::SuspiciousTiming,
            observed_at: latest,
            cutoff_at: policy.cutoff_time,
            severity: Severity::Warning,
            description: format!(
                "bulk-write clustering: {} feature records written within ±{}m of the cutoff (threshold {})",
                clustered.len(),
                self.config.cluster_band_minutes,
                self.config.cluster_threshold
            ),
        })
    }

    /// Probability-like player features pinned to exactly 0 or 1 for too much of
    /// the population.
    fn over_precise_estimates(&self, features: &FeatureSet, policy: &CutoffPolicy) -> Vec<Violation> {
        let mut violations = Vec::new();
        for name in &self.config.probability_features {
            let population: Vec<_> = features
                .values()
                .filter(|r| matches!(r.feature.scope, FeatureScope::Player { .. }))
                .filter(|r| &r.feature.name == name)
                .filter(|r| r.provenance != Provenance::Substituted)
                .collect();

            if population.len() < self.config.min_population.max(1) {
                continue;
            }

            let certain = population
                .iter()
                .filter(|r| r.value == 0.0 || r.value == 1.0)
                .count();
            let share = certain as f64 / population.len() as f64;
            if share <= self.config.certainty_share {
                continue;
            }

            violations.push(Violation {
                feature_ref: FeatureRef::entity(format!("{}:{}", OVER_PRECISE_ESTIMATES, name)),
                kind: ViolationKind::SuspiciousTiming,
                observed_at: population.iter().map(|r| r.observed_at).max(),
                cutoff_at: policy.cutoff_time,
                severity: Severity::Warning,
                description: format!(
                    "over-precise point estimates: {:.0}% of {} '{}' values are exactly 0 or 1 at {}",
                    share * 100.0,
                    population.len(),
                    name,
                    policy.window
                ),
            });
        }
        violations
    }
}
