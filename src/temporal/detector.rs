//! Violation Detector
//!
//! Checks every feature attached to an entity against a [`CutoffPolicy`]:
//! 1. `observed_at > cutoff` is future data
//! 2. a source outside the allowed set, or a restricted field, is restricted data
//! 3. "last N" aggregates are re-opened and every contributing raw record is
//!    checked too; an aggregate can pass (1) and still be contaminated
//! 4. aggregate heuristics from [`SuspiciousPatternDetector`] are merged in
//!
//! Validation is total: read failures become a Critical violation, never an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditSink};
use crate::config::TemporalConfig;
use crate::models::{
    EventRecord, FeatureRecord, FeatureRef, FeatureSet, RawRecord, Severity, ValidationResult,
    Violation, ViolationKind, Window,
};
use crate::store::FeatureStore;
use crate::temporal::cutoff::CutoffPolicy;
use crate::temporal::suspicious::SuspiciousPatternDetector;

pub struct ViolationDetector {
    store: Arc<dyn FeatureStore>,
    config: Arc<TemporalConfig>,
    patterns: SuspiciousPatternDetector,
    audit: Arc<dyn AuditSink>,
}

impl ViolationDetector {
    pub fn new(
        store: Arc<dyn FeatureStore>,
        config: Arc<TemporalConfig>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let patterns = SuspiciousPatternDetector::new(config.suspicious.clone());
        Self {
            store,
            config,
            patterns,
            audit,
        }
    }

    pub fn policy(&self, window: Window, decision_time: DateTime<Utc>) -> CutoffPolicy {
        CutoffPolicy::derive(window, decision_time, &self.config)
    }

    /// Validate the entity's stored features for `window`.
    pub async fn validate(
        &self,
        entity_id: &str,
        window: Window,
        decision_time: DateTime<Utc>,
    ) -> ValidationResult {
        let policy = self.policy(window, decision_time);

        let event = match self.store.event(entity_id).await {
            Ok(event) => event,
            Err(e) => return self.read_failure(entity_id, &policy, "event record", &e),
        };
        let features = match self.store.features(entity_id).await {
            Ok(features) => features,
            Err(e) => return self.read_failure(entity_id, &policy, "features", &e),
        };

        self.validate_features(entity_id, &features, &policy, Some(&event))
            .await
    }

    /// Validate an in-memory feature set (e.g. a corrected run) against `policy`.
    pub async fn validate_features(
        &self,
        entity_id: &str,
        features: &FeatureSet,
        policy: &CutoffPolicy,
        event: Option<&EventRecord>,
    ) -> ValidationResult {
        let mut violations = Vec::new();

        if let Some(event) = event {
            if !policy.admits_source(&event.source) {
                violations.push(Violation {
                    feature_ref: FeatureRef::match_field("event_record"),
                    kind: ViolationKind::RestrictedSource,
                    observed_at: Some(event.updated_at),
                    cutoff_at: policy.cutoff_time,
                    severity: leakage_severity(policy),
                    description: format!(
                        "event record sourced from '{}', not admissible at {}",
                        event.source, policy.window
                    ),
                });
            }
        }

        for record in features.values() {
            if record.feature.is_entity_level() {
                continue;
            }
            let before = violations.len();
            check_record(record, policy, &mut violations);
            if violations.len() == before {
                if let Some(v) = self.check_contributors(entity_id, record, policy).await {
                    violations.push(v);
                }
            }
        }

        violations.extend(self.patterns.scan(features, policy));

        let result = ValidationResult::from_violations(violations, features);
        self.report(entity_id, policy, &result);
        result
    }

    /// Re-open a "last N" aggregate and check each raw input.
    async fn check_contributors(
        &self,
        entity_id: &str,
        record: &FeatureRecord,
        policy: &CutoffPolicy,
    ) -> Option<Violation> {
        let n = record.lookback.filter(|n| *n > 0)? as usize;

        let raw = match self
            .store
            .contributing_records(entity_id, &record.feature, n)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                return Some(Violation {
                    feature_ref: record.feature.clone(),
                    kind: ViolationKind::ReadFailure,
                    observed_at: Some(record.observed_at),
                    cutoff_at: policy.cutoff_time,
                    severity: Severity::Critical,
                    description: format!(
                        "could not read the last {} contributing records: {:#}",
                        n, e
                    ),
                });
            }
        };

        let late: Vec<_> = raw.iter().filter(|r| contributor_is_late(r, policy)).collect();
        let latest = late.iter().map(|r| r.occurred_at.max(r.recorded_at)).max()?;

        Some(Violation {
            feature_ref: record.feature.clone(),
            kind: ViolationKind::FutureData,
            observed_at: Some(latest),
            cutoff_at: policy.cutoff_time,
            severity: leakage_severity(policy),
            description: format!(
                "{} of {} contributing records to {} are newer than the cutoff (first: {})",
                late.len(),
                raw.len(),
                record.feature,
                late[0].record_id
            ),
        })
    }

    fn read_failure(
        &self,
        entity_id: &str,
        policy: &CutoffPolicy,
        what: &str,
        error: &anyhow::Error,
    ) -> ValidationResult {
        let result = ValidationResult::read_failure(Violation {
            feature_ref: FeatureRef::entity("store"),
            kind: ViolationKind::ReadFailure,
            observed_at: None,
            cutoff_at: policy.cutoff_time,
            severity: Severity::Critical,
            description: format!("failed to read {} for {}: {:#}", what, entity_id, error),
        });
        self.report(entity_id, policy, &result);
        result
    }

    fn report(&self, entity_id: &str, policy: &CutoffPolicy, result: &ValidationResult) {
        if result.is_valid {
            info!(
                entity = entity_id,
                window = %policy.window,
                features = result.total_feature_count,
                warnings = result.warning_count(),
                "temporal validation passed"
            );
        } else {
            warn!(
                entity = entity_id,
                window = %policy.window,
                features = result.total_feature_count,
                critical = result.critical_count(),
                warnings = result.warning_count(),
                "temporal validation failed"
            );
        }
        self.audit.append(&AuditEntry::Validation {
            entity_id: entity_id.to_string(),
            window: policy.window,
            cutoff: policy.cutoff_time,
            result: result.clone(),
        });
    }
}

/// Leakage is fatal at the terminal window and advisory before it.
#[inline]
pub fn leakage_severity(policy: &CutoffPolicy) -> Severity {
    if policy.is_terminal() {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

/// A raw input is late if it happened or was recorded after the cutoff.
#[inline]
pub fn contributor_is_late(raw: &RawRecord, policy: &CutoffPolicy) -> bool {
    !policy.admits_time(raw.occurred_at) || !policy.admits_time(raw.recorded_at)
}

/// Timestamp and source checks for one record. Pure.
pub fn check_record(record: &FeatureRecord, policy: &CutoffPolicy, out: &mut Vec<Violation>) {
    if !policy.admits_time(record.observed_at) {
        out.push(Violation {
            feature_ref: record.feature.clone(),
            kind: ViolationKind::FutureData,
            observed_at: Some(record.observed_at),
            cutoff_at: policy.cutoff_time,
            severity: leakage_severity(policy),
            description: format!(
                "{} observed at {} after {} cutoff {} (+{}s)",
                record.feature,
                record.observed_at,
                policy.window,
                policy.cutoff_time,
                (record.observed_at - policy.cutoff_time).num_seconds()
            ),
        });
    }

    if !policy.admits_source(&record.source) {
        out.push(Violation {
            feature_ref: record.feature.clone(),
            kind: ViolationKind::RestrictedSource,
            observed_at: Some(record.observed_at),
            cutoff_at: policy.cutoff_time,
            severity: leakage_severity(policy),
            description: format!(
                "{} sourced from '{}', not allowed at {}",
                record.feature, record.source, policy.window
            ),
        });
    } else if policy.restricts_field(&record.feature.name) {
        out.push(Violation {
            feature_ref: record.feature.clone(),
            kind: ViolationKind::RestrictedSource,
            observed_at: Some(record.observed_at),
            cutoff_at: policy.cutoff_time,
            severity: leakage_severity(policy),
            description: format!(
                "field '{}' is restricted at {}",
                record.feature.name, policy.window
            ),
        });
    }
}
