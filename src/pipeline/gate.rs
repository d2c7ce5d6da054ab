//! Decision Gate
//!
//! The last check before a terminal-window decision is acted on. Reads the latest
//! terminal run (triggering one if none exists), re-validates its features against
//! the terminal policy as of now, and produces a proceed/skip/manual-review verdict
//! with a confidence score.
//!
//! Read-mostly: the only side effect besides a triggered run is an audit append.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::audit::AuditEntry;
use crate::config::GateConfig;
use crate::models::{
    DecisionContext, FeatureRef, FeatureSet, PipelineRun, PipelineStatus, RecommendedAction,
    Severity, ValidationResult, Violation, ViolationKind, Window,
};
use crate::pipeline::orchestrator::PipelineOrchestrator;

pub struct DecisionGate {
    orchestrator: Arc<PipelineOrchestrator>,
}

impl DecisionGate {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn prepare(&self, entity_id: &str) -> DecisionContext {
        let orchestrator = &self.orchestrator;
        let terminal = Window::terminal();
        let now = orchestrator.clock().now();

        let event = match orchestrator.store().event(entity_id).await {
            Ok(event) => event,
            Err(e) => {
                return self.unavailable(entity_id, now, now, format!("event record unreadable: {:#}", e));
            }
        };

        let run = match orchestrator.store().latest_run(entity_id, terminal).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                info!(entity = entity_id, "no terminal run yet, triggering one");
                orchestrator.run(entity_id, terminal, None).await
            }
            Err(e) => {
                return self.unavailable(
                    entity_id,
                    event.event_start,
                    now,
                    format!("terminal run unreadable: {:#}", e),
                );
            }
        };

        let policy = orchestrator.detector().policy(terminal, event.event_start);
        let validation = orchestrator
            .detector()
            .validate_features(entity_id, &run.features, &policy, Some(&event))
            .await;

        let mut violations = validation.violations.clone();
        if run.status == PipelineStatus::TemporalViolation {
            violations.push(timing_violation(
                &policy.cutoff_time,
                run.timing_reason
                    .clone()
                    .unwrap_or_else(|| "terminal run ended in a temporal violation".to_string()),
            ));
        }
        if let Err(reason) = orchestrator
            .scheduler()
            .terminal_lead_check(event.event_start, now)
        {
            violations.push(timing_violation(&policy.cutoff_time, reason));
        }

        let has_critical = violations.iter().any(Violation::is_critical);
        let can_proceed = run.status == PipelineStatus::Completed && !has_critical;
        let warnings = violations.len() - violations.iter().filter(|v| v.is_critical()).count();

        let gate = &orchestrator.config().gate;
        let confidence = if can_proceed {
            confidence(gate, &run.features, warnings, run.was_corrected())
        } else {
            0.0
        };
        let recommended_action = recommend(gate, can_proceed, confidence, warnings);

        let context = DecisionContext {
            entity_id: entity_id.to_string(),
            decision_time: event.event_start,
            prepared_at: now,
            run_id: Some(run.run_id.clone()),
            features: run.features.clone(),
            validation,
            can_proceed,
            violations,
            confidence,
            recommended_action,
        };
        self.record(&context, &run);
        context
    }

    fn unavailable(
        &self,
        entity_id: &str,
        decision_time: DateTime<Utc>,
        now: DateTime<Utc>,
        description: String,
    ) -> DecisionContext {
        let violation = Violation {
            feature_ref: FeatureRef::entity("store"),
            kind: ViolationKind::ReadFailure,
            observed_at: None,
            cutoff_at: decision_time,
            severity: Severity::Critical,
            description,
        };
        let context = DecisionContext {
            entity_id: entity_id.to_string(),
            decision_time,
            prepared_at: now,
            run_id: None,
            features: FeatureSet::new(),
            validation: ValidationResult::read_failure(violation.clone()),
            can_proceed: false,
            violations: vec![violation],
            confidence: 0.0,
            recommended_action: RecommendedAction::Skip,
        };
        warn!(entity = entity_id, "decision skipped: store unavailable");
        self.orchestrator
            .audit()
            .append(&AuditEntry::Decision(Box::new(context.clone())));
        context
    }

    fn record(&self, context: &DecisionContext, run: &PipelineRun) {
        info!(
            entity = %context.entity_id,
            run = %run.run_id,
            run_status = %run.status,
            can_proceed = context.can_proceed,
            confidence = context.confidence,
            action = %context.recommended_action,
            "decision prepared"
        );
        self.orchestrator
            .audit()
            .append(&AuditEntry::Decision(Box::new(context.clone())));
    }
}

fn timing_violation(cutoff: &DateTime<Utc>, description: String) -> Violation {
    Violation {
        feature_ref: FeatureRef::entity("execution_timing"),
        kind: ViolationKind::ExecutionTiming,
        observed_at: None,
        cutoff_at: *cutoff,
        severity: Severity::Critical,
        description,
    }
}

/// Exactly 0, exactly 1, or a non-zero multiple of ten.
fn is_boundary_value(v: f64) -> bool {
    v == 0.0 || v == 1.0 || (v != 0.0 && v % 10.0 == 0.0)
}

/// Confidence in [0, 1] for a decision that is allowed to proceed.
pub fn confidence(gate: &GateConfig, features: &FeatureSet, warnings: usize, corrected: bool) -> f64 {
    let mut score = 1.0 - gate.warning_penalty * warnings as f64;

    if features.len() < gate.min_feature_count {
        score -= gate.insufficient_features_penalty;
    }

    if !features.is_empty() {
        let boundary = features.values().filter(|r| is_boundary_value(r.value)).count();
        if boundary as f64 / features.len() as f64 > gate.boundary_share_threshold {
            score -= gate.boundary_values_penalty;
        }
    }

    if corrected {
        score -= gate.corrected_penalty;
    }

    score.clamp(0.0, 1.0)
}

pub fn recommend(gate: &GateConfig, can_proceed: bool, confidence: f64, warnings: usize) -> RecommendedAction {
    if !can_proceed {
        RecommendedAction::Skip
    } else if confidence < gate.manual_review_confidence || warnings > gate.max_warnings {
        RecommendedAction::ManualReview
    } else {
        RecommendedAction::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::builders::StoredFeatureBuilder;
    use crate::clock::ManualClock;
    use crate::config::TemporalConfig;
    use crate::models::{EventRecord, FeatureRecord};
    use crate::store::MemoryFeatureStore;
    use chrono::{Duration, TimeZone};

    fn kickoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap()
    }

    fn features(values: &[f64]) -> FeatureSet {
        crate::models::feature_set(values.iter().enumerate().map(|(i, v)| {
            FeatureRecord::new(
                FeatureRef::team("ARS", format!("f{}", i)),
                *v,
                kickoff() - Duration::days(1),
                "team_stats",
            )
        }))
    }

    #[test]
    fn test_confidence_penalties() {
        let gate = GateConfig::default();
        let healthy: Vec<f64> = (0..20).map(|i| 0.3 + i as f64 * 0.01).collect();
        assert_eq!(confidence(&gate, &features(&healthy), 0, false), 1.0);
        assert!((confidence(&gate, &features(&healthy), 2, true) - 0.85).abs() < 1e-9);

        let few = features(&[0.4, 0.6]);
        assert!((confidence(&gate, &few, 0, false) - 0.8).abs() < 1e-9);

        let stale: Vec<f64> = (0..20).map(|i| if i < 11 { 0.0 } else { 0.5 }).collect();
        assert!((confidence(&gate, &features(&stale), 0, false) - 0.85).abs() < 1e-9);

        assert_eq!(confidence(&gate, &features(&healthy), 40, false), 0.0);
    }

    #[test]
    fn test_round_numbers_count_as_boundary() {
        assert!(is_boundary_value(1500.0 - 1480.0));
        assert!(is_boundary_value(1.0));
        assert!(!is_boundary_value(1500.5));
        assert!(!is_boundary_value(0.5));
    }

    #[test]
    fn test_recommendation() {
        let gate = GateConfig::default();
        assert_eq!(recommend(&gate, false, 1.0, 0), RecommendedAction::Skip);
        assert_eq!(recommend(&gate, true, 0.69, 0), RecommendedAction::ManualReview);
        assert_eq!(recommend(&gate, true, 0.9, 4), RecommendedAction::ManualReview);
        assert_eq!(recommend(&gate, true, 0.85, 3), RecommendedAction::Proceed);
    }

    fn setup(now: DateTime<Utc>) -> (Arc<MemoryFeatureStore>, Arc<MemoryAuditSink>, DecisionGate) {
        let store = Arc::new(MemoryFeatureStore::new());
        store.insert_event(EventRecord {
            entity_id: "fx-1".into(),
            home_team: "ARS".into(),
            away_team: "CHE".into(),
            event_start: kickoff(),
            updated_at: kickoff() - Duration::days(7),
            source: "historical_results".into(),
        });
        let audit = Arc::new(MemoryAuditSink::new());
        let orchestrator = PipelineOrchestrator::new(
            store.clone(),
            StoredFeatureBuilder::all(store.clone()),
            Arc::new(ManualClock::new(now)),
            audit.clone(),
            Arc::new(TemporalConfig::default()),
        );
        (store, audit, DecisionGate::new(Arc::new(orchestrator)))
    }

    #[tokio::test]
    async fn test_prepare_triggers_run_and_is_idempotent() {
        let (store, audit, gate) = setup(kickoff() - Duration::minutes(90));
        let values: Vec<f64> = (0..16).map(|i| 0.21 + i as f64 * 0.03).collect();
        store.insert_features(
            "fx-1",
            values.iter().enumerate().map(|(i, v)| {
                FeatureRecord::new(
                    FeatureRef::team("ARS", format!("stat_{}", i)),
                    *v,
                    kickoff() - Duration::hours(30) + Duration::minutes(i as i64 * 10),
                    "team_stats",
                )
            }),
        );

        let first = gate.prepare("fx-1").await;
        assert!(first.can_proceed);
        assert_eq!(first.recommended_action, RecommendedAction::Proceed);
        assert_eq!(first.confidence, 1.0);
        assert_eq!(store.runs().len(), 1);

        let second = gate.prepare("fx-1").await;
        assert_eq!(first, second);
        assert_eq!(store.runs().len(), 1);
        assert_eq!(audit.count("decision"), 2);
    }

    #[tokio::test]
    async fn test_unreadable_entity_skips() {
        let (store, _audit, gate) = setup(kickoff() - Duration::minutes(90));
        store.mark_unreadable("fx-1");

        let context = gate.prepare("fx-1").await;
        assert!(!context.can_proceed);
        assert_eq!(context.confidence, 0.0);
        assert_eq!(context.recommended_action, RecommendedAction::Skip);
        assert_eq!(context.violations[0].kind, ViolationKind::ReadFailure);
    }

    #[tokio::test]
    async fn test_late_call_cannot_proceed() {
        let (_store, _audit, gate) = setup(kickoff() - Duration::minutes(40));

        let context = gate.prepare("fx-1").await;
        assert!(!context.can_proceed);
        assert_eq!(context.recommended_action, RecommendedAction::Skip);
        assert!(context
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::ExecutionTiming && v.description.contains("lead-time")));
    }
}
