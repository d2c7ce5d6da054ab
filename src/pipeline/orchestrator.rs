//! Pipeline Orchestrator
//!
//! Drives one (entity, window) run through
//! `Pending -> Running -> {Completed | Failed | TemporalViolation}`:
//! timing gate, preliminary validation, base and adaptive builds, post-build
//! validation with correction, a final clock re-check, then persistence.
//!
//! `run` never returns an error and never panics on collaborator failure. Every
//! outcome is carried on the returned [`PipelineRun`].

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEntry, AuditSink};
use crate::builders::{BuildRequest, BuilderSet};
use crate::clock::Clock;
use crate::config::TemporalConfig;
use crate::models::{
    BuilderOutcome, BuilderStatus, EventRecord, FeatureRecord, FeatureSet, PipelineFailure,
    PipelineRun, PipelineStatus, Window,
};
use crate::pipeline::locks::RunLocks;
use crate::pipeline::scheduler::{NextAction, WindowScheduler};
use crate::store::FeatureStore;
use crate::temporal::{CorrectionEngine, ViolationDetector};

/// A window the sweep looked at and did not run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedWindow {
    pub entity_id: String,
    pub window: Window,
    pub action: NextAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub runs: Vec<PipelineRun>,
    pub skipped: Vec<SkippedWindow>,
    /// Store errors hit while enumerating work.
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn count(&self, status: PipelineStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }
}

pub struct PipelineOrchestrator {
    store: Arc<dyn FeatureStore>,
    builders: BuilderSet,
    detector: ViolationDetector,
    correction: CorrectionEngine,
    scheduler: WindowScheduler,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    config: Arc<TemporalConfig>,
    locks: RunLocks,
    run_slots: Semaphore,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn FeatureStore>,
        builders: BuilderSet,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        config: Arc<TemporalConfig>,
    ) -> Self {
        let detector = ViolationDetector::new(store.clone(), config.clone(), audit.clone());
        let correction = CorrectionEngine::new(store.clone(), builders.clone(), config.clone());
        let scheduler = WindowScheduler::new(config.clone());
        let run_slots = Semaphore::new(config.orchestrator.max_concurrent_runs.max(1));
        Self {
            store,
            builders,
            detector,
            correction,
            scheduler,
            clock,
            audit,
            config,
            locks: RunLocks::new(),
            run_slots,
        }
    }

    pub fn store(&self) -> &Arc<dyn FeatureStore> {
        &self.store
    }

    pub fn detector(&self) -> &ViolationDetector {
        &self.detector
    }

    pub fn scheduler(&self) -> &WindowScheduler {
        &self.scheduler
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub fn config(&self) -> &TemporalConfig {
        &self.config
    }

    /// Run the pipeline for one (entity, window). Serialised per pair.
    pub async fn run(
        &self,
        entity_id: &str,
        window: Window,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> PipelineRun {
        let guard = self.locks.acquire(entity_id, window).await;
        let started = Instant::now();
        let now = self.clock.now();
        let mut run = PipelineRun::new(entity_id, window, scheduled_at.unwrap_or(now), now);

        self.execute(&mut run, scheduled_at).await;

        run.processing_duration_ms = started.elapsed().as_millis() as u64;
        self.persist(&run).await;

        drop(guard);
        self.locks.prune();
        run
    }

    async fn execute(&self, run: &mut PipelineRun, scheduled_at: Option<DateTime<Utc>>) {
        let entity_id = run.entity_id.clone();
        let window = run.window;

        // ===== TIMING GATE =====
        let event = match self.store.event(&entity_id).await {
            Ok(event) => event,
            Err(e) => {
                self.fail(
                    run,
                    PipelineFailure::StoreUnavailable {
                        detail: format!("{:#}", e),
                    },
                );
                return;
            }
        };
        // The band always comes from the event; a caller's schedule is only recorded.
        let derived = self.scheduler.scheduled_time(window, event.event_start);
        run.scheduled_at = scheduled_at.unwrap_or(derived);
        if let Err(reason) = self.scheduler.schedule_check(window, derived, run.scheduled_at) {
            self.temporal_violation(run, reason);
            return;
        }

        if let Err(reason) = self.timing_check(window, &event, derived, run.executed_at) {
            self.temporal_violation(run, reason);
            return;
        }

        self.transition(run, PipelineStatus::Running);
        let policy = self.detector.policy(window, event.event_start);

        // ===== PRELIMINARY VALIDATION =====
        let preliminary = self
            .detector
            .validate(&entity_id, window, event.event_start)
            .await;
        if policy.is_terminal() && preliminary.critical_count() > 0 {
            let reason = format!(
                "preliminary validation found {} critical violation(s) before build",
                preliminary.critical_count()
            );
            run.validation = preliminary;
            self.temporal_violation(run, reason);
            return;
        }

        // ===== BUILD =====
        let request = BuildRequest {
            entity_id: entity_id.clone(),
            window,
            cutoff: policy.cutoff_time,
            only: None,
        };
        let mut features = match self.build_base(&request, run).await {
            Some(features) => features,
            None => return,
        };
        self.build_adaptive(&request, &mut features, run).await;

        // ===== VALIDATE + CORRECT =====
        let mut validation = self
            .detector
            .validate_features(&entity_id, &features, &policy, Some(&event))
            .await;
        if !validation.violations.is_empty() {
            let outcome = self
                .correction
                .correct(
                    &entity_id,
                    window,
                    event.event_start,
                    features,
                    &validation.violations,
                )
                .await;
            features = outcome.features;
            if outcome.report.applied {
                validation = self
                    .detector
                    .validate_features(&entity_id, &features, &policy, Some(&event))
                    .await;
                run.correction = Some(outcome.report);
            }
        }
        run.features = features;
        run.validation = validation;

        if policy.is_terminal() && run.validation.critical_count() > 0 {
            let reason = format!(
                "{} critical violation(s) remain after correction",
                run.validation.critical_count()
            );
            self.temporal_violation(run, reason);
            return;
        }

        // ===== FINALISE =====
        // A run that drifted out of its band while working must not complete.
        let now = self.clock.now();
        if let Err(reason) = self.timing_check(window, &event, derived, now) {
            self.temporal_violation(run, reason);
            return;
        }

        self.transition(run, PipelineStatus::Completed);
        info!(
            entity = %entity_id,
            window = %window,
            features = run.features.len(),
            warnings = run.validation.warning_count(),
            corrected = run.was_corrected(),
            "pipeline run completed"
        );
    }

    /// Terminal lead time first, then the execution band.
    fn timing_check(
        &self,
        window: Window,
        event: &EventRecord,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if window.is_terminal() {
            self.scheduler.terminal_lead_check(event.event_start, now)?;
        }
        self.scheduler.band_check(window, scheduled, now)
    }

    /// Run every base builder in parallel. `None` when all of them failed.
    async fn build_base(&self, request: &BuildRequest, run: &mut PipelineRun) -> Option<FeatureSet> {
        let timeout = self.config.orchestrator.builder_timeout();

        let results = join_all(self.builders.base.iter().map(|builder| async move {
            let name = builder.category().to_string();
            (name, tokio::time::timeout(timeout, builder.build(request)).await)
        }))
        .await;

        let mut features = FeatureSet::new();
        let mut built: Vec<FeatureRecord> = Vec::new();
        let mut errors = Vec::new();

        for (name, result) in results {
            let status = match result {
                Ok(Ok(records)) => {
                    let status = BuilderStatus::Succeeded {
                        records: records.len(),
                    };
                    built.extend(records);
                    status
                }
                Ok(Err(e)) => {
                    warn!(entity = %request.entity_id, builder = %name, error = %e, "builder failed");
                    errors.push(format!("{}: {:#}", name, e));
                    BuilderStatus::Failed {
                        error: format!("{:#}", e),
                    }
                }
                Err(_) => {
                    warn!(entity = %request.entity_id, builder = %name, "builder timed out");
                    errors.push(format!("{}: timed out", name));
                    BuilderStatus::TimedOut {
                        after_ms: timeout.as_millis() as u64,
                    }
                }
            };
            run.builder_outcomes.push(BuilderOutcome {
                builder: name,
                status,
            });
        }

        if !run.builder_outcomes.iter().any(BuilderOutcome::succeeded) {
            if errors.is_empty() {
                errors.push("no base builders configured".to_string());
            }
            self.fail(run, PipelineFailure::AllBuildersFailed { errors });
            return None;
        }

        if let Err(e) = self.store.put_features(&request.entity_id, &built).await {
            self.fail(
                run,
                PipelineFailure::PersistFailed {
                    detail: format!("{:#}", e),
                },
            );
            return None;
        }

        for record in built {
            features.insert(record.feature.clone(), record);
        }
        debug!(entity = %request.entity_id, features = features.len(), "base build complete");
        Some(features)
    }

    /// Adaptive builders run in order on the base set. Failures are recorded only.
    async fn build_adaptive(&self, request: &BuildRequest, features: &mut FeatureSet, run: &mut PipelineRun) {
        let timeout = self.config.orchestrator.builder_timeout();

        for builder in &self.builders.adaptive {
            let name = builder.name().to_string();
            let result = tokio::time::timeout(
                timeout,
                builder.derive(&request.entity_id, request.window, request.cutoff, features),
            )
            .await;

            let status = match result {
                Ok(Ok(records)) => {
                    let count = records.len();
                    if let Err(e) = self.store.put_features(&request.entity_id, &records).await {
                        warn!(entity = %request.entity_id, builder = %name, error = %e, "failed to store adaptive features");
                    }
                    for record in records {
                        if !run.adaptive_feature_names.contains(&record.feature.name) {
                            run.adaptive_feature_names.push(record.feature.name.clone());
                        }
                        features.insert(record.feature.clone(), record);
                    }
                    BuilderStatus::Succeeded { records: count }
                }
                Ok(Err(e)) => {
                    warn!(entity = %request.entity_id, builder = %name, error = %e, "adaptive builder failed");
                    BuilderStatus::Failed {
                        error: format!("{:#}", e),
                    }
                }
                Err(_) => {
                    warn!(entity = %request.entity_id, builder = %name, "adaptive builder timed out");
                    BuilderStatus::TimedOut {
                        after_ms: timeout.as_millis() as u64,
                    }
                }
            };
            run.builder_outcomes.push(BuilderOutcome {
                builder: name,
                status,
            });
        }
    }

    fn transition(&self, run: &mut PipelineRun, next: PipelineStatus) {
        if let Err(e) = run.transition(next) {
            error!(entity = %run.entity_id, window = %run.window, error = %e, "illegal run transition");
        }
    }

    fn fail(&self, run: &mut PipelineRun, failure: PipelineFailure) {
        error!(
            entity = %run.entity_id,
            window = %run.window,
            failure = %failure,
            "pipeline run failed"
        );
        run.failure = Some(failure);
        self.transition(run, PipelineStatus::Failed);
    }

    fn temporal_violation(&self, run: &mut PipelineRun, reason: String) {
        warn!(
            entity = %run.entity_id,
            window = %run.window,
            reason = %reason,
            "pipeline run refused: temporal violation"
        );
        self.audit.append(&AuditEntry::TimingViolation {
            entity_id: run.entity_id.clone(),
            window: run.window,
            at: self.clock.now(),
            reason: reason.clone(),
        });
        run.timing_reason = Some(reason);
        self.transition(run, PipelineStatus::TemporalViolation);
    }

    async fn persist(&self, run: &PipelineRun) {
        if let Err(e) = self.store.save_run(run).await {
            error!(entity = %run.entity_id, window = %run.window, error = %e, "failed to save pipeline run");
        }
        self.audit.append(&AuditEntry::Run(Box::new(run.clone())));
    }

    /// Run every (event, window) pair that is due now, bounded by `max_concurrent_runs`.
    pub async fn run_scheduled_windows(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let events = match self
            .store
            .upcoming_events(now, now + self.config.windows.horizon())
            .await
        {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "failed to list upcoming events");
                report.errors.push(format!("upcoming events: {:#}", e));
                return report;
            }
        };

        let mut due = Vec::new();
        for event in &events {
            for window in Window::ALL {
                let last_status = match self.store.latest_run(&event.entity_id, window).await {
                    Ok(run) => run.map(|r| r.status),
                    Err(e) => {
                        report
                            .errors
                            .push(format!("latest run for {}/{}: {:#}", event.entity_id, window, e));
                        continue;
                    }
                };
                match self
                    .scheduler
                    .next_action(window, event.event_start, now, last_status)
                {
                    NextAction::ShouldRun => due.push((event.entity_id.clone(), window)),
                    action => report.skipped.push(SkippedWindow {
                        entity_id: event.entity_id.clone(),
                        window,
                        action,
                    }),
                }
            }
        }

        let runs = join_all(due.iter().map(|(entity_id, window)| async move {
            let _permit = match self.run_slots.acquire().await {
                Ok(permit) => permit,
                Err(_) => return None,
            };
            Some(self.run(entity_id, *window, None).await)
        }))
        .await;
        report.runs = runs.into_iter().flatten().collect();

        info!(
            events = events.len(),
            runs = report.runs.len(),
            completed = report.count(PipelineStatus::Completed),
            skipped = report.skipped.len(),
            "scheduled sweep finished"
        );
        report
    }
}
