//! Shared data model for the temporal-correctness engine.
//!
//! Every feature value carries the `observed_at`/`source` pair the detector needs,
//! and every feature is addressed through a typed [`FeatureScope`] instead of a
//! free-form string bag.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// WINDOWS
// =============================================================================

/// Countdown horizon before an event start at which a pipeline run is scheduled.
///
/// Ordered from farthest to nearest; later windows carry stricter tolerances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    T24h,
    T6h,
    T3h,
    /// Terminal window. Gates the montante decision.
    T90m,
}

impl Window {
    pub const ALL: [Window; 4] = [Window::T24h, Window::T6h, Window::T3h, Window::T90m];

    #[inline]
    pub fn is_terminal(self) -> bool {
        self == Window::terminal()
    }

    #[inline]
    pub fn terminal() -> Window {
        Window::T90m
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Window::T24h => "t24h",
            Window::T6h => "t6h",
            Window::T3h => "t3h",
            Window::T90m => "t90m",
        }
    }

    pub fn parse(s: &str) -> Option<Window> {
        match s.trim().to_ascii_lowercase().as_str() {
            "t24h" | "24h" => Some(Window::T24h),
            "t6h" | "6h" => Some(Window::T6h),
            "t3h" | "3h" => Some(Window::T3h),
            "t90m" | "90m" | "terminal" => Some(Window::T90m),
            _ => None,
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// FEATURES
// =============================================================================

/// What a feature describes. Detectors branch on this tag, never on field names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum FeatureScope {
    /// Aggregate team-level feature.
    Team { team_id: String },
    /// Per-player feature.
    Player { player_id: String },
    /// Field of the primary match record.
    Match,
    /// Third-party quoted price snapshot.
    Odds { bookmaker: String },
    /// Entity as a whole. Only used by aggregate violations.
    Entity,
}

impl FeatureScope {
    pub fn kind(&self) -> &'static str {
        match self {
            FeatureScope::Team { .. } => "team",
            FeatureScope::Player { .. } => "player",
            FeatureScope::Match => "match",
            FeatureScope::Odds { .. } => "odds",
            FeatureScope::Entity => "entity",
        }
    }

    /// Subject identifier within the scope (team id, player id, bookmaker).
    pub fn subject(&self) -> &str {
        match self {
            FeatureScope::Team { team_id } => team_id,
            FeatureScope::Player { player_id } => player_id,
            FeatureScope::Odds { bookmaker } => bookmaker,
            FeatureScope::Match | FeatureScope::Entity => "",
        }
    }

    pub fn from_parts(kind: &str, subject: &str) -> Option<FeatureScope> {
        match kind {
            "team" => Some(FeatureScope::Team {
                team_id: subject.to_string(),
            }),
            "player" => Some(FeatureScope::Player {
                player_id: subject.to_string(),
            }),
            "match" => Some(FeatureScope::Match),
            "odds" => Some(FeatureScope::Odds {
                bookmaker: subject.to_string(),
            }),
            "entity" => Some(FeatureScope::Entity),
            _ => None,
        }
    }
}

/// Address of a single feature value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureRef {
    pub scope: FeatureScope,
    pub name: String,
}

impl FeatureRef {
    pub fn team(team_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: FeatureScope::Team {
                team_id: team_id.into(),
            },
            name: name.into(),
        }
    }

    pub fn player(player_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: FeatureScope::Player {
                player_id: player_id.into(),
            },
            name: name.into(),
        }
    }

    pub fn match_field(name: impl Into<String>) -> Self {
        Self {
            scope: FeatureScope::Match,
            name: name.into(),
        }
    }

    pub fn odds(bookmaker: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: FeatureScope::Odds {
                bookmaker: bookmaker.into(),
            },
            name: name.into(),
        }
    }

    pub fn entity(name: impl Into<String>) -> Self {
        Self {
            scope: FeatureScope::Entity,
            name: name.into(),
        }
    }

    #[inline]
    pub fn is_entity_level(&self) -> bool {
        matches!(self.scope, FeatureScope::Entity)
    }
}

impl fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            FeatureScope::Match | FeatureScope::Entity => {
                write!(f, "{}/{}", self.scope.kind(), self.name)
            }
            scope => write!(f, "{}:{}/{}", scope.kind(), scope.subject(), self.name),
        }
    }
}

/// How a value in a feature set came to be there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Produced by a builder and untouched since.
    #[default]
    Original,
    /// Rebuilt under a tightened cutoff.
    Recomputed,
    /// Population prior inserted to fill a gap.
    Substituted,
    /// Recomputed and then blended toward its long-run average.
    Smoothed,
}

impl Provenance {
    pub fn is_corrected(self) -> bool {
        self != Provenance::Original
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Original => "original",
            Provenance::Recomputed => "recomputed",
            Provenance::Substituted => "substituted",
            Provenance::Smoothed => "smoothed",
        }
    }

    pub fn parse(s: &str) -> Provenance {
        match s {
            "recomputed" => Provenance::Recomputed,
            "substituted" => Provenance::Substituted,
            "smoothed" => Provenance::Smoothed,
            _ => Provenance::Original,
        }
    }
}

/// A single feature value with its mandatory temporal tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub feature: FeatureRef,
    pub value: f64,
    /// Creation/update timestamp of the value.
    pub observed_at: DateTime<Utc>,
    /// Data source the value was derived from.
    pub source: String,
    /// `Some(n)` for "last N events" aggregates whose raw inputs must also be checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback: Option<u32>,
    #[serde(default)]
    pub provenance: Provenance,
}

impl FeatureRecord {
    pub fn new(
        feature: FeatureRef,
        value: f64,
        observed_at: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            feature,
            value,
            observed_at,
            source: source.into(),
            lookback: None,
            provenance: Provenance::Original,
        }
    }

    pub fn with_lookback(mut self, n: u32) -> Self {
        self.lookback = Some(n);
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

/// Feature values keyed by address. Ordered so snapshots serialize deterministically.
pub type FeatureSet = BTreeMap<FeatureRef, FeatureRecord>;

/// Collect records into a [`FeatureSet`]; later records win on duplicate refs.
pub fn feature_set<I: IntoIterator<Item = FeatureRecord>>(records: I) -> FeatureSet {
    records
        .into_iter()
        .map(|r| (r.feature.clone(), r))
        .collect()
}

/// Serializes a [`FeatureSet`] as a list of records; JSON map keys must be strings.
pub mod feature_list {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{feature_set, FeatureRecord, FeatureSet};

    pub fn serialize<S: Serializer>(set: &FeatureSet, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(set.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FeatureSet, D::Error> {
        Vec::<FeatureRecord>::deserialize(deserializer).map(feature_set)
    }
}

/// Raw record contributing to a "last N" aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub record_id: String,
    /// When the underlying event happened.
    pub occurred_at: DateTime<Utc>,
    /// When the record was written to the store.
    pub recorded_at: DateTime<Utc>,
}

/// Primary record of an entity (one fixture).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub entity_id: String,
    pub home_team: String,
    pub away_team: String,
    pub event_start: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source: String,
}

impl EventRecord {
    pub fn teams(&self) -> [&str; 2] {
        [&self.home_team, &self.away_team]
    }
}

// =============================================================================
// VIOLATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Value (or one of its contributing records) is newer than the cutoff.
    FutureData,
    /// Source or field is not admissible at this window.
    RestrictedSource,
    /// Aggregate pattern that suggests leakage despite valid timestamps.
    SuspiciousTiming,
    /// Entity or store could not be read.
    ReadFailure,
    /// Run executed outside its execution band or lead-time bound.
    ExecutionTiming,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationKind::FutureData => "future_data",
            ViolationKind::RestrictedSource => "restricted_source",
            ViolationKind::SuspiciousTiming => "suspicious_timing",
            ViolationKind::ReadFailure => "read_failure",
            ViolationKind::ExecutionTiming => "execution_timing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub feature_ref: FeatureRef,
    pub kind: ViolationKind,
    pub observed_at: Option<DateTime<Utc>>,
    pub cutoff_at: DateTime<Utc>,
    pub severity: Severity,
    pub description: String,
}

impl Violation {
    #[inline]
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub violations: Vec<Violation>,
    pub total_feature_count: usize,
    pub valid_feature_count: usize,
}

impl ValidationResult {
    /// Build a result, deriving `is_valid` and `valid_feature_count` from the violations.
    ///
    /// A feature counts as valid when no feature-level violation names it.
    pub fn from_violations(violations: Vec<Violation>, features: &FeatureSet) -> Self {
        let total_feature_count = features.len();
        let tainted = features
            .keys()
            .filter(|r| violations.iter().any(|v| &v.feature_ref == *r))
            .count();
        Self {
            is_valid: !violations.iter().any(Violation::is_critical),
            violations,
            total_feature_count,
            valid_feature_count: total_feature_count - tainted,
        }
    }

    /// Total validation failure (nothing could be read).
    pub fn read_failure(violation: Violation) -> Self {
        Self {
            is_valid: !violation.is_critical(),
            violations: vec![violation],
            total_feature_count: 0,
            valid_feature_count: 0,
        }
    }

    pub fn critical_count(&self) -> usize {
        self.violations.iter().filter(|v| v.is_critical()).count()
    }

    pub fn warning_count(&self) -> usize {
        self.violations.len() - self.critical_count()
    }

    /// Feature refs named by feature-level violations (entity-level ones excluded).
    pub fn affected_features(&self) -> Vec<FeatureRef> {
        let mut refs: Vec<FeatureRef> = self
            .violations
            .iter()
            .filter(|v| !v.feature_ref.is_entity_level())
            .map(|v| v.feature_ref.clone())
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }
}

// =============================================================================
// PIPELINE RUNS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TemporalViolation,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::TemporalViolation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::TemporalViolation => "temporal_violation",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempted move out of a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: PipelineStatus,
    pub to: PipelineStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pipeline transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Base builder category. Categories are independent and may run in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderCategory {
    Team,
    Player,
    Context,
}

impl BuilderCategory {
    pub const ALL: [BuilderCategory; 3] = [
        BuilderCategory::Team,
        BuilderCategory::Player,
        BuilderCategory::Context,
    ];

    /// Category responsible for producing features of the given scope.
    pub fn for_scope(scope: &FeatureScope) -> Option<BuilderCategory> {
        match scope {
            FeatureScope::Team { .. } => Some(BuilderCategory::Team),
            FeatureScope::Player { .. } => Some(BuilderCategory::Player),
            FeatureScope::Match | FeatureScope::Odds { .. } => Some(BuilderCategory::Context),
            FeatureScope::Entity => None,
        }
    }

    pub fn covers(self, scope: &FeatureScope) -> bool {
        BuilderCategory::for_scope(scope) == Some(self)
    }
}

impl fmt::Display for BuilderCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuilderCategory::Team => "team",
            BuilderCategory::Player => "player",
            BuilderCategory::Context => "context",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuilderStatus {
    Succeeded { records: usize },
    Failed { error: String },
    TimedOut { after_ms: u64 },
}

/// Outcome of one builder invocation inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderOutcome {
    /// Builder name (category name for base builders).
    pub builder: String,
    pub status: BuilderStatus,
}

impl BuilderOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, BuilderStatus::Succeeded { .. })
    }
}

/// What the correction engine did to a feature set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionReport {
    /// False when there was nothing the engine could act on.
    pub applied: bool,
    pub stricter_cutoff: Option<DateTime<Utc>>,
    pub recomputed: Vec<FeatureRef>,
    pub stripped: Vec<FeatureRef>,
    pub substituted: Vec<FeatureRef>,
    pub smoothed: Vec<FeatureRef>,
    /// Step failures, recorded instead of raised.
    pub errors: Vec<String>,
}

/// Typed failure descriptor carried on a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum PipelineFailure {
    /// Event record or store could not be read.
    StoreUnavailable { detail: String },
    /// Every base builder failed or timed out.
    AllBuildersFailed { errors: Vec<String> },
    /// Built features could not be written back.
    PersistFailed { detail: String },
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreUnavailable { detail } => write!(f, "Feature store unavailable: {}", detail),
            Self::AllBuildersFailed { errors } => {
                write!(f, "All feature builders failed: {}", errors.join("; "))
            }
            Self::PersistFailed { detail } => write!(f, "Failed to persist features: {}", detail),
        }
    }
}

impl std::error::Error for PipelineFailure {}

/// One invocation of the pipeline for an (entity, window).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub entity_id: String,
    pub window: Window,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    pub status: PipelineStatus,
    #[serde(with = "feature_list")]
    pub features: FeatureSet,
    pub adaptive_feature_names: Vec<String>,
    pub validation: ValidationResult,
    pub processing_duration_ms: u64,
    #[serde(default)]
    pub builder_outcomes: Vec<BuilderOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<CorrectionReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PipelineFailure>,
    /// Why the run ended in `TemporalViolation`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing_reason: Option<String>,
}

impl PipelineRun {
    pub fn new(
        entity_id: impl Into<String>,
        window: Window,
        scheduled_at: DateTime<Utc>,
        executed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            window,
            scheduled_at,
            executed_at,
            status: PipelineStatus::Pending,
            features: FeatureSet::new(),
            adaptive_feature_names: Vec::new(),
            validation: ValidationResult {
                is_valid: true,
                violations: Vec::new(),
                total_feature_count: 0,
                valid_feature_count: 0,
            },
            processing_duration_ms: 0,
            builder_outcomes: Vec::new(),
            correction: None,
            failure: None,
            timing_reason: None,
        }
    }

    /// Move to `next`. Terminal statuses never change again.
    pub fn transition(&mut self, next: PipelineStatus) -> Result<(), InvalidTransition> {
        let allowed = match (self.status, next) {
            (PipelineStatus::Pending, PipelineStatus::Running) => true,
            (PipelineStatus::Pending, PipelineStatus::TemporalViolation) => true,
            (PipelineStatus::Pending, PipelineStatus::Failed) => true,
            (PipelineStatus::Running, s) => s.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn was_corrected(&self) -> bool {
        self.correction.as_ref().is_some_and(|c| c.applied)
    }
}

// =============================================================================
// DECISIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Proceed,
    /// No valid prediction available. Never defaulted to an unconditioned prediction.
    Skip,
    ManualReview,
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecommendedAction::Proceed => "proceed",
            RecommendedAction::Skip => "skip",
            RecommendedAction::ManualReview => "manual_review",
        };
        f.write_str(s)
    }
}

/// Read-only verdict for the terminal window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub entity_id: String,
    pub decision_time: DateTime<Utc>,
    pub prepared_at: DateTime<Utc>,
    pub run_id: Option<String>,
    #[serde(with = "feature_list")]
    pub features: FeatureSet,
    pub validation: ValidationResult,
    pub can_proceed: bool,
    pub violations: Vec<Violation>,
    pub confidence: f64,
    pub recommended_action: RecommendedAction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    #[test]
    fn test_window_order_and_terminal() {
        assert!(Window::T24h < Window::T6h);
        assert!(Window::T3h < Window::T90m);
        assert!(Window::T90m.is_terminal());
        assert!(!Window::T3h.is_terminal());
        assert_eq!(Window::parse("terminal"), Some(Window::T90m));
        assert_eq!(Window::parse("T6H"), Some(Window::T6h));
        assert_eq!(Window::parse("t2h"), None);
    }

    #[test]
    fn test_feature_ref_display() {
        assert_eq!(FeatureRef::team("ARS", "win_rate").to_string(), "team:ARS/win_rate");
        assert_eq!(FeatureRef::match_field("referee_id").to_string(), "match/referee_id");
    }

    #[test]
    fn test_validation_counts() {
        let features = feature_set(vec![
            FeatureRecord::new(FeatureRef::team("A", "x"), 1.0, ts(10, 0), "team_stats"),
            FeatureRecord::new(FeatureRef::team("A", "y"), 2.0, ts(10, 0), "team_stats"),
        ]);
        let violation = Violation {
            feature_ref: FeatureRef::team("A", "x"),
            kind: ViolationKind::FutureData,
            observed_at: Some(ts(10, 0)),
            cutoff_at: ts(9, 0),
            severity: Severity::Warning,
            description: "late".into(),
        };
        let result = ValidationResult::from_violations(vec![violation], &features);
        assert!(result.is_valid);
        assert_eq!(result.total_feature_count, 2);
        assert_eq!(result.valid_feature_count, 1);
        assert!(result.valid_feature_count <= result.total_feature_count);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut run = PipelineRun::new("fx-1", Window::T6h, ts(12, 0), ts(12, 0));
        run.transition(PipelineStatus::Running).unwrap();
        run.transition(PipelineStatus::Completed).unwrap();
        let err = run.transition(PipelineStatus::Failed).unwrap_err();
        assert_eq!(err.from, PipelineStatus::Completed);
        assert_eq!(run.status, PipelineStatus::Completed);
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let mut run = PipelineRun::new("fx-1", Window::T6h, ts(12, 0), ts(12, 0));
        assert!(run.transition(PipelineStatus::Completed).is_err());
        assert!(run.transition(PipelineStatus::TemporalViolation).is_ok());
    }
}
