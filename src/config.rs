//! Temporal Engine Configuration
//!
//! Every tolerance, offset and threshold the engine uses lives here. Defaults carry
//! the observed production policy; a TOML file or environment variables override it.
//!
//! Cutoffs are measured back from event start. The terminal window runs 90m before
//! kickoff with a 120m cutoff, so its cutoff sits 30m ahead of nominal execution
//! rather than at `decision_time - 1h`. Features stamped exactly on that cutoff are
//! admitted but cluster at it, so they draw a bulk-write warning from the pattern
//! checks.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

use crate::models::Window;

const BASE_SOURCES: &[&str] = &[
    "historical_results",
    "team_stats",
    "player_stats",
    "elo",
    "opening_odds",
    "population_prior",
];

const ALWAYS_RESTRICTED: &[&str] = &[
    "confirmed_lineup",
    "official_starting_xi",
    "live_score",
    "in_play_odds",
];

/// Main configuration for the temporal engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalConfig {
    /// Per-window cutoff and scheduling policy
    pub windows: WindowTable,

    /// Lead-time bound for the terminal window
    pub terminal_lead: LeadTimeBounds,

    /// Advisory pattern heuristics
    pub suspicious: SuspiciousConfig,

    /// Correction strategy
    pub correction: CorrectionConfig,

    /// Decision gate scoring
    pub gate: GateConfig,

    /// Orchestrator runtime settings
    pub orchestrator: OrchestratorConfig,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            windows: WindowTable::default(),
            terminal_lead: LeadTimeBounds::default(),
            suspicious: SuspiciousConfig::default(),
            correction: CorrectionConfig::default(),
            gate: GateConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl TemporalConfig {
    /// Load from a TOML file. Missing sections fall back to defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults (or `KICKOFF_CONFIG_PATH`) with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match std::env::var("KICKOFF_CONFIG_PATH") {
            Ok(path) => Self::from_toml_file(path)?,
            Err(_) => Self::default(),
        };

        if let Some(secs) = env_parse::<u64>("KICKOFF_BUILDER_TIMEOUT_SECS") {
            config.orchestrator.builder_timeout_secs = secs;
        }
        if let Some(n) = env_parse::<usize>("KICKOFF_MAX_CONCURRENT_RUNS") {
            config.orchestrator.max_concurrent_runs = n;
        }
        if let Some(secs) = env_parse::<u64>("KICKOFF_SWEEP_INTERVAL_SECS") {
            config.orchestrator.sweep_interval_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the structural invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        let mut previous: Option<(Window, &WindowPolicyConfig)> = None;
        for window in Window::ALL {
            let policy = self.windows.get(window);
            if policy.schedule_offset_minutes <= 0 {
                bail!("{}: schedule offset must be positive", window);
            }
            // Cutoff must precede nominal execution unless the tolerance spans zero.
            if policy.cutoff_offset_minutes <= policy.schedule_offset_minutes
                && policy.execution_tolerance_minutes < policy.schedule_offset_minutes
            {
                bail!(
                    "{}: cutoff offset {}m must exceed schedule offset {}m",
                    window,
                    policy.cutoff_offset_minutes,
                    policy.schedule_offset_minutes
                );
            }
            if let Some((prev_window, prev)) = previous {
                if prev.schedule_offset_minutes <= policy.schedule_offset_minutes {
                    bail!("{} must be scheduled before {}", prev_window, window);
                }
                if prev.cutoff_offset_minutes < policy.cutoff_offset_minutes {
                    bail!("{} cutoff offset must not be narrower than {}", prev_window, window);
                }
                if prev.execution_tolerance_minutes < policy.execution_tolerance_minutes {
                    bail!("{} tolerance must not be narrower than {}", prev_window, window);
                }
            }
            previous = Some((window, policy));
        }

        if self.terminal_lead.min_minutes >= self.terminal_lead.max_minutes {
            bail!("terminal lead bound is empty");
        }
        if !(0.0..=1.0).contains(&self.correction.smoothing_weight) {
            bail!("smoothing weight must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.suspicious.certainty_share) {
            bail!("certainty share must be within [0, 1]");
        }
        if self.orchestrator.max_concurrent_runs == 0 {
            bail!("max_concurrent_runs must be at least 1");
        }
        Ok(())
    }

    pub fn window(&self, window: Window) -> &WindowPolicyConfig {
        self.windows.get(window)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// One entry per window. A partial `[windows.<w>]` table overrides only the keys
/// it names; the rest keep that window's defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "WindowTableOverrides")]
pub struct WindowTable {
    pub t24h: WindowPolicyConfig,
    pub t6h: WindowPolicyConfig,
    pub t3h: WindowPolicyConfig,
    pub t90m: WindowPolicyConfig,
}

impl WindowTable {
    pub fn get(&self, window: Window) -> &WindowPolicyConfig {
        match window {
            Window::T24h => &self.t24h,
            Window::T6h => &self.t6h,
            Window::T3h => &self.t3h,
            Window::T90m => &self.t90m,
        }
    }

    /// Widest schedule offset plus its tolerance: how far ahead a sweep must look.
    pub fn horizon(&self) -> ChronoDuration {
        Window::ALL
            .iter()
            .map(|w| {
                let p = self.get(*w);
                p.schedule_offset() + p.execution_tolerance()
            })
            .max()
            .unwrap_or_else(ChronoDuration::zero)
    }
}

impl Default for WindowTable {
    fn default() -> Self {
        Self {
            t24h: WindowPolicyConfig::new(
                24 * 60,
                25 * 60,
                120,
                &["press_reports", "probable_lineups", "injury_reports"],
                &[],
            ),
            t6h: WindowPolicyConfig::new(
                6 * 60,
                6 * 60 + 30,
                45,
                &["probable_lineups", "injury_reports"],
                &[],
            ),
            t3h: WindowPolicyConfig::new(3 * 60, 3 * 60 + 15, 20, &["injury_reports"], &[]),
            t90m: WindowPolicyConfig::new(90, 120, 5, &[], &["probable_lineup_strength"]),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WindowTableOverrides {
    t24h: WindowPolicyOverrides,
    t6h: WindowPolicyOverrides,
    t3h: WindowPolicyOverrides,
    t90m: WindowPolicyOverrides,
}

impl From<WindowTableOverrides> for WindowTable {
    fn from(o: WindowTableOverrides) -> Self {
        let base = WindowTable::default();
        Self {
            t24h: o.t24h.apply(base.t24h),
            t6h: o.t6h.apply(base.t6h),
            t3h: o.t3h.apply(base.t3h),
            t90m: o.t90m.apply(base.t90m),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WindowPolicyOverrides {
    schedule_offset_minutes: Option<i64>,
    cutoff_offset_minutes: Option<i64>,
    execution_tolerance_minutes: Option<i64>,
    allowed_sources: Option<Vec<String>>,
    restricted_fields: Option<Vec<String>>,
}

impl WindowPolicyOverrides {
    fn apply(self, base: WindowPolicyConfig) -> WindowPolicyConfig {
        WindowPolicyConfig {
            schedule_offset_minutes: self.schedule_offset_minutes.unwrap_or(base.schedule_offset_minutes),
            cutoff_offset_minutes: self.cutoff_offset_minutes.unwrap_or(base.cutoff_offset_minutes),
            execution_tolerance_minutes: self
                .execution_tolerance_minutes
                .unwrap_or(base.execution_tolerance_minutes),
            allowed_sources: self.allowed_sources.unwrap_or(base.allowed_sources),
            restricted_fields: self.restricted_fields.unwrap_or(base.restricted_fields),
        }
    }
}

/// Cutoff and scheduling policy for one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowPolicyConfig {
    /// Nominal execution time, minutes before event start
    pub schedule_offset_minutes: i64,
    /// Cutoff, minutes before the decision time
    pub cutoff_offset_minutes: i64,
    /// Half-width of the execution band around the nominal time
    pub execution_tolerance_minutes: i64,
    /// Sources whose data may be used at this window
    pub allowed_sources: Vec<String>,
    /// Fields that must never appear at this window
    pub restricted_fields: Vec<String>,
}

impl WindowPolicyConfig {
    fn new(
        schedule_offset_minutes: i64,
        cutoff_offset_minutes: i64,
        execution_tolerance_minutes: i64,
        extra_sources: &[&str],
        extra_restricted: &[&str],
    ) -> Self {
        Self {
            schedule_offset_minutes,
            cutoff_offset_minutes,
            execution_tolerance_minutes,
            allowed_sources: BASE_SOURCES
                .iter()
                .chain(extra_sources)
                .map(|s| s.to_string())
                .collect(),
            restricted_fields: ALWAYS_RESTRICTED
                .iter()
                .chain(extra_restricted)
                .map(|s| s.to_string())
                .collect(),
        }
    }

    #[inline]
    pub fn schedule_offset(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.schedule_offset_minutes)
    }

    #[inline]
    pub fn cutoff_offset(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.cutoff_offset_minutes)
    }

    #[inline]
    pub fn execution_tolerance(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.execution_tolerance_minutes)
    }
}

/// Terminal-window lead time: `min < event_start - now <= max`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadTimeBounds {
    pub min_minutes: i64,
    pub max_minutes: i64,
}

impl Default for LeadTimeBounds {
    fn default() -> Self {
        Self {
            min_minutes: 60,
            max_minutes: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspiciousConfig {
    /// Records within ±band of the cutoff count toward a cluster
    pub cluster_band_minutes: i64,
    /// More than this many clustered records raises a warning
    pub cluster_threshold: usize,
    /// Probability-like player features checked for over-precision
    pub probability_features: Vec<String>,
    /// Share of exact 0/1 values above which a warning is raised
    pub certainty_share: f64,
    /// Populations smaller than this are not judged
    pub min_population: usize,
}

impl Default for SuspiciousConfig {
    fn default() -> Self {
        Self {
            cluster_band_minutes: 5,
            cluster_threshold: 5,
            probability_features: vec!["start_probability".to_string()],
            certainty_share: 0.30,
            min_population: 5,
        }
    }
}

/// Conservative prior used to fill a gap in a load-bearing feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorConfig {
    pub feature: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Extra margin subtracted from the cutoff when recomputing
    pub safety_margin_hours: i64,
    /// Team features that always get a prior when missing
    pub priors: Vec<PriorConfig>,
    /// Source tag written on substituted values
    pub prior_source: String,
    /// Short-horizon features blended toward their long-run average
    pub volatile_features: Vec<String>,
    /// Weight of the corrected value in the blend
    pub smoothing_weight: f64,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        let prior = |feature: &str, value: f64| PriorConfig {
            feature: feature.to_string(),
            value,
        };
        Self {
            safety_margin_hours: 24,
            priors: vec![
                prior("win_rate", 0.45),
                prior("goals_scored_avg", 1.35),
                prior("goals_conceded_avg", 1.35),
                prior("elo_rating", 1500.0),
            ],
            prior_source: "population_prior".to_string(),
            volatile_features: vec![
                "form_last5".to_string(),
                "goals_scored_last5".to_string(),
                "xg_last5".to_string(),
            ],
            smoothing_weight: 0.7,
        }
    }
}

impl CorrectionConfig {
    pub fn safety_margin(&self) -> ChronoDuration {
        ChronoDuration::hours(self.safety_margin_hours)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub warning_penalty: f64,
    pub min_feature_count: usize,
    pub insufficient_features_penalty: f64,
    /// Share of boundary values (0, 1, round numbers) considered implausible
    pub boundary_share_threshold: f64,
    pub boundary_values_penalty: f64,
    pub corrected_penalty: f64,
    pub manual_review_confidence: f64,
    pub max_warnings: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            warning_penalty: 0.05,
            min_feature_count: 15,
            insufficient_features_penalty: 0.20,
            boundary_share_threshold: 0.5,
            boundary_values_penalty: 0.15,
            corrected_penalty: 0.05,
            manual_review_confidence: 0.7,
            max_warnings: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-builder timeout; exceeding it counts as a builder failure
    pub builder_timeout_secs: u64,
    /// Upper bound on concurrently running pipelines in a sweep
    pub max_concurrent_runs: usize,
    /// Interval between sweeps in the driver loop
    pub sweep_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            builder_timeout_secs: 30,
            max_concurrent_runs: 8,
            sweep_interval_secs: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn builder_timeout(&self) -> Duration {
        Duration::from_secs(self.builder_timeout_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
