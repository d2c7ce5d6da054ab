//! Cutoff Policy
//!
//! Maps `(window, decision_time)` to the latest admissible data timestamp and the
//! sources/fields admissible at that window. The decision time is the event start.
//!
//! # Hard Invariant
//! Data with `observed_at > cutoff_time` must not reach a decision for this window.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use crate::config::TemporalConfig;
use crate::models::{FeatureRecord, Window};

/// Immutable per-(window, decision_time) policy. Recomputed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoffPolicy {
    pub window: Window,
    pub decision_time: DateTime<Utc>,
    pub cutoff_time: DateTime<Utc>,
    pub allowed_sources: BTreeSet<String>,
    pub restricted_fields: BTreeSet<String>,
    pub execution_tolerance: Duration,
}

impl CutoffPolicy {
    /// Derive the policy. Pure and total.
    pub fn derive(window: Window, decision_time: DateTime<Utc>, config: &TemporalConfig) -> Self {
        let policy = config.window(window);
        Self {
            window,
            decision_time,
            cutoff_time: decision_time - policy.cutoff_offset(),
            allowed_sources: policy.allowed_sources.iter().cloned().collect(),
            restricted_fields: policy.restricted_fields.iter().cloned().collect(),
            execution_tolerance: policy.execution_tolerance(),
        }
    }

    /// Same policy with the cutoff moved earlier by `margin`.
    pub fn tightened(&self, margin: Duration) -> Self {
        Self {
            cutoff_time: self.cutoff_time - margin,
            ..self.clone()
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.window.is_terminal()
    }

    #[inline]
    pub fn admits_time(&self, t: DateTime<Utc>) -> bool {
        t <= self.cutoff_time
    }

    #[inline]
    pub fn admits_source(&self, source: &str) -> bool {
        self.allowed_sources.contains(source)
    }

    #[inline]
    pub fn restricts_field(&self, name: &str) -> bool {
        self.restricted_fields.contains(name)
    }

    /// Timestamp, source and field all admissible.
    pub fn admits(&self, record: &FeatureRecord) -> bool {
        self.admits_time(record.observed_at)
            && self.admits_source(&record.source)
            && !self.restricts_field(&record.feature.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeatureRef;
    use chrono::TimeZone;

    fn kickoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_terminal_policy() {
        let config = TemporalConfig::default();
        let policy = CutoffPolicy::derive(Window::T90m, kickoff(), &config);

        assert_eq!(policy.cutoff_time, kickoff() - Duration::hours(2));
        assert!(policy.execution_tolerance < Duration::minutes(10));
        assert!(policy.restricts_field("confirmed_lineup"));
        assert!(policy.restricts_field("probable_lineup_strength"));
        assert!(!policy.admits_source("probable_lineups"));
        assert!(!policy.admits_source("live_odds"));
        assert!(policy.is_terminal());
    }

    #[test]
    fn test_earlier_windows_are_wider() {
        let config = TemporalConfig::default();
        let policies: Vec<CutoffPolicy> = Window::ALL
            .iter()
            .map(|w| CutoffPolicy::derive(*w, kickoff(), &config))
            .collect();

        for pair in policies.windows(2) {
            assert!(pair[0].cutoff_time < pair[1].cutoff_time);
            assert!(pair[0].execution_tolerance > pair[1].execution_tolerance);
            assert!(pair[0].allowed_sources.is_superset(&pair[1].allowed_sources));
        }
        assert!(!policies[0].admits_source("live_score"));
    }

    #[test]
    fn test_cutoff_precedes_nominal_execution() {
        let config = TemporalConfig::default();
        for window in Window::ALL {
            let policy = CutoffPolicy::derive(window, kickoff(), &config);
            let nominal = kickoff() - config.window(window).schedule_offset();
            assert!(policy.cutoff_time < nominal, "{}", window);
        }
    }

    #[test]
    fn test_deterministic() {
        let config = TemporalConfig::default();
        let a = CutoffPolicy::derive(Window::T6h, kickoff(), &config);
        let b = CutoffPolicy::derive(Window::T6h, kickoff(), &config);
        assert_eq!(a, b);
    }

    #[test]
    fn test_admits_record() {
        let config = TemporalConfig::default();
        let policy = CutoffPolicy::derive(Window::T90m, kickoff(), &config);
        let ok = FeatureRecord::new(
            FeatureRef::team("ARS", "win_rate"),
            0.6,
            policy.cutoff_time,
            "team_stats",
        );
        assert!(policy.admits(&ok));

        let late = FeatureRecord {
            observed_at: policy.cutoff_time + Duration::seconds(1),
            ..ok.clone()
        };
        assert!(!policy.admits(&late));

        let tightened = policy.tightened(Duration::days(1));
        assert!(!tightened.admits(&ok));
    }
}
