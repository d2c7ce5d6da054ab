//! Window Scheduler
//!
//! Decides when each window should run for an event, and whether "now" is
//! still inside that window's execution band. Pure given the injected clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TemporalConfig;
use crate::models::{PipelineStatus, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    ShouldRun,
    /// A Completed or Failed run exists. A TemporalViolation run may be retried.
    AlreadyRan,
    TooEarly,
    AlreadyLate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionBand {
    pub scheduled: DateTime<Utc>,
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl ExecutionBand {
    #[inline]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.earliest && t <= self.latest
    }
}

#[derive(Clone)]
pub struct WindowScheduler {
    config: Arc<TemporalConfig>,
}

impl WindowScheduler {
    pub fn new(config: Arc<TemporalConfig>) -> Self {
        Self { config }
    }

    pub fn scheduled_time(&self, window: Window, event_start: DateTime<Utc>) -> DateTime<Utc> {
        event_start - self.config.window(window).schedule_offset()
    }

    pub fn execution_band(&self, window: Window, scheduled: DateTime<Utc>) -> ExecutionBand {
        let tolerance = self.config.window(window).execution_tolerance();
        ExecutionBand {
            scheduled,
            earliest: scheduled - tolerance,
            latest: scheduled + tolerance,
        }
    }

    pub fn next_action(
        &self,
        window: Window,
        event_start: DateTime<Utc>,
        now: DateTime<Utc>,
        last_status: Option<PipelineStatus>,
    ) -> NextAction {
        if matches!(
            last_status,
            Some(PipelineStatus::Completed) | Some(PipelineStatus::Failed)
        ) {
            return NextAction::AlreadyRan;
        }

        let band = self.execution_band(window, self.scheduled_time(window, event_start));
        if now < band.earliest {
            NextAction::TooEarly
        } else if now > band.latest {
            NextAction::AlreadyLate
        } else {
            NextAction::ShouldRun
        }
    }

    /// `now` must fall inside the band around `scheduled`.
    pub fn band_check(
        &self,
        window: Window,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let band = self.execution_band(window, scheduled);
        if band.contains(now) {
            return Ok(());
        }
        let drift = now - scheduled;
        Err(format!(
            "{} executed {} from its scheduled time {}, outside the ±{}m execution band",
            window,
            fmt_signed_minutes(drift),
            scheduled,
            (band.latest - band.scheduled).num_minutes()
        ))
    }

    /// A caller-supplied schedule must sit inside the band of the derived one.
    pub fn schedule_check(
        &self,
        window: Window,
        derived: DateTime<Utc>,
        requested: DateTime<Utc>,
    ) -> Result<(), String> {
        let band = self.execution_band(window, derived);
        if band.contains(requested) {
            return Ok(());
        }
        Err(format!(
            "{} requested schedule {} is {} from its derived time {}, outside the ±{}m execution band",
            window,
            requested,
            fmt_signed_minutes(requested - derived),
            derived,
            (band.latest - band.scheduled).num_minutes()
        ))
    }

    /// Terminal-window lead time: `min < event_start - now <= max`.
    pub fn terminal_lead_check(&self, event_start: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), String> {
        let bounds = &self.config.terminal_lead;
        let lead = event_start - now;
        let min = Duration::minutes(bounds.min_minutes);
        let max = Duration::minutes(bounds.max_minutes);
        if lead > min && lead <= max {
            return Ok(());
        }
        Err(format!(
            "lead time {} before event start violates the terminal lead-time bound ({}m < lead <= {}m)",
            fmt_signed_minutes(lead),
            bounds.min_minutes,
            bounds.max_minutes
        ))
    }
}

fn fmt_signed_minutes(d: Duration) -> String {
    let m = d.num_minutes();
    if m >= 0 {
        format!("+{}m", m)
    } else {
        format!("{}m", m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn kickoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap()
    }

    fn scheduler() -> WindowScheduler {
        WindowScheduler::new(Arc::new(TemporalConfig::default()))
    }

    #[test]
    fn test_scheduled_times() {
        let s = scheduler();
        assert_eq!(s.scheduled_time(Window::T24h, kickoff()), kickoff() - Duration::hours(24));
        assert_eq!(s.scheduled_time(Window::T90m, kickoff()), kickoff() - Duration::minutes(90));
    }

    #[test]
    fn test_next_action_band_edges() {
        let s = scheduler();
        let scheduled = kickoff() - Duration::minutes(90);

        assert_eq!(
            s.next_action(Window::T90m, kickoff(), scheduled - Duration::minutes(6), None),
            NextAction::TooEarly
        );
        assert_eq!(
            s.next_action(Window::T90m, kickoff(), scheduled - Duration::minutes(5), None),
            NextAction::ShouldRun
        );
        assert_eq!(
            s.next_action(Window::T90m, kickoff(), scheduled + Duration::minutes(5), None),
            NextAction::ShouldRun
        );
        assert_eq!(
            s.next_action(Window::T90m, kickoff(), scheduled + Duration::minutes(6), None),
            NextAction::AlreadyLate
        );
    }

    #[test]
    fn test_temporal_violation_can_be_retried() {
        let s = scheduler();
        let now = kickoff() - Duration::minutes(90);
        assert_eq!(
            s.next_action(Window::T90m, kickoff(), now, Some(PipelineStatus::Completed)),
            NextAction::AlreadyRan
        );
        assert_eq!(
            s.next_action(Window::T90m, kickoff(), now, Some(PipelineStatus::Failed)),
            NextAction::AlreadyRan
        );
        assert_eq!(
            s.next_action(Window::T90m, kickoff(), now, Some(PipelineStatus::TemporalViolation)),
            NextAction::ShouldRun
        );
    }

    #[test]
    fn test_earliest_window_is_lenient() {
        let s = scheduler();
        let now = kickoff() - Duration::hours(23);
        assert_eq!(s.next_action(Window::T24h, kickoff(), now, None), NextAction::ShouldRun);
    }

    #[test]
    fn test_terminal_lead_bounds() {
        let s = scheduler();
        assert!(s.terminal_lead_check(kickoff(), kickoff() - Duration::minutes(90)).is_ok());
        assert!(s.terminal_lead_check(kickoff(), kickoff() - Duration::minutes(120)).is_ok());
        assert!(s.terminal_lead_check(kickoff(), kickoff() - Duration::minutes(60)).is_err());

        let reason = s
            .terminal_lead_check(kickoff(), kickoff() - Duration::minutes(40))
            .unwrap_err();
        assert!(reason.contains("lead-time bound"));
        assert!(reason.contains("+40m"));
    }

    #[test]
    fn test_band_check_reason() {
        let s = scheduler();
        let scheduled = kickoff() - Duration::minutes(90);
        assert!(s.band_check(Window::T90m, scheduled, scheduled).is_ok());
        let reason = s
            .band_check(Window::T90m, scheduled, scheduled + Duration::minutes(12))
            .unwrap_err();
        assert!(reason.contains("+12m"));
    }

    #[test]
    fn test_schedule_override_must_match_derived_time() {
        let s = scheduler();
        let derived = s.scheduled_time(Window::T6h, kickoff());
        assert!(s
            .schedule_check(Window::T6h, derived, derived + Duration::minutes(30))
            .is_ok());
        let reason = s
            .schedule_check(Window::T6h, derived, kickoff() - Duration::hours(1))
            .unwrap_err();
        assert!(reason.contains("+300m"));
        assert!(reason.contains("execution band"));
    }
}
