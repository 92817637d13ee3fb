//! Per-mount alert state machine with a recovery dead band and a nag interval.
//!
//! A mount is `Alerting` while an [`AlertState`] exists for it and `Normal`
//! otherwise. Each pass feeds the fresh sample and the persisted state through
//! [`HysteresisGate::evaluate`], which returns the notification decision and the
//! flag mutation the caller must apply. The gate itself holds no state.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::sampler::MountSample;
use crate::notify::message::AlertKind;
use crate::state::flags::AlertState;

/// Validated alert thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub high_percent: u32,
    pub recovery_offset_percent: u32,
    pub nag_interval_minutes: u64,
}

impl Thresholds {
    /// `high - offset`, possibly zero or negative.
    #[must_use]
    pub fn recovery_percent(&self) -> f64 {
        f64::from(self.high_percent) - f64::from(self.recovery_offset_percent)
    }

    /// True when no sample can ever fall below the recovery threshold.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.high_percent <= self.recovery_offset_percent
    }

    #[must_use]
    pub fn nag_interval(&self) -> TimeDelta {
        i64::try_from(self.nag_interval_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or(TimeDelta::MAX)
    }
}

/// What the gate decided for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// First breach: notify and create the flag.
    New,
    /// Still breached and the nag interval elapsed: notify and touch the flag.
    Reminder,
    /// Still breached, nag interval not elapsed.
    Suppressed,
    /// Dropped below recovery: notify and delete the flag.
    Resolved,
    /// Dead band, or below recovery with nothing to resolve.
    Hold,
    /// `total_bytes == 0`; percent is undefined.
    Unmeasurable,
}

impl Decision {
    /// Notification to send, if any.
    #[must_use]
    pub const fn alert_kind(self) -> Option<AlertKind> {
        match self {
            Self::New => Some(AlertKind::New),
            Self::Reminder => Some(AlertKind::Reminder),
            Self::Resolved => Some(AlertKind::Resolved),
            Self::Suppressed | Self::Hold | Self::Unmeasurable => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Reminder => "reminder",
            Self::Suppressed => "suppressed",
            Self::Resolved => "resolved",
            Self::Hold => "hold",
            Self::Unmeasurable => "unmeasurable",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flag mutation implied by a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagAction {
    Keep,
    Put(AlertState),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub decision: Decision,
    pub action: FlagAction,
}

impl GateOutcome {
    const fn unchanged(decision: Decision) -> Self {
        Self {
            decision,
            action: FlagAction::Keep,
        }
    }
}

/// Stateless evaluator over fixed thresholds.
#[derive(Debug, Clone, Copy)]
pub struct HysteresisGate {
    thresholds: Thresholds,
}

impl HysteresisGate {
    #[must_use]
    pub const fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    #[must_use]
    pub const fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Decide the transition for `sample` given the persisted `state`.
    ///
    /// The high check runs before the recovery check, so with a degenerate
    /// configuration a breached mount always stays alerting.
    #[must_use]
    pub fn evaluate(
        &self,
        sample: &MountSample,
        state: Option<&AlertState>,
        now: DateTime<Utc>,
    ) -> GateOutcome {
        let Some(percent) = sample.percent_used else {
            return GateOutcome::unchanged(Decision::Unmeasurable);
        };
        let active = state.filter(|existing| existing.is_active);

        if percent >= f64::from(self.thresholds.high_percent) {
            return match active {
                None => GateOutcome {
                    decision: Decision::New,
                    action: FlagAction::Put(AlertState::opened(&sample.mount_path, now)),
                },
                Some(existing)
                    if now - existing.last_notified_at >= self.thresholds.nag_interval() =>
                {
                    GateOutcome {
                        decision: Decision::Reminder,
                        action: FlagAction::Put(existing.renotified(now)),
                    }
                }
                Some(_) => GateOutcome::unchanged(Decision::Suppressed),
            };
        }

        if percent < self.thresholds.recovery_percent() && active.is_some() {
            return GateOutcome {
                decision: Decision::Resolved,
                action: FlagAction::Delete,
            };
        }

        GateOutcome::unchanged(Decision::Hold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn gate() -> HysteresisGate {
        HysteresisGate::new(Thresholds {
            high_percent: 90,
            recovery_offset_percent: 5,
            nag_interval_minutes: 480,
        })
    }

    fn sample_at(used_gib: u64) -> MountSample {
        MountSample::from_parts(Path::new("/data"), 100 * GIB, used_gib * GIB, 0, 1, Vec::new())
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn active_since(at: DateTime<Utc>) -> AlertState {
        AlertState::opened(Path::new("/data"), at)
    }

    #[test]
    fn first_breach_opens_alert() {
        let outcome = gate().evaluate(&sample_at(92), None, t0());
        assert_eq!(outcome.decision, Decision::New);
        let FlagAction::Put(state) = outcome.action else {
            panic!("expected put, got {:?}", outcome.action);
        };
        assert_eq!(state.mount_path, PathBuf::from("/data"));
        assert!(state.is_active);
        assert_eq!(state.first_alerted_at, t0());
        assert_eq!(state.last_notified_at, t0());
    }

    #[test]
    fn exactly_at_high_threshold_breaches() {
        let outcome = gate().evaluate(&sample_at(90), None, t0());
        assert_eq!(outcome.decision, Decision::New);
    }

    #[test]
    fn every_whole_high_threshold_breaches_exactly_at_the_line() {
        for high in 1..=100_u32 {
            let gate = HysteresisGate::new(Thresholds {
                high_percent: high,
                recovery_offset_percent: 5,
                nag_interval_minutes: 480,
            });
            let at_line = MountSample::from_parts(
                Path::new("/data"),
                100,
                u64::from(high),
                0,
                1,
                Vec::new(),
            );
            let outcome = gate.evaluate(&at_line, None, t0());
            assert_eq!(outcome.decision, Decision::New, "high = {high}");
        }
    }

    #[test]
    fn exactly_at_recovery_line_holds() {
        for high in 6..=100_u32 {
            let gate = HysteresisGate::new(Thresholds {
                high_percent: high,
                recovery_offset_percent: 5,
                nag_interval_minutes: 480,
            });
            let at_recovery = MountSample::from_parts(
                Path::new("/data"),
                100,
                u64::from(high - 5),
                0,
                1,
                Vec::new(),
            );
            let outcome = gate.evaluate(&at_recovery, Some(&active_since(t0())), t0());
            assert_eq!(outcome.decision, Decision::Hold, "high = {high}");
            assert_eq!(outcome.action, FlagAction::Keep);
        }
    }

    #[test]
    fn reminder_waits_for_full_nag_interval() {
        let state = active_since(t0());
        let almost = t0() + TimeDelta::minutes(480) - TimeDelta::seconds(1);
        let outcome = gate().evaluate(&sample_at(95), Some(&state), almost);
        assert_eq!(outcome.decision, Decision::Suppressed);
        assert_eq!(outcome.action, FlagAction::Keep);

        let due = t0() + TimeDelta::minutes(480);
        let outcome = gate().evaluate(&sample_at(95), Some(&state), due);
        assert_eq!(outcome.decision, Decision::Reminder);
        let FlagAction::Put(updated) = outcome.action else {
            panic!("reminder must touch the flag");
        };
        assert_eq!(updated.first_alerted_at, t0());
        assert_eq!(updated.last_notified_at, due);
    }

    #[test]
    fn dead_band_with_active_alert_holds() {
        let state = active_since(t0());
        let outcome = gate().evaluate(&sample_at(87), Some(&state), t0() + TimeDelta::hours(1));
        assert_eq!(outcome.decision, Decision::Hold);
        assert_eq!(outcome.action, FlagAction::Keep);
    }

    #[test]
    fn dead_band_without_alert_holds() {
        let outcome = gate().evaluate(&sample_at(87), None, t0());
        assert_eq!(outcome.decision, Decision::Hold);
    }

    #[test]
    fn below_recovery_resolves_active_alert() {
        let state = active_since(t0());
        let outcome = gate().evaluate(&sample_at(83), Some(&state), t0() + TimeDelta::minutes(5));
        assert_eq!(outcome.decision, Decision::Resolved);
        assert_eq!(outcome.action, FlagAction::Delete);
    }

    #[test]
    fn exactly_at_recovery_does_not_resolve() {
        let state = active_since(t0());
        let outcome = gate().evaluate(&sample_at(85), Some(&state), t0());
        assert_eq!(outcome.decision, Decision::Hold);
    }

    #[test]
    fn below_recovery_without_alert_is_noop() {
        let outcome = gate().evaluate(&sample_at(10), None, t0());
        assert_eq!(outcome, GateOutcome::unchanged(Decision::Hold));
    }

    #[test]
    fn zero_total_is_unmeasurable() {
        let empty = MountSample::from_parts(Path::new("/data"), 0, 0, 0, 1, Vec::new());
        let state = active_since(t0());
        for existing in [None, Some(&state)] {
            let outcome = gate().evaluate(&empty, existing, t0());
            assert_eq!(outcome.decision, Decision::Unmeasurable);
            assert_eq!(outcome.action, FlagAction::Keep);
        }
    }

    #[test]
    fn inactive_record_is_treated_as_normal() {
        let mut state = active_since(t0());
        state.is_active = false;
        let outcome = gate().evaluate(&sample_at(95), Some(&state), t0());
        assert_eq!(outcome.decision, Decision::New);
    }

    #[test]
    fn degenerate_thresholds_never_resolve() {
        let gate = HysteresisGate::new(Thresholds {
            high_percent: 3,
            recovery_offset_percent: 5,
            nag_interval_minutes: 60,
        });
        assert!(gate.thresholds().is_degenerate());
        let state = active_since(t0());
        let empty_disk =
            MountSample::from_parts(Path::new("/data"), 100 * GIB, 0, 0, 1, Vec::new());
        let outcome = gate.evaluate(&empty_disk, Some(&state), t0());
        assert_eq!(outcome.decision, Decision::Hold);
    }

    #[test]
    fn clock_skew_backwards_suppresses() {
        let state = active_since(t0());
        let outcome = gate().evaluate(&sample_at(99), Some(&state), t0() - TimeDelta::hours(2));
        assert_eq!(outcome.decision, Decision::Suppressed);
    }

    #[test]
    fn huge_nag_interval_saturates() {
        let thresholds = Thresholds {
            high_percent: 90,
            recovery_offset_percent: 5,
            nag_interval_minutes: u64::MAX,
        };
        assert_eq!(thresholds.nag_interval(), TimeDelta::MAX);
    }

    #[test]
    fn decision_maps_to_alert_kind() {
        assert_eq!(Decision::New.alert_kind(), Some(AlertKind::New));
        assert_eq!(Decision::Reminder.alert_kind(), Some(AlertKind::Reminder));
        assert_eq!(Decision::Resolved.alert_kind(), Some(AlertKind::Resolved));
        assert_eq!(Decision::Suppressed.alert_kind(), None);
        assert_eq!(Decision::Unmeasurable.to_string(), "unmeasurable");
    }
}
