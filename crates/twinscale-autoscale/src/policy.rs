//! Scaling policy — turns verdicts into decisions with hysteresis.
//!
//! A single steady or transient verdict never moves a sensor. The engine
//! keeps two streak counters per sensor (carried on the record and handed
//! back inside each decision) and only acts once a streak reaches its
//! threshold. A verdict of the opposite class resets the other streak, so
//! a lone outlier between steady verdicts costs the sensor its progress
//! toward scale-down but never triggers scale-up by itself.

use tracing::trace;

use twinscale_core::config::PolicyConfig;
use twinscale_core::{
    Classification, EpochMillis, LifecycleState, ScalingAction, ScalingDecision, SensorRecord,
    Streak, Verdict,
};

/// Stateless decision function; all per-sensor memory lives on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicyEngine {
    k_steady: u32,
    k_transient: u32,
}

impl ScalingPolicyEngine {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            k_steady: config.k_steady.max(1),
            k_transient: config.k_transient.max(1),
        }
    }

    pub fn k_steady(&self) -> u32 {
        self.k_steady
    }

    pub fn k_transient(&self) -> u32 {
        self.k_transient
    }

    /// Decide what to do with `record` given its latest verdict.
    pub fn decide(
        &self,
        record: &SensorRecord,
        verdict: &Verdict,
        now: EpochMillis,
    ) -> ScalingDecision {
        let prev = record.streak();
        let (action, streak, reason) = match verdict.classification {
            Classification::InsufficientData => (
                ScalingAction::Hold,
                prev,
                format!(
                    "insufficient data ({} samples over {} ms)",
                    verdict.sample_count, verdict.window_span_ms
                ),
            ),
            Classification::Steady => {
                let streak = Streak {
                    steady: prev.steady.saturating_add(1),
                    transient: 0,
                };
                if streak.steady >= self.k_steady && record.state == LifecycleState::Active {
                    let action = if record.provisional {
                        ScalingAction::Retire
                    } else {
                        ScalingAction::ScaleDown
                    };
                    let reason = format!(
                        "steady for {} consecutive evaluations (confidence {:.2})",
                        streak.steady, verdict.confidence
                    );
                    (action, streak, reason)
                } else {
                    let reason = format!("steady {}/{}", streak.steady, self.k_steady);
                    (ScalingAction::Hold, streak, reason)
                }
            }
            Classification::Transient => {
                let streak = Streak {
                    steady: 0,
                    transient: prev.transient.saturating_add(1),
                };
                if streak.transient >= self.k_transient
                    && record.state == LifecycleState::PendingCreate
                {
                    let reason = format!(
                        "transient for {} consecutive evaluations (confidence {:.2})",
                        streak.transient, verdict.confidence
                    );
                    (ScalingAction::ScaleUp, streak, reason)
                } else {
                    let reason = format!("transient {}/{}", streak.transient, self.k_transient);
                    (ScalingAction::Hold, streak, reason)
                }
            }
        };

        trace!(
            sensor = %record.sensor_id,
            classification = %verdict.classification,
            %action,
            steady = streak.steady,
            transient = streak.transient,
            "policy decision"
        );

        ScalingDecision {
            sensor_id: record.sensor_id.clone(),
            action,
            reason,
            decided_at: now,
            streak,
        }
    }

    /// Decide for a sensor whose telemetry has gone silent.
    ///
    /// An active instance with nothing to mirror is retired. Streaks reset
    /// either way so stale history cannot trigger a decision later.
    pub fn decide_stale(&self, record: &SensorRecord, now: EpochMillis) -> ScalingDecision {
        let (action, reason) = if record.state == LifecycleState::Active {
            (ScalingAction::Retire, "telemetry stopped".to_string())
        } else {
            (ScalingAction::Hold, "telemetry stale".to_string())
        };
        ScalingDecision {
            sensor_id: record.sensor_id.clone(),
            action,
            reason,
            decided_at: now,
            streak: Streak::default(),
        }
    }
}

impl Default for ScalingPolicyEngine {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}
