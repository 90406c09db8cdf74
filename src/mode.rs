// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hybrid online/offline mode controller with hysteresis.
//!
//! `configured` is fixed for the process lifetime; the hybrid hysteresis state
//! (`fail_count`, sub-state, `last_probe_at`) is tracked per [`BoxSession`](crate::engine),
//! mirroring how `azure_iot_operations_mqtt`'s `ReconnectPolicy` is a stateless
//! strategy consulted by per-session state rather than a global actor.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The process-wide configured mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfiguredMode {
    Online,
    Hybrid,
    Offline,
}

impl ConfiguredMode {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "hybrid" => Some(Self::Hybrid),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Hybrid mode's dynamic sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridSubState {
    Probing,
    InOffline,
}

/// What the `Session Engine` should do for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AttemptCloud,
    RespondLocally,
}

/// A hybrid sub-state transition, for the `ModeTransition` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub from: HybridSubState,
    pub to: HybridSubState,
    pub fail_count: u32,
}

struct HybridState {
    fail_count: u32,
    sub_state: HybridSubState,
    last_probe_at: Option<Instant>,
}

/// Per-`BoxSession` mode controller. Cheap to construct; one per accepted connection.
pub struct ModeController {
    configured: ConfiguredMode,
    fail_threshold: u32,
    retry_interval: Duration,
    hybrid: Mutex<HybridState>,
}

impl ModeController {
    #[must_use]
    pub fn new(configured: ConfiguredMode, fail_threshold: u32, retry_interval: Duration) -> Self {
        Self {
            configured,
            fail_threshold,
            retry_interval,
            hybrid: Mutex::new(HybridState {
                fail_count: 0,
                sub_state: HybridSubState::Probing,
                last_probe_at: None,
            }),
        }
    }

    #[must_use]
    pub fn configured(&self) -> ConfiguredMode {
        self.configured
    }

    /// Whether a cloud attempt should be made for the current frame. For `hybrid`
    /// while `in_offline`, this also records the probe attempt (`last_probe_at`)
    /// when it decides to try: on a probe attempt, `last_probe_at` is updated to
    /// now regardless of outcome.
    #[must_use]
    pub fn decide(&self) -> Decision {
        match self.configured {
            ConfiguredMode::Online => Decision::AttemptCloud,
            ConfiguredMode::Offline => Decision::RespondLocally,
            ConfiguredMode::Hybrid => {
                let mut hybrid = self.hybrid.lock().unwrap();
                match hybrid.sub_state {
                    HybridSubState::Probing => Decision::AttemptCloud,
                    HybridSubState::InOffline => {
                        let now = Instant::now();
                        let should_probe = match hybrid.last_probe_at {
                            None => true,
                            Some(at) => now.duration_since(at) >= self.retry_interval,
                        };
                        if should_probe {
                            hybrid.last_probe_at = Some(now);
                            Decision::AttemptCloud
                        } else {
                            Decision::RespondLocally
                        }
                    }
                }
            }
        }
    }

    /// Record a successful cloud exchange. In hybrid mode, a single success resets
    /// `fail_count` and returns to `probing`. No-op outside hybrid mode.
    pub fn record_success(&self) -> Option<ModeTransition> {
        if self.configured != ConfiguredMode::Hybrid {
            return None;
        }
        let mut hybrid = self.hybrid.lock().unwrap();
        let from = hybrid.sub_state;
        hybrid.fail_count = 0;
        hybrid.sub_state = HybridSubState::Probing;
        if from == HybridSubState::InOffline {
            log::info!("mode transition: in_offline -> probing (cloud recovered)");
            Some(ModeTransition {
                from,
                to: HybridSubState::Probing,
                fail_count: 0,
            })
        } else {
            None
        }
    }

    /// Record a failed cloud attempt. In hybrid mode, increments `fail_count` and
    /// transitions to `in_offline` once `fail_count >= fail_threshold`. No-op
    /// outside hybrid mode.
    pub fn record_failure(&self) -> Option<ModeTransition> {
        if self.configured != ConfiguredMode::Hybrid {
            return None;
        }
        let mut hybrid = self.hybrid.lock().unwrap();
        hybrid.fail_count = hybrid.fail_count.saturating_add(1);
        if hybrid.sub_state == HybridSubState::Probing && hybrid.fail_count >= self.fail_threshold
        {
            hybrid.sub_state = HybridSubState::InOffline;
            // The failing probe that triggered this transition is itself the
            // last probe: the retry window starts counting from here, not
            // from the next frame.
            hybrid.last_probe_at = Some(Instant::now());
            log::warn!(
                "mode transition: probing -> in_offline (fail_count={})",
                hybrid.fail_count
            );
            Some(ModeTransition {
                from: HybridSubState::Probing,
                to: HybridSubState::InOffline,
                fail_count: hybrid.fail_count,
            })
        } else {
            None
        }
    }

    #[cfg(test)]
    fn fail_count(&self) -> u32 {
        self.hybrid.lock().unwrap().fail_count
    }

    #[cfg(test)]
    fn sub_state(&self) -> HybridSubState {
        self.hybrid.lock().unwrap().sub_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hybrid(fail_threshold: u32, retry_interval: Duration) -> ModeController {
        ModeController::new(ConfiguredMode::Hybrid, fail_threshold, retry_interval)
    }

    #[test]
    fn online_always_attempts_cloud_and_never_transitions() {
        let mode = ModeController::new(ConfiguredMode::Online, 1, Duration::from_secs(60));
        assert_eq!(mode.decide(), Decision::AttemptCloud);
        assert!(mode.record_failure().is_none());
        assert_eq!(mode.decide(), Decision::AttemptCloud);
    }

    #[test]
    fn offline_never_attempts_cloud() {
        let mode = ModeController::new(ConfiguredMode::Offline, 1, Duration::from_secs(60));
        assert_eq!(mode.decide(), Decision::RespondLocally);
        assert_eq!(mode.decide(), Decision::RespondLocally);
    }

    #[test]
    fn hybrid_goes_offline_after_threshold_failures() {
        let mode = hybrid(1, Duration::from_secs(60));
        assert_eq!(mode.decide(), Decision::AttemptCloud);
        let transition = mode.record_failure().expect("threshold reached");
        assert_eq!(transition.to, HybridSubState::InOffline);
        assert_eq!(mode.sub_state(), HybridSubState::InOffline);
    }

    #[test]
    fn hybrid_short_circuits_within_retry_interval() {
        let mode = hybrid(1, Duration::from_secs(60));
        mode.record_failure();
        assert_eq!(mode.decide(), Decision::RespondLocally);
        assert_eq!(mode.decide(), Decision::RespondLocally);
    }

    #[test]
    fn hybrid_probes_again_after_retry_interval_elapses() {
        let mode = hybrid(1, Duration::from_millis(20));
        mode.record_failure();
        assert_eq!(mode.decide(), Decision::RespondLocally);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(mode.decide(), Decision::AttemptCloud);
    }

    #[test]
    fn hybrid_recovers_after_single_success() {
        let mode = hybrid(1, Duration::from_secs(60));
        mode.record_failure();
        assert_eq!(mode.sub_state(), HybridSubState::InOffline);
        let transition = mode.record_success().expect("recovered");
        assert_eq!(transition.to, HybridSubState::Probing);
        assert_eq!(mode.fail_count(), 0);
        assert_eq!(mode.decide(), Decision::AttemptCloud);
    }

    #[test]
    fn multiple_failures_below_threshold_stay_probing() {
        let mode = hybrid(3, Duration::from_secs(60));
        assert!(mode.record_failure().is_none());
        assert!(mode.record_failure().is_none());
        assert_eq!(mode.sub_state(), HybridSubState::Probing);
        assert!(mode.record_failure().is_some());
    }
}
