//! ---
//! dbr_section: "01-core-functionality"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Shared primitives and utilities for the Data Broker."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle phase of one cluster instance.
///
/// The orchestrator is the only writer; tuple-space clients observe the phase
/// read-only to decide whether the backend is reachable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ClusterPhase {
    #[default]
    Allocating,
    Launching,
    Converging,
    Ready,
    Saving,
    Restoring,
    Stopping,
    Stopped,
    Failed,
}

impl ClusterPhase {
    /// Whether tuple-space traffic may be served in this phase.
    pub fn serves_clients(self) -> bool {
        matches!(self, ClusterPhase::Ready | ClusterPhase::Saving)
    }

    /// Whether the phase is terminal for the cluster instance.
    pub fn is_terminal(self) -> bool {
        matches!(self, ClusterPhase::Stopped)
    }

    /// Stable ordinal exported as a metric value.
    pub fn ordinal(self) -> i64 {
        match self {
            ClusterPhase::Allocating => 0,
            ClusterPhase::Launching => 1,
            ClusterPhase::Converging => 2,
            ClusterPhase::Ready => 3,
            ClusterPhase::Saving => 4,
            ClusterPhase::Restoring => 5,
            ClusterPhase::Stopping => 6,
            ClusterPhase::Stopped => 7,
            ClusterPhase::Failed => 8,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ClusterPhase) -> bool {
        use ClusterPhase::*;
        matches!(
            (self, next),
            (Allocating, Launching)
                | (Allocating, Converging)
                | (Launching, Converging)
                | (Converging, Ready)
                | (Ready, Saving)
                | (Saving, Ready)
                | (Ready, Restoring)
                | (Restoring, Ready)
                | (Launching, Failed)
                | (Converging, Failed)
                | (Restoring, Failed)
                | (Allocating, Stopping)
                | (Launching, Stopping)
                | (Converging, Stopping)
                | (Ready, Stopping)
                | (Failed, Stopping)
                | (Stopping, Stopped)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn lifecycle_path_is_permitted() {
        let path = [
            ClusterPhase::Allocating,
            ClusterPhase::Launching,
            ClusterPhase::Converging,
            ClusterPhase::Ready,
            ClusterPhase::Saving,
            ClusterPhase::Ready,
            ClusterPhase::Stopping,
            ClusterPhase::Stopped,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn stopped_is_absorbing() {
        for next in [
            ClusterPhase::Ready,
            ClusterPhase::Launching,
            ClusterPhase::Stopping,
        ] {
            assert!(!ClusterPhase::Stopped.can_transition_to(next));
        }
        assert!(!ClusterPhase::Failed.can_transition_to(ClusterPhase::Ready));
    }

    #[test]
    fn phase_names_round_trip_through_strings() {
        assert_eq!(ClusterPhase::Converging.to_string(), "converging");
        assert_eq!(ClusterPhase::from_str("saving").unwrap(), ClusterPhase::Saving);
    }
}
