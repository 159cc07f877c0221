//! The provisioning state machine.

use std::fmt;

use provisio_state::RecordStatus;
use serde::{Deserialize, Serialize};

/// One step of the fixed create sequence. Transitions are strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Init,
    Reported,
    Created,
    AgentInstalled,
    HealthChecked,
    Done,
}

impl LifecyclePhase {
    pub const ALL: [LifecyclePhase; 6] = [
        LifecyclePhase::Init,
        LifecyclePhase::Reported,
        LifecyclePhase::Created,
        LifecyclePhase::AgentInstalled,
        LifecyclePhase::HealthChecked,
        LifecyclePhase::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Init => "init",
            LifecyclePhase::Reported => "reported",
            LifecyclePhase::Created => "created",
            LifecyclePhase::AgentInstalled => "agent_installed",
            LifecyclePhase::HealthChecked => "health_checked",
            LifecyclePhase::Done => "done",
        }
    }

    /// Record status once this phase has completed, for phases that have a
    /// persisted record.
    pub fn record_status(&self) -> Option<RecordStatus> {
        match self {
            LifecyclePhase::Init => None,
            LifecyclePhase::Reported => Some(RecordStatus::Reported),
            LifecyclePhase::Created => Some(RecordStatus::Created),
            LifecyclePhase::AgentInstalled => Some(RecordStatus::AgentInstalled),
            LifecyclePhase::HealthChecked => Some(RecordStatus::Healthy),
            LifecyclePhase::Done => Some(RecordStatus::Ready),
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_are_ordered() {
        let mut sorted = LifecyclePhase::ALL;
        sorted.sort();
        assert_eq!(sorted, LifecyclePhase::ALL);
        assert_eq!(LifecyclePhase::ALL[0], LifecyclePhase::Init);
        assert_eq!(LifecyclePhase::ALL[5], LifecyclePhase::Done);
    }

    #[test]
    fn test_done_means_ready() {
        assert_eq!(
            LifecyclePhase::Done.record_status(),
            Some(RecordStatus::Ready)
        );
        assert_eq!(LifecyclePhase::Init.record_status(), None);
    }
}
