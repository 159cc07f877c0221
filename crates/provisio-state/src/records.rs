//! Persisted record shapes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a driver provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverCategory {
    Machine,
    Chain,
}

impl DriverCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverCategory::Machine => "machine",
            DriverCategory::Chain => "chain",
        }
    }
}

impl fmt::Display for DriverCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "machine" => Ok(DriverCategory::Machine),
            "chain" => Ok(DriverCategory::Chain),
            other => Err(format!("unknown driver category: {other}")),
        }
    }
}

/// A registered driver plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub category: DriverCategory,
    pub created_at: DateTime<Utc>,
}

/// Provisioning progress of a machine or chain.
///
/// A record moves forward only; `Failed` is terminal and names the phase
/// that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordStatus {
    Reported,
    Created,
    AgentInstalled,
    Healthy,
    Ready,
    Failed { phase: String, reason: String },
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Ready | RecordStatus::Failed { .. })
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Reported => f.write_str("reported"),
            RecordStatus::Created => f.write_str("created"),
            RecordStatus::AgentInstalled => f.write_str("agent_installed"),
            RecordStatus::Healthy => f.write_str("healthy"),
            RecordStatus::Ready => f.write_str("ready"),
            RecordStatus::Failed { phase, .. } => write!(f, "failed at {phase}"),
        }
    }
}

/// Fields a driver reports for a new machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMachine {
    pub driver_id: i64,
    pub name: String,
    pub host: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: i64,
    pub driver_id: i64,
    pub name: String,
    pub host: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a driver reports for a new chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChain {
    pub driver_id: i64,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub id: i64,
    pub driver_id: i64,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_status_serializes_with_phase() {
        let status = RecordStatus::Failed {
            phase: "agent_installed".to_string(),
            reason: "ssh refused".to_string(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["phase"], "agent_installed");
        assert!(status.is_terminal());
        assert!(!RecordStatus::Created.is_terminal());
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(
            "CHAIN".parse::<DriverCategory>().unwrap(),
            DriverCategory::Chain
        );
        assert!("router".parse::<DriverCategory>().is_err());
    }
}
