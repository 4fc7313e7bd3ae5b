//! Backlog and simulation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, OwnerId, SimulationId};

/// Lifecycle status of a simulation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    Pending,
    Processing,
    Processed,
    Error,
}

impl SimulationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationStatus::Pending => "PENDING",
            SimulationStatus::Processing => "PROCESSING",
            SimulationStatus::Processed => "PROCESSED",
            SimulationStatus::Error => "ERROR",
        }
    }
}

impl core::fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SimulationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "PROCESSED" => Ok(Self::Processed),
            "ERROR" => Ok(Self::Error),
            other => Err(DomainError::validation(format!(
                "unknown simulation status '{other}'"
            ))),
        }
    }
}

/// One automaton rule: when `condition` matches a cell's neighborhood, the cell becomes
/// `target_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub condition: String,
    #[serde(rename = "targetState", alias = "state")]
    pub target_state: u8,
}

impl Rule {
    pub fn new(condition: impl Into<String>, target_state: u8) -> Self {
        Self {
            condition: condition.into(),
            target_state,
        }
    }
}

/// Parse a rule set stored as a JSON array of `{condition, targetState}` objects.
pub fn parse_rule_set(text: &str) -> DomainResult<Vec<Rule>> {
    serde_json::from_str(text)
        .map_err(|e| DomainError::validation(format!("malformed rule set: {e}")))
}

/// Serialize a rule set into its stored JSON form.
pub fn encode_rule_set(rules: &[Rule]) -> DomainResult<String> {
    serde_json::to_string(rules)
        .map_err(|e| DomainError::validation(format!("unencodable rule set: {e}")))
}

/// Immutable simulation definition plus its mutable status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Simulation {
    pub id: SimulationId,
    pub owner: OwnerId,
    pub name: String,
    pub description: Option<String>,
    pub width: u32,
    pub height: u32,
    pub state_count: u16,
    pub rules: Vec<Rule>,
    pub status: SimulationStatus,
}

/// Definition of a simulation that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSimulation {
    pub owner: OwnerId,
    pub name: String,
    pub description: Option<String>,
    pub width: u32,
    pub height: u32,
    pub state_count: u16,
    pub rules: Vec<Rule>,
}

impl NewSimulation {
    /// Check dimensions, state count and rule targets.
    ///
    /// Cell states are stored as single bytes, so at most 256 states are representable.
    pub fn validate(&self) -> DomainResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(DomainError::validation("grid dimensions must be positive"));
        }
        if self.state_count == 0 || self.state_count > 256 {
            return Err(DomainError::validation("state count must be within 1..=256"));
        }
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| u16::from(r.target_state) >= self.state_count)
        {
            return Err(DomainError::validation(format!(
                "rule target state {} is outside 0..{}",
                rule.target_state, self.state_count
            )));
        }
        Ok(())
    }

    pub fn into_simulation(self, id: SimulationId) -> Simulation {
        Simulation {
            id,
            owner: self.owner,
            name: self.name,
            description: self.description,
            width: self.width,
            height: self.height,
            state_count: self.state_count,
            rules: self.rules,
            status: SimulationStatus::Pending,
        }
    }
}

/// A unit of backlog work driving one simulation to its target generation count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub simulation_id: SimulationId,
    pub target_generation_count: u64,
    pub last_activity: DateTime<Utc>,
}

/// One checkpointed grid snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub simulation_id: SimulationId,
    pub iteration: u64,
    pub content: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_simulation() -> NewSimulation {
        NewSimulation {
            owner: OwnerId::new(1),
            name: "glider".to_string(),
            description: None,
            width: 3,
            height: 3,
            state_count: 2,
            rules: vec![Rule::new("any-live-neighbor", 1)],
        }
    }

    #[test]
    fn rule_set_reads_both_field_spellings() {
        let rules =
            parse_rule_set(r#"[{"condition":"always","targetState":1},{"condition":"live == 3","state":0}]"#)
                .unwrap();
        assert_eq!(rules, vec![Rule::new("always", 1), Rule::new("live == 3", 0)]);

        let text = encode_rule_set(&rules).unwrap();
        assert!(text.contains("\"targetState\":1"));
    }

    #[test]
    fn malformed_rule_set_is_a_validation_error() {
        let err = parse_rule_set("{not json").unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("malformed rule set")));
    }

    #[test]
    fn validate_rejects_out_of_range_targets() {
        let mut sim = new_simulation();
        assert!(sim.validate().is_ok());

        sim.rules.push(Rule::new("always", 2));
        assert!(sim.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_grids() {
        let mut sim = new_simulation();
        sim.height = 0;
        assert!(sim.validate().is_err());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            SimulationStatus::Pending,
            SimulationStatus::Processing,
            SimulationStatus::Processed,
            SimulationStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<SimulationStatus>().unwrap(), status);
        }
    }
}
