use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    RoundRobin,
    #[default]
    LeastLoaded,
    WeightedRandom,
    BestLatency,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::RoundRobin => "round-robin",
            SelectionPolicy::LeastLoaded => "least-loaded",
            SelectionPolicy::WeightedRandom => "weighted-random",
            SelectionPolicy::BestLatency => "best-latency",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(SelectionPolicy::RoundRobin),
            "least-loaded" => Ok(SelectionPolicy::LeastLoaded),
            "weighted-random" => Ok(SelectionPolicy::WeightedRandom),
            "best-latency" => Ok(SelectionPolicy::BestLatency),
            _ => Err(ParseEnumError::new("selection policy", s)),
        }
    }
}

impl TryFrom<String> for SelectionPolicy {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Named set of nodes sharing a selection policy. Bounds failover search
/// to a region or tier.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeGroup {
    pub id: i64,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub policy: SelectionPolicy,
    #[sqlx(skip)]
    #[serde(default)]
    pub node_ids: Vec<i64>,
}

impl NodeGroup {
    pub fn contains(&self, node_id: i64) -> bool {
        self.node_ids.contains(&node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::SelectionPolicy;

    #[test]
    fn policy_accepts_snake_and_kebab_case() {
        assert_eq!(
            "weighted_random".parse::<SelectionPolicy>().unwrap(),
            SelectionPolicy::WeightedRandom
        );
        assert_eq!(
            "Best-Latency".parse::<SelectionPolicy>().unwrap(),
            SelectionPolicy::BestLatency
        );
        assert!("fastest".parse::<SelectionPolicy>().is_err());
    }
}
