use caramba_db::models::groups::{NodeGroup, SelectionPolicy};
use caramba_db::models::node::Node;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use crate::error::{FleetError, FleetResult};

/// Picks a target node from a snapshot of candidates. Never mutates nodes;
/// the only state is the round-robin cursors and the random source.
///
/// Candidates are expected in ascending id order, which is how the registry
/// hands out group members. Round-robin position and weighted draws index
/// into that order.
pub struct LoadBalancer {
    cursors: Mutex<HashMap<i64, usize>>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl LoadBalancer {
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::with_rng(StdRng::seed_from_u64(seed)),
            None => Self::with_rng(StdRng::from_os_rng()),
        }
    }

    pub fn with_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            rng: Mutex::new(Box::new(rng)),
        }
    }

    pub fn select_node(
        &self,
        group: &NodeGroup,
        candidates: &[Node],
        exclude: &HashSet<i64>,
    ) -> FleetResult<Node> {
        let mut eligible: Vec<&Node> = candidates
            .iter()
            .filter(|n| n.is_selectable() && !exclude.contains(&n.id))
            .collect();
        if eligible.is_empty() {
            return Err(FleetError::CapacityExhausted {
                scope: format!("group {}", group.name),
            });
        }

        let picked = match group.policy {
            SelectionPolicy::RoundRobin => self.round_robin(group.id, &eligible),
            SelectionPolicy::LeastLoaded => least_loaded(&eligible),
            SelectionPolicy::WeightedRandom => self.weighted_random(&eligible),
            SelectionPolicy::BestLatency => best_latency(&eligible),
        };
        Ok(picked.clone())
    }

    fn round_robin<'a>(&self, group_id: i64, eligible: &[&'a Node]) -> &'a Node {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.entry(group_id).or_insert(0);
        let picked = eligible[*cursor % eligible.len()];
        *cursor = cursor.wrapping_add(1);
        picked
    }

    fn weighted_random<'a>(&self, eligible: &[&'a Node]) -> &'a Node {
        let total: u64 = eligible.iter().map(|n| u64::from(n.effective_weight())).sum();
        let mut draw = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            rng.random_range(0..total)
        };
        for node in eligible {
            let weight = u64::from(node.effective_weight());
            if draw < weight {
                return node;
            }
            draw -= weight;
        }
        eligible[eligible.len() - 1]
    }
}

fn least_loaded<'a>(eligible: &[&'a Node]) -> &'a Node {
    eligible
        .iter()
        .min_by_key(|n| (n.current_load, n.id))
        .copied()
        .unwrap_or(eligible[0])
}

fn best_latency<'a>(eligible: &[&'a Node]) -> &'a Node {
    eligible
        .iter()
        .min_by_key(|n| (n.last_latency_ms.unwrap_or(i32::MAX), n.current_load, n.id))
        .copied()
        .unwrap_or(eligible[0])
}
