//! Load balancer: selects one instance from an eligible candidate set.
//!
//! Stateless except for strategy cursors: a per-virtual-model round-robin
//! index and the smooth weighted round-robin current-weight table. Candidates
//! arrive pre-filtered for eligibility; strategies still re-check so a stale
//! snapshot cannot hand out a saturated or disabled instance.

use crate::config::StrategyKind;
use crate::instance::PipelineInstance;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Selector over eligible candidates. One per scheduler.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: StrategyKind,
    /// Per-virtual-model round-robin cursor.
    rr_cursors: Mutex<HashMap<String, usize>>,
    /// Per-virtual-model smooth-WRR current weights, keyed by instance id.
    wrr_weights: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl LoadBalancer {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            rr_cursors: Mutex::new(HashMap::new()),
            wrr_weights: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// Pick one instance, or `None` when no candidate is selectable (the
    /// scheduler translates that to 3001 NO_AVAILABLE_PIPELINES).
    pub fn select(
        &self,
        virtual_model: &str,
        candidates: &[Arc<PipelineInstance>],
    ) -> Option<Arc<PipelineInstance>> {
        if candidates.is_empty() {
            return None;
        }
        let selected = match self.strategy {
            StrategyKind::RoundRobin => self.select_round_robin(virtual_model, candidates),
            StrategyKind::WeightedRoundRobin => self.select_weighted(virtual_model, candidates),
            StrategyKind::LeastConnections => Self::select_least_connections(candidates),
            StrategyKind::Random => Self::select_random(candidates),
        };
        if let Some(ref instance) = selected {
            tracing::debug!(
                virtual_model,
                instance = instance.id(),
                strategy = ?self.strategy,
                "selected pipeline instance"
            );
        }
        selected
    }

    fn select_round_robin(
        &self,
        virtual_model: &str,
        candidates: &[Arc<PipelineInstance>],
    ) -> Option<Arc<PipelineInstance>> {
        let mut cursors = self.rr_cursors.lock();
        let cursor = cursors.entry(virtual_model.to_string()).or_insert(0);

        // Advance at most N times skipping candidates that went ineligible
        // after the snapshot.
        for _ in 0..candidates.len() {
            let index = *cursor % candidates.len();
            *cursor = cursor.wrapping_add(1);
            let candidate = &candidates[index];
            if candidate.is_eligible() {
                return Some(Arc::clone(candidate));
            }
        }
        None
    }

    fn select_weighted(
        &self,
        virtual_model: &str,
        candidates: &[Arc<PipelineInstance>],
    ) -> Option<Arc<PipelineInstance>> {
        let eligible: Vec<&Arc<PipelineInstance>> =
            candidates.iter().filter(|c| c.is_eligible()).collect();
        if eligible.is_empty() {
            return None;
        }

        let mut all_weights = self.wrr_weights.lock();
        let weights = all_weights
            .entry(virtual_model.to_string())
            .or_insert_with(HashMap::new);
        // Drop state for instances that left the candidate set.
        weights.retain(|id, _| eligible.iter().any(|c| c.id() == id));

        let total: i64 = eligible.iter().map(|c| i64::from(c.weight())).sum();

        // Smooth WRR: bump every current weight by its static weight, pick
        // the max, then charge the winner the total.
        let mut best: Option<&Arc<PipelineInstance>> = None;
        let mut best_weight = i64::MIN;
        for candidate in &eligible {
            let current = weights.entry(candidate.id().to_string()).or_insert(0);
            *current += i64::from(candidate.weight());
            if *current > best_weight {
                best_weight = *current;
                best = Some(*candidate);
            }
        }

        let winner = best?;
        if let Some(current) = weights.get_mut(winner.id()) {
            *current -= total;
        }
        Some(Arc::clone(winner))
    }

    fn select_least_connections(
        candidates: &[Arc<PipelineInstance>],
    ) -> Option<Arc<PipelineInstance>> {
        candidates
            .iter()
            .filter(|c| c.is_eligible())
            .min_by(|a, b| {
                a.metrics()
                    .active_requests()
                    .cmp(&b.metrics().active_requests())
                    .then_with(|| {
                        a.metrics()
                            .average_response_time()
                            .cmp(&b.metrics().average_response_time())
                    })
                    .then_with(|| a.id().cmp(b.id()))
            })
            .map(Arc::clone)
    }

    fn select_random(candidates: &[Arc<PipelineInstance>]) -> Option<Arc<PipelineInstance>> {
        let eligible: Vec<&Arc<PipelineInstance>> =
            candidates.iter().filter(|c| c.is_eligible()).collect();
        if eligible.is_empty() {
            return None;
        }
        Some(Arc::clone(eligible[fastrand::usize(..eligible.len())]))
    }

    /// Forget cursor state for a virtual model (pool destroyed).
    pub fn forget(&self, virtual_model: &str) {
        self.rr_cursors.lock().remove(virtual_model);
        self.wrr_weights.lock().remove(virtual_model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Target;
    use crate::stages::{MockOutcome, MockProviderStage};
    use serde_json::json;

    async fn instance(id: &str, weight: u32) -> Arc<PipelineInstance> {
        let inst = Arc::new(PipelineInstance::new(
            id,
            "vm",
            Target {
                provider_id: "p".into(),
                model_id: "m".into(),
                credential_index: 0,
            },
            vec![std::sync::Arc::new(MockProviderStage::new(
                "mock",
                vec![MockOutcome::reply(json!({}))],
            ))],
            weight,
            8,
        ));
        inst.initialize().await.unwrap();
        inst
    }

    #[tokio::test]
    async fn test_round_robin_cycles_in_order() {
        let balancer = LoadBalancer::new(StrategyKind::RoundRobin);
        let a = instance("a", 1).await;
        let b = instance("b", 1).await;
        let candidates = vec![a, b];

        let picks: Vec<String> = (0..4)
            .map(|_| balancer.select("vm", &candidates).unwrap().id().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_round_robin_skips_ineligible() {
        let balancer = LoadBalancer::new(StrategyKind::RoundRobin);
        let a = instance("a", 1).await;
        let b = instance("b", 1).await;
        b.set_enabled(false);
        let candidates = vec![a, b];

        for _ in 0..3 {
            assert_eq!(balancer.select("vm", &candidates).unwrap().id(), "a");
        }
    }

    #[tokio::test]
    async fn test_round_robin_cursors_are_per_virtual_model() {
        let balancer = LoadBalancer::new(StrategyKind::RoundRobin);
        let a = instance("a", 1).await;
        let b = instance("b", 1).await;
        let candidates = vec![a, b];

        assert_eq!(balancer.select("vm1", &candidates).unwrap().id(), "a");
        // A fresh cursor for vm2 starts at the beginning again.
        assert_eq!(balancer.select("vm2", &candidates).unwrap().id(), "a");
        assert_eq!(balancer.select("vm1", &candidates).unwrap().id(), "b");
    }

    #[tokio::test]
    async fn test_weighted_distribution_is_exact_over_window() {
        let balancer = LoadBalancer::new(StrategyKind::WeightedRoundRobin);
        let a = instance("a", 2).await;
        let b = instance("b", 1).await;
        let candidates = vec![a, b];

        // Over N * sum(weights) selections each candidate wins exactly
        // N * weight times.
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            let picked = balancer.select("vm", &candidates).unwrap();
            *counts.entry(picked.id().to_string()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 6);
        assert_eq!(counts["b"], 3);
    }

    #[tokio::test]
    async fn test_weighted_smooth_interleaving() {
        let balancer = LoadBalancer::new(StrategyKind::WeightedRoundRobin);
        let a = instance("a", 2).await;
        let b = instance("b", 1).await;
        let candidates = vec![a, b];

        let picks: Vec<String> = (0..3)
            .map(|_| balancer.select("vm", &candidates).unwrap().id().to_string())
            .collect();
        // Smooth WRR spreads the heavier instance instead of bursting it.
        assert_eq!(picks, ["a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_least_connections_prefers_idle() {
        let balancer = LoadBalancer::new(StrategyKind::LeastConnections);
        let a = instance("a", 1).await;
        let b = instance("b", 1).await;
        a.metrics().begin_request();
        let candidates = vec![a.clone(), b];

        assert_eq!(balancer.select("vm", &candidates).unwrap().id(), "b");
        a.metrics().end_request();
    }

    #[tokio::test]
    async fn test_least_connections_tie_breaks_lexicographically() {
        let balancer = LoadBalancer::new(StrategyKind::LeastConnections);
        let b = instance("b", 1).await;
        let a = instance("a", 1).await;
        let candidates = vec![b, a];
        // Equal active counts and response times: smallest id wins.
        assert_eq!(balancer.select("vm", &candidates).unwrap().id(), "a");
    }

    #[tokio::test]
    async fn test_random_only_selects_eligible() {
        let balancer = LoadBalancer::new(StrategyKind::Random);
        let a = instance("a", 1).await;
        let b = instance("b", 1).await;
        b.set_enabled(false);
        let candidates = vec![a, b];

        for _ in 0..20 {
            assert_eq!(balancer.select("vm", &candidates).unwrap().id(), "a");
        }
    }

    #[tokio::test]
    async fn test_empty_and_fully_ineligible_sets_yield_none() {
        let balancer = LoadBalancer::new(StrategyKind::RoundRobin);
        assert!(balancer.select("vm", &[]).is_none());

        let a = instance("a", 1).await;
        a.set_enabled(false);
        assert!(balancer.select("vm", &[a]).is_none());
    }
}
