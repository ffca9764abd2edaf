//! Provider coordinator: given a task, pick a provider now, or fail.
//!
//! Selection is deterministic given its inputs and performs no
//! network I/O: it filters registry snapshots by capability, health,
//! and quota headroom, applies workflow affinity, then the configured
//! strategy. Cost: O(providers).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::LoadBalancingStrategy;
use crate::domain::models::{HealthState, ProviderId, Task};
use crate::services::quota::QuotaLedger;
use crate::services::registry::ProviderSnapshot;

/// Stateless selection logic plus the round-robin rotation index.
pub struct ProviderCoordinator {
    strategy: LoadBalancingStrategy,
    ledger: Arc<QuotaLedger>,
    rotation: AtomicUsize,
}

impl ProviderCoordinator {
    pub fn new(strategy: LoadBalancingStrategy, ledger: Arc<QuotaLedger>) -> Self {
        Self {
            strategy,
            ledger,
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Select a provider for `task` from the given registry snapshots.
    ///
    /// `costs` carries the per-provider estimated cost of this task;
    /// providers missing from the map default to 1 unit. `affinity` is
    /// the provider that last succeeded for the task's workflow run,
    /// if any.
    ///
    /// Fails with `CapabilityMismatch` when no registered provider can
    /// ever serve the kind, and with `NoProviderAvailable` when
    /// capable providers exist but none survive health and quota
    /// filtering right now.
    pub async fn select(
        &self,
        task: &Task,
        snapshots: &[ProviderSnapshot],
        costs: &HashMap<ProviderId, u64>,
        affinity: Option<&ProviderId>,
    ) -> OrchestratorResult<ProviderId> {
        // 1. Capability filter.
        let capable: Vec<&ProviderSnapshot> = snapshots
            .iter()
            .filter(|s| s.spec.capabilities.supports(&task.kind, &task.required_flags))
            .collect();

        if capable.is_empty() {
            return Err(OrchestratorError::CapabilityMismatch {
                kind: task.kind.to_string(),
            });
        }

        // 2. Health filter, then the task's own provider blacklist.
        // The blacklist steers retries toward alternates; when no
        // alternate survives it yields, so a task is never starved by
        // its only capable provider having failed it before.
        let healthy_all: Vec<&ProviderSnapshot> = capable
            .into_iter()
            .filter(|s| s.health_state != HealthState::Unhealthy)
            .collect();
        let non_excluded: Vec<&ProviderSnapshot> = healthy_all
            .iter()
            .copied()
            .filter(|s| !task.excluded_providers.contains(&s.spec.id))
            .collect();
        let healthy = if non_excluded.is_empty() {
            healthy_all
        } else {
            non_excluded
        };

        // 3. Quota filter.
        let mut survivors: Vec<&ProviderSnapshot> = Vec::with_capacity(healthy.len());
        for snapshot in healthy {
            let cost = costs.get(&snapshot.spec.id).copied().unwrap_or(1);
            if self.ledger.can_reserve(&snapshot.spec.id, cost).await {
                survivors.push(snapshot);
            }
        }

        if survivors.is_empty() {
            return Err(OrchestratorError::NoProviderAvailable { task_id: task.id });
        }

        // 4. Affinity bias: stick with the run's previous provider when
        // it survived the filters.
        if let Some(preferred) = affinity {
            if let Some(snapshot) = survivors.iter().find(|s| s.spec.id == *preferred) {
                trace!(task_id = %task.id, provider_id = %preferred, "affinity selection");
                return Ok(snapshot.spec.id.clone());
            }
        }

        // 5. Strategy.
        let chosen = match self.strategy {
            LoadBalancingStrategy::RoundRobin => self.pick_round_robin(&survivors),
            LoadBalancingStrategy::LeastLoaded => Self::pick_least_loaded(&survivors),
            LoadBalancingStrategy::FastestResponse => Self::pick_fastest(&survivors),
            LoadBalancingStrategy::PriorityBased => Self::pick_priority(&survivors),
            LoadBalancingStrategy::CapabilityBased => Self::pick_capability(&survivors, task),
        };

        trace!(
            task_id = %task.id,
            provider_id = %chosen,
            strategy = self.strategy.as_str(),
            "provider selected"
        );
        Ok(chosen)
    }

    /// Next provider in the rotating index; the candidate order is
    /// fixed by provider id so ties always resolve the same way.
    fn pick_round_robin(&self, survivors: &[&ProviderSnapshot]) -> ProviderId {
        let mut ordered: Vec<&ProviderSnapshot> = survivors.to_vec();
        ordered.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        let index = self.rotation.fetch_add(1, Ordering::SeqCst) % ordered.len();
        ordered[index].spec.id.clone()
    }

    /// Minimum in-flight count, weighted by health (a Degraded
    /// provider counts its load double). Ties break on the lowest
    /// priority number, then id.
    fn pick_least_loaded(survivors: &[&ProviderSnapshot]) -> ProviderId {
        survivors
            .iter()
            .min_by(|a, b| {
                effective_load(a)
                    .total_cmp(&effective_load(b))
                    .then_with(|| a.spec.priority.cmp(&b.spec.priority))
                    .then_with(|| a.spec.id.cmp(&b.spec.id))
            })
            .expect("survivors is non-empty")
            .spec
            .id
            .clone()
    }

    /// Minimum average latency over the trailing outcome window,
    /// health-weighted; unsampled providers sort last. Ties fall back
    /// to least-loaded.
    fn pick_fastest(survivors: &[&ProviderSnapshot]) -> ProviderId {
        survivors
            .iter()
            .min_by(|a, b| {
                effective_latency(a)
                    .total_cmp(&effective_latency(b))
                    .then_with(|| effective_load(a).total_cmp(&effective_load(b)))
                    .then_with(|| a.spec.priority.cmp(&b.spec.priority))
                    .then_with(|| a.spec.id.cmp(&b.spec.id))
            })
            .expect("survivors is non-empty")
            .spec
            .id
            .clone()
    }

    /// Minimum `priority` value; ties fall back to least-loaded.
    fn pick_priority(survivors: &[&ProviderSnapshot]) -> ProviderId {
        survivors
            .iter()
            .min_by(|a, b| {
                a.spec
                    .priority
                    .cmp(&b.spec.priority)
                    .then_with(|| effective_load(a).total_cmp(&effective_load(b)))
                    .then_with(|| a.spec.id.cmp(&b.spec.id))
            })
            .expect("survivors is non-empty")
            .spec
            .id
            .clone()
    }

    /// Maximum count of declared capability flags beyond the task's
    /// requirement; ties fall back to priority-based.
    fn pick_capability(survivors: &[&ProviderSnapshot], task: &Task) -> ProviderId {
        let required = task.required_flags.count();
        survivors
            .iter()
            .min_by(|a, b| {
                let surplus_a = a.spec.capabilities.flags.count().saturating_sub(required);
                let surplus_b = b.spec.capabilities.flags.count().saturating_sub(required);
                surplus_b
                    .cmp(&surplus_a)
                    .then_with(|| a.spec.priority.cmp(&b.spec.priority))
                    .then_with(|| effective_load(a).total_cmp(&effective_load(b)))
                    .then_with(|| a.spec.id.cmp(&b.spec.id))
            })
            .expect("survivors is non-empty")
            .spec
            .id
            .clone()
    }
}

/// In-flight count scaled by the inverse health weight.
fn effective_load(snapshot: &ProviderSnapshot) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let load = snapshot.inflight as f64;
    load / snapshot.health_state.selection_weight().max(f64::EPSILON)
}

/// Average latency scaled by the inverse health weight; unsampled
/// providers rank last.
fn effective_latency(snapshot: &ProviderSnapshot) -> f64 {
    match snapshot.avg_latency_ms {
        Some(latency) => latency / snapshot.health_state.selection_weight().max(f64::EPSILON),
        None => f64::INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::QuotaConfig;
    use crate::domain::models::{
        Capabilities, CapabilityFlags, ProviderSpec, SubKeyLimit, TaskPayload,
    };

    fn snapshot(id: &str, kinds: &[&str]) -> ProviderSnapshot {
        ProviderSnapshot {
            spec: ProviderSpec::new(id, "mock", Capabilities::for_kinds(kinds.iter().copied())),
            health_state: HealthState::Healthy,
            consecutive_failures: 0,
            avg_latency_ms: None,
            inflight: 0,
        }
    }

    fn task() -> Task {
        Task::new("code-review", TaskPayload::default())
    }

    fn coordinator(strategy: LoadBalancingStrategy) -> ProviderCoordinator {
        ProviderCoordinator::new(strategy, Arc::new(QuotaLedger::new(&QuotaConfig::default())))
    }

    #[tokio::test]
    async fn test_capability_mismatch_when_no_kind_matches() {
        let coordinator = coordinator(LoadBalancingStrategy::RoundRobin);
        let snapshots = vec![snapshot("p1", &["bug-fix"])];
        let err = coordinator
            .select(&task(), &snapshots, &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::CapabilityMismatch { .. }));
    }

    #[tokio::test]
    async fn test_unhealthy_providers_are_skipped() {
        let coordinator = coordinator(LoadBalancingStrategy::RoundRobin);
        let mut bad = snapshot("p1", &["code-review"]);
        bad.health_state = HealthState::Unhealthy;
        let good = snapshot("p2", &["code-review"]);

        let chosen = coordinator
            .select(&task(), &[bad.clone(), good], &HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(chosen, ProviderId::new("p2"));

        // Only the unhealthy one left: capable but unavailable.
        let err = coordinator
            .select(&task(), &[bad], &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoProviderAvailable { .. }));
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let coordinator = coordinator(LoadBalancingStrategy::RoundRobin);
        let snapshots = vec![snapshot("pa", &["code-review"]), snapshot("pb", &["code-review"])];

        let first = coordinator
            .select(&task(), &snapshots, &HashMap::new(), None)
            .await
            .unwrap();
        let second = coordinator
            .select(&task(), &snapshots, &HashMap::new(), None)
            .await
            .unwrap();
        let third = coordinator
            .select(&task(), &snapshots, &HashMap::new(), None)
            .await
            .unwrap();

        assert_eq!(first, ProviderId::new("pa"));
        assert_eq!(second, ProviderId::new("pb"));
        assert_eq!(third, ProviderId::new("pa"));
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_idle() {
        let coordinator = coordinator(LoadBalancingStrategy::LeastLoaded);
        let mut busy = snapshot("pa", &["code-review"]);
        busy.inflight = 5;
        let idle = snapshot("pb", &["code-review"]);

        let chosen = coordinator
            .select(&task(), &[busy, idle], &HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(chosen, ProviderId::new("pb"));
    }

    #[tokio::test]
    async fn test_degraded_counts_load_double() {
        let coordinator = coordinator(LoadBalancingStrategy::LeastLoaded);
        let mut degraded = snapshot("pa", &["code-review"]);
        degraded.health_state = HealthState::Degraded;
        degraded.inflight = 2; // effective 4
        let mut healthy = snapshot("pb", &["code-review"]);
        healthy.inflight = 3; // effective 3

        let chosen = coordinator
            .select(&task(), &[degraded, healthy], &HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(chosen, ProviderId::new("pb"));
    }

    #[tokio::test]
    async fn test_fastest_response_prefers_sampled_low_latency() {
        let coordinator = coordinator(LoadBalancingStrategy::FastestResponse);
        let mut slow = snapshot("pa", &["code-review"]);
        slow.avg_latency_ms = Some(800.0);
        let mut fast = snapshot("pb", &["code-review"]);
        fast.avg_latency_ms = Some(90.0);
        let unsampled = snapshot("pc", &["code-review"]);

        let chosen = coordinator
            .select(&task(), &[slow, fast, unsampled], &HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(chosen, ProviderId::new("pb"));
    }

    #[tokio::test]
    async fn test_priority_based_prefers_lowest_number() {
        let coordinator = coordinator(LoadBalancingStrategy::PriorityBased);
        let mut second = snapshot("pa", &["code-review"]);
        second.spec.priority = 10;
        let mut first = snapshot("pb", &["code-review"]);
        first.spec.priority = 1;

        let chosen = coordinator
            .select(&task(), &[second, first], &HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(chosen, ProviderId::new("pb"));
    }

    #[tokio::test]
    async fn test_capability_based_prefers_surplus_flags() {
        let coordinator = coordinator(LoadBalancingStrategy::CapabilityBased);
        let plain = snapshot("pa", &["code-review"]);
        let mut rich = snapshot("pb", &["code-review"]);
        rich.spec.capabilities.flags = CapabilityFlags {
            streaming: true,
            batching: true,
        };

        let chosen = coordinator
            .select(&task(), &[plain, rich], &HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(chosen, ProviderId::new("pb"));
    }

    #[tokio::test]
    async fn test_quota_filter_drops_exhausted_provider() {
        let ledger = Arc::new(QuotaLedger::new(&QuotaConfig::default()));
        ledger
            .configure(ProviderId::new("pa"), vec![SubKeyLimit::new("main", 1, 3600)])
            .await;
        let held = ledger
            .try_reserve(&ProviderId::new("pa"), None, 1)
            .await
            .unwrap();
        ledger.commit(&held).await;

        let coordinator = ProviderCoordinator::new(LoadBalancingStrategy::RoundRobin, ledger);
        let snapshots = vec![snapshot("pa", &["code-review"]), snapshot("pb", &["code-review"])];

        // pa is exhausted; pb must be chosen every time.
        for _ in 0..3 {
            let chosen = coordinator
                .select(&task(), &snapshots, &HashMap::new(), None)
                .await
                .unwrap();
            assert_eq!(chosen, ProviderId::new("pb"));
        }
    }

    #[tokio::test]
    async fn test_affinity_short_circuits_strategy() {
        let coordinator = coordinator(LoadBalancingStrategy::PriorityBased);
        let mut preferred = snapshot("pa", &["code-review"]);
        preferred.spec.priority = 100;
        let mut other = snapshot("pb", &["code-review"]);
        other.spec.priority = 1;

        let affinity = ProviderId::new("pa");
        let chosen = coordinator
            .select(&task(), &[preferred, other], &HashMap::new(), Some(&affinity))
            .await
            .unwrap();
        assert_eq!(chosen, ProviderId::new("pa"));
    }

    #[tokio::test]
    async fn test_blacklisted_provider_is_skipped() {
        let coordinator = coordinator(LoadBalancingStrategy::RoundRobin);
        let mut t = task();
        t.excluded_providers.insert(ProviderId::new("pa"));

        let snapshots = vec![snapshot("pa", &["code-review"]), snapshot("pb", &["code-review"])];
        for _ in 0..3 {
            let chosen = coordinator
                .select(&t, &snapshots, &HashMap::new(), None)
                .await
                .unwrap();
            assert_eq!(chosen, ProviderId::new("pb"));
        }
    }

    #[tokio::test]
    async fn test_blacklist_yields_when_no_alternative() {
        let coordinator = coordinator(LoadBalancingStrategy::RoundRobin);
        let mut t = task();
        t.excluded_providers.insert(ProviderId::new("pa"));

        // The blacklisted provider is the only capable one: it is
        // still selected rather than starving the task.
        let snapshots = vec![snapshot("pa", &["code-review"])];
        let chosen = coordinator
            .select(&t, &snapshots, &HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(chosen, ProviderId::new("pa"));
    }
}
