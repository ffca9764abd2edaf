//! Provider registry: the authoritative list of providers and their
//! live health.
//!
//! The provider list is copy-on-write: readers take cheap snapshots,
//! health updates lock only the one provider they touch. Unhealthy
//! providers are re-probed on a fixed cadence until they recover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::HealthConfig;
use crate::domain::models::{
    EventPayload, HealthState, ProviderHealth, ProviderId, ProviderSpec,
};
use crate::domain::ports::{Clock, ProbeResult, Provider, SystemClock};
use crate::services::event_bus::EventBus;

/// Outcome of one provider invocation, as recorded by the processor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InvocationOutcome {
    Success { latency_ms: u32 },
    Failure,
}

/// One registered provider: static spec, live health, handle.
struct ProviderSlot {
    spec: ProviderSpec,
    handle: Arc<dyn Provider>,
    health: RwLock<ProviderHealth>,
    inflight: Arc<AtomicUsize>,
}

/// Read-only view of a provider used by the coordinator.
#[derive(Debug, Clone)]
pub struct ProviderSnapshot {
    pub spec: ProviderSpec,
    pub health_state: HealthState,
    pub consecutive_failures: u32,
    pub avg_latency_ms: Option<f64>,
    pub inflight: usize,
}

/// Decrements the in-flight counter when dropped.
pub struct InflightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of providers with health tracking.
pub struct ProviderRegistry {
    slots: RwLock<HashMap<ProviderId, Arc<ProviderSlot>>>,
    clock: Arc<dyn Clock>,
    event_bus: Option<Arc<EventBus>>,
    probing: Arc<AtomicBool>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            event_bus: None,
            probing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Install a provider. Re-registration is not supported; callers
    /// must deregister first.
    pub async fn register(
        &self,
        spec: ProviderSpec,
        handle: Arc<dyn Provider>,
    ) -> OrchestratorResult<()> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(&spec.id) {
            return Err(OrchestratorError::AlreadyExists(spec.id.to_string()));
        }

        let id = spec.id.clone();
        slots.insert(
            id.clone(),
            Arc::new(ProviderSlot {
                spec,
                handle,
                health: RwLock::new(ProviderHealth::default()),
                inflight: Arc::new(AtomicUsize::new(0)),
            }),
        );
        drop(slots);

        info!(provider_id = %id, "provider registered");
        if let Some(bus) = &self.event_bus {
            bus.publish(EventPayload::ProviderRegistered { provider_id: id });
        }
        Ok(())
    }

    /// Remove a provider. In-flight tasks on it are not cancelled, but
    /// no new selection targets it.
    pub async fn deregister(&self, id: &ProviderId) -> OrchestratorResult<()> {
        let mut slots = self.slots.write().await;
        if slots.remove(id).is_none() {
            return Err(OrchestratorError::Internal(format!(
                "deregister of unknown provider '{id}'"
            )));
        }
        drop(slots);

        info!(provider_id = %id, "provider deregistered");
        if let Some(bus) = &self.event_bus {
            bus.publish(EventPayload::ProviderDeregistered {
                provider_id: id.clone(),
            });
        }
        Ok(())
    }

    /// Snapshot of one provider.
    pub async fn get(&self, id: &ProviderId) -> Option<ProviderSnapshot> {
        let slots = self.slots.read().await;
        let slot = slots.get(id)?.clone();
        drop(slots);
        Some(Self::snapshot_of(&slot).await)
    }

    /// Snapshot of all providers. Never blocks on network.
    pub async fn list(&self) -> Vec<ProviderSnapshot> {
        let slots: Vec<Arc<ProviderSlot>> = {
            let guard = self.slots.read().await;
            guard.values().cloned().collect()
        };
        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in &slots {
            snapshots.push(Self::snapshot_of(slot).await);
        }
        snapshots.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        snapshots
    }

    async fn snapshot_of(slot: &ProviderSlot) -> ProviderSnapshot {
        let health = slot.health.read().await;
        ProviderSnapshot {
            spec: slot.spec.clone(),
            health_state: health.state,
            consecutive_failures: health.consecutive_failures,
            avg_latency_ms: health.avg_latency_ms(),
            inflight: slot.inflight.load(Ordering::SeqCst),
        }
    }

    /// Invocation handle for a provider, plus an in-flight guard.
    pub async fn checkout(
        &self,
        id: &ProviderId,
    ) -> Option<(Arc<dyn Provider>, InflightGuard)> {
        let slots = self.slots.read().await;
        let slot = slots.get(id)?;
        slot.inflight.fetch_add(1, Ordering::SeqCst);
        Some((
            slot.handle.clone(),
            InflightGuard {
                counter: slot.inflight.clone(),
            },
        ))
    }

    /// Record an invocation outcome; drives the health state machine.
    pub async fn observe(&self, id: &ProviderId, outcome: InvocationOutcome) {
        let slot = {
            let slots = self.slots.read().await;
            match slots.get(id) {
                Some(slot) => slot.clone(),
                None => {
                    // Outcome for a provider deregistered mid-flight.
                    debug!(provider_id = %id, "outcome for unknown provider dropped");
                    return;
                }
            }
        };

        let now = self.clock.now();
        let mut health = slot.health.write().await;
        let before = health.state;
        match outcome {
            InvocationOutcome::Success { latency_ms } => health.record_success(latency_ms, now),
            InvocationOutcome::Failure => health.record_failure(now),
        }
        let after = health.state;
        let failures = health.consecutive_failures;
        drop(health);

        if before != after {
            warn!(
                provider_id = %id,
                from = before.as_str(),
                to = after.as_str(),
                consecutive_failures = failures,
                "provider health changed"
            );
            if let Some(bus) = &self.event_bus {
                bus.publish(EventPayload::ProviderHealthChanged {
                    provider_id: id.clone(),
                    from: before,
                    to: after,
                    consecutive_failures: failures,
                });
            }
        }
    }

    /// On-demand health check through the provider handle.
    pub async fn probe(&self, id: &ProviderId) -> OrchestratorResult<ProbeResult> {
        let slot = {
            let slots = self.slots.read().await;
            slots
                .get(id)
                .cloned()
                .ok_or_else(|| OrchestratorError::Internal(format!("probe of unknown provider '{id}'")))?
        };

        // The probe itself runs without any registry lock held.
        let result = slot.handle.probe().await;
        let now = self.clock.now();

        let mut health = slot.health.write().await;
        let before = health.state;
        health.record_probe(result.healthy, result.latency_ms, now);
        let after = health.state;
        let failures = health.consecutive_failures;
        drop(health);

        if before != after {
            if let Some(bus) = &self.event_bus {
                bus.publish(EventPayload::ProviderHealthChanged {
                    provider_id: id.clone(),
                    from: before,
                    to: after,
                    consecutive_failures: failures,
                });
            }
        }
        Ok(result)
    }

    /// Start the background probe loop: every `probe_interval`,
    /// re-probe providers currently Unhealthy. Returns a JoinHandle;
    /// call [`stop_probing`](Self::stop_probing) to end the loop.
    pub fn spawn_probe_loop(self: &Arc<Self>, config: &HealthConfig) -> tokio::task::JoinHandle<()> {
        self.probing.store(true, Ordering::SeqCst);
        let registry = self.clone();
        let interval = std::time::Duration::from_millis(config.probe_interval_ms.max(1));

        tokio::spawn(async move {
            while registry.probing.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;

                let unhealthy: Vec<ProviderId> = registry
                    .list()
                    .await
                    .into_iter()
                    .filter(|s| s.health_state == HealthState::Unhealthy)
                    .map(|s| s.spec.id)
                    .collect();

                let probes = unhealthy.into_iter().map(|id| {
                    let registry = registry.clone();
                    async move {
                        if let Err(e) = registry.probe(&id).await {
                            debug!(provider_id = %id, error = %e, "probe failed");
                        }
                    }
                });
                futures::future::join_all(probes).await;
            }
        })
    }

    pub fn stop_probing(&self) {
        self.probing.store(false, Ordering::SeqCst);
    }

    /// Estimated cost of `task` for every registered provider.
    ///
    /// Estimation is a cheap synchronous call on the provider handle;
    /// no registry lock is held while estimating.
    pub async fn estimate_costs(
        &self,
        task: &crate::domain::models::Task,
    ) -> HashMap<ProviderId, crate::domain::ports::CostEstimate> {
        let slots: Vec<(ProviderId, Arc<ProviderSlot>)> = {
            let guard = self.slots.read().await;
            guard.iter().map(|(id, slot)| (id.clone(), slot.clone())).collect()
        };
        slots
            .into_iter()
            .map(|(id, slot)| {
                let estimate = slot.handle.estimate_cost(task);
                (id, estimate)
            })
            .collect()
    }

    /// Number of registered providers.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
