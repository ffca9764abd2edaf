//! Top-level facade: wires the core services from a `Config` and
//! exposes the consumer-facing surface (task submission, workflow
//! definition and runs, scheduling, event subscription).
//!
//! The HTTP/WebSocket layer, persistence drivers, and real provider
//! transports sit outside this crate and talk to this type.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::domain::errors::OrchestratorResult;
use crate::domain::models::{
    Config, OrchestratorEvent, ProviderId, ProviderSpec, SubKeyLimit, Task, TaskKindRegistry,
    TaskStatus, Workflow, WorkflowRun,
};
use crate::domain::ports::{Provider, TaskStore, WorkflowStore};
use crate::infrastructure::store::{MemoryTaskStore, MemoryWorkflowStore};
use crate::services::coordinator::ProviderCoordinator;
use crate::services::dedup_cache::DedupCache;
use crate::services::event_bus::{EventBus, EventFilter, FilteredReceiver};
use crate::services::processor::{ProcessorConfig, ProcessorStats, TaskProcessor};
use crate::services::quota::QuotaLedger;
use crate::services::registry::{ProviderRegistry, ProviderSnapshot};
use crate::services::scheduler::WorkflowScheduler;
use crate::services::workflow_engine::WorkflowEngine;

/// The assembled orchestration engine.
pub struct Orchestrator {
    config: Config,
    event_bus: Arc<EventBus>,
    registry: Arc<ProviderRegistry>,
    ledger: Arc<QuotaLedger>,
    processor: Arc<TaskProcessor>,
    engine: Arc<WorkflowEngine>,
    scheduler: Arc<WorkflowScheduler>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    /// Assemble the engine with in-memory stores.
    pub fn new(config: Config, kinds: TaskKindRegistry) -> Self {
        Self::with_stores(
            config,
            kinds,
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MemoryWorkflowStore::new()),
        )
    }

    /// Assemble the engine over caller-provided store implementations.
    pub fn with_stores(
        config: Config,
        kinds: TaskKindRegistry,
        task_store: Arc<dyn TaskStore>,
        workflow_store: Arc<dyn WorkflowStore>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(&config.events));
        let registry = Arc::new(ProviderRegistry::new().with_event_bus(event_bus.clone()));
        let ledger = Arc::new(QuotaLedger::new(&config.quota));
        let cache = Arc::new(DedupCache::new(&config.dedup));
        let coordinator = Arc::new(ProviderCoordinator::new(
            config.load_balancing_strategy,
            ledger.clone(),
        ));

        let processor = Arc::new(TaskProcessor::new(
            task_store,
            registry.clone(),
            coordinator,
            ledger.clone(),
            cache,
            event_bus.clone(),
            kinds,
            ProcessorConfig::from_config(&config),
        ));

        let engine = Arc::new(WorkflowEngine::new(
            workflow_store,
            processor.clone(),
            event_bus.clone(),
        ));

        let scheduler = Arc::new(WorkflowScheduler::new(
            engine.clone(),
            event_bus.clone(),
            config.scheduler.clone(),
        ));

        Self {
            config,
            event_bus,
            registry,
            ledger,
            processor,
            engine,
            scheduler,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Start workers, the probe loop, the reservation sweeper, and the
    /// scheduler ticker.
    pub async fn start(&self) {
        self.processor.start().await;
        let mut background = self.background.lock().await;
        background.push(self.registry.spawn_probe_loop(&self.config.health));
        background.push(self.ledger.spawn_sweeper());
        background.push(self.scheduler.start());
        info!("orchestrator started");
    }

    /// Stop accepting work and drain the background loops.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.registry.stop_probing();
        self.processor.shutdown().await;
        let mut background = self.background.lock().await;
        for handle in background.drain(..) {
            handle.abort();
        }
        info!("orchestrator stopped");
    }

    // -- provider management --

    /// Register a provider, optionally with per-sub-key quota limits.
    pub async fn register_provider(
        &self,
        spec: ProviderSpec,
        handle: Arc<dyn Provider>,
        limits: Vec<SubKeyLimit>,
    ) -> OrchestratorResult<()> {
        let id = spec.id.clone();
        self.registry.register(spec, handle).await?;
        if !limits.is_empty() {
            self.ledger.configure(id, limits).await;
        }
        Ok(())
    }

    pub async fn deregister_provider(&self, id: &ProviderId) -> OrchestratorResult<()> {
        self.registry.deregister(id).await?;
        self.ledger.remove(id).await;
        Ok(())
    }

    pub async fn list_providers(&self) -> Vec<ProviderSnapshot> {
        self.registry.list().await
    }

    pub async fn probe_provider(&self, id: &ProviderId) -> OrchestratorResult<()> {
        self.registry.probe(id).await.map(|_| ())
    }

    // -- task surface --

    pub async fn submit(&self, task: Task) -> OrchestratorResult<Uuid> {
        self.processor.submit(task).await
    }

    pub async fn get_task(&self, id: Uuid) -> OrchestratorResult<Task> {
        self.processor.get_task(id).await
    }

    pub async fn cancel_task(&self, id: Uuid) -> OrchestratorResult<()> {
        self.processor.cancel(id).await
    }

    pub async fn wait_task(
        &self,
        id: Uuid,
        timeout: std::time::Duration,
    ) -> OrchestratorResult<TaskStatus> {
        self.processor.wait_terminal(id, timeout).await
    }

    /// Subscribe to status events, optionally filtered.
    pub fn subscribe_events(&self, filter: EventFilter) -> FilteredReceiver {
        self.event_bus.subscribe_filtered(filter)
    }

    /// Raw (unfiltered) event stream.
    pub fn subscribe_all_events(
        &self,
    ) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.event_bus.subscribe()
    }

    // -- workflow surface --

    pub async fn define_workflow(&self, workflow: Workflow) -> OrchestratorResult<Uuid> {
        self.engine.define_workflow(workflow).await
    }

    pub async fn get_workflow(&self, id: Uuid) -> OrchestratorResult<Workflow> {
        self.engine.get_workflow(id).await
    }

    pub async fn run_workflow(
        &self,
        workflow_id: Uuid,
        inputs: serde_json::Value,
    ) -> OrchestratorResult<Uuid> {
        self.engine.run_workflow(workflow_id, inputs).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> OrchestratorResult<WorkflowRun> {
        self.engine.get_run(run_id).await
    }

    pub async fn cancel_run(&self, run_id: Uuid) -> OrchestratorResult<()> {
        self.engine.cancel_run(run_id).await
    }

    pub async fn schedule_workflow(
        &self,
        workflow_id: Uuid,
        cron: &str,
        timezone: &str,
    ) -> OrchestratorResult<()> {
        // The workflow must exist and compile before it gets a timer.
        let _ = self.engine.get_workflow(workflow_id).await?;
        self.scheduler.schedule(workflow_id, cron, timezone).await
    }

    pub async fn unschedule_workflow(&self, workflow_id: Uuid) -> bool {
        self.scheduler.unschedule(workflow_id).await
    }

    // -- introspection --

    pub async fn stats(&self) -> OrchestratorResult<ProcessorStats> {
        self.processor.stats().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Direct access for embedding scenarios and tests.
    pub fn processor(&self) -> Arc<TaskProcessor> {
        self.processor.clone()
    }

    pub fn scheduler(&self) -> Arc<WorkflowScheduler> {
        self.scheduler.clone()
    }

    pub fn quota_ledger(&self) -> Arc<QuotaLedger> {
        self.ledger.clone()
    }
}
