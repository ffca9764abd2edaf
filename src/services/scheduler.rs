//! Workflow scheduler: cron-triggered run materialization.
//!
//! A single ticker evaluates upcoming fire times per schedule and
//! enqueues workflow runs through the engine. Missed fires (downtime)
//! follow the fire-once-on-catch-up policy: however many fires were
//! missed, at most one catch-up run is enqueued, and only when the
//! most recent missed fire is still inside the catch-up window.
//!
//! Fire instants are computed in the schedule's IANA timezone, so DST
//! gaps are skipped and ambiguous local times fire a single UTC
//! instant.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::SchedulerConfig;
use crate::domain::models::EventPayload;
use crate::domain::ports::{Clock, SystemClock};
use crate::services::event_bus::EventBus;
use crate::services::workflow_engine::WorkflowEngine;

/// One scheduled workflow.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub workflow_id: Uuid,
    pub cron: String,
    pub timezone: String,
    /// Upper bound of the last evaluated fire-time interval.
    pub last_evaluated: DateTime<Utc>,
    pub fire_count: u64,
    pub last_fired: Option<DateTime<Utc>>,
}

/// Cron scheduler over workflow definitions.
pub struct WorkflowScheduler {
    engine: Arc<WorkflowEngine>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    schedules: RwLock<Vec<ScheduleEntry>>,
    running: Arc<AtomicBool>,
}

impl WorkflowScheduler {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        event_bus: Arc<EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            event_bus,
            clock: Arc::new(SystemClock),
            config,
            schedules: RwLock::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a cron schedule for a workflow. The expression and
    /// timezone are validated here; a workflow can carry at most one
    /// schedule.
    pub async fn schedule(
        &self,
        workflow_id: Uuid,
        cron: &str,
        timezone: &str,
    ) -> OrchestratorResult<()> {
        let normalized = normalize_cron(cron);
        cron::Schedule::from_str(&normalized).map_err(|e| OrchestratorError::BadCondition {
            expression: cron.to_string(),
            reason: format!("invalid cron expression: {e}"),
        })?;
        Tz::from_str(timezone).map_err(|_| OrchestratorError::BadCondition {
            expression: timezone.to_string(),
            reason: "unknown IANA timezone".to_string(),
        })?;

        let mut schedules = self.schedules.write().await;
        if schedules.iter().any(|s| s.workflow_id == workflow_id) {
            return Err(OrchestratorError::AlreadyExists(format!(
                "schedule for workflow {workflow_id}"
            )));
        }
        schedules.push(ScheduleEntry {
            workflow_id,
            cron: normalized,
            timezone: timezone.to_string(),
            last_evaluated: self.clock.now(),
            fire_count: 0,
            last_fired: None,
        });
        info!(%workflow_id, cron, timezone, "workflow scheduled");
        Ok(())
    }

    /// Remove a workflow's schedule. Returns whether one existed.
    pub async fn unschedule(&self, workflow_id: Uuid) -> bool {
        let mut schedules = self.schedules.write().await;
        let before = schedules.len();
        schedules.retain(|s| s.workflow_id != workflow_id);
        let removed = schedules.len() < before;
        if removed {
            info!(%workflow_id, "workflow unscheduled");
        }
        removed
    }

    pub async fn list(&self) -> Vec<ScheduleEntry> {
        self.schedules.read().await.clone()
    }

    /// Evaluate all schedules against `now`, enqueueing runs for fires
    /// in the window since the last evaluation. Exposed for tests; the
    /// tick loop calls this on its cadence.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) {
        let catch_up_window = ChronoDuration::milliseconds(
            i64::try_from(self.config.catch_up_window_ms).unwrap_or(3_600_000),
        );

        // Collect decisions under the read lock, fire after releasing.
        let mut to_fire: Vec<(Uuid, DateTime<Utc>, bool)> = Vec::new();
        {
            let mut schedules = self.schedules.write().await;
            for entry in schedules.iter_mut() {
                let Some(fires) = fires_between(&entry.cron, &entry.timezone, entry.last_evaluated, now)
                else {
                    continue;
                };
                entry.last_evaluated = now;

                let Some(latest) = fires.last().copied() else { continue };
                let missed = fires.len() > 1;

                if now - latest > catch_up_window {
                    debug!(
                        workflow_id = %entry.workflow_id,
                        missed = fires.len(),
                        "missed fires outside catch-up window dropped"
                    );
                    continue;
                }

                entry.fire_count += 1;
                entry.last_fired = Some(latest);
                to_fire.push((entry.workflow_id, latest, missed));
            }
        }

        for (workflow_id, fire_time, catch_up) in to_fire {
            let inputs = serde_json::json!({ "scheduled_fire_time": fire_time.to_rfc3339() });
            match self.engine.run_workflow(workflow_id, inputs).await {
                Ok(run_id) => {
                    self.event_bus.publish(EventPayload::ScheduleFired {
                        workflow_id,
                        run_id,
                        fire_time,
                        catch_up,
                    });
                }
                Err(err) => {
                    warn!(%workflow_id, error = %err, "scheduled run failed to start");
                }
            }
        }
    }

    /// Start the ticker. Returns a JoinHandle; call
    /// [`stop`](Self::stop) to end the loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let scheduler = self.clone();
        let tick = std::time::Duration::from_millis(scheduler.config.tick_interval_ms.max(1));

        tokio::spawn(async move {
            while scheduler.running.load(Ordering::SeqCst) {
                tokio::time::sleep(tick).await;
                let now = scheduler.clock.now();
                scheduler.tick(now).await;
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Accept classic 5-field cron by prepending a seconds column.
fn normalize_cron(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Fire instants strictly after `from` and at or before `to`, computed
/// in the schedule's timezone. Returns `None` for unparseable entries
/// (validated at registration, so this only guards corruption).
fn fires_between(
    cron_expr: &str,
    timezone: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Option<Vec<DateTime<Utc>>> {
    let schedule = cron::Schedule::from_str(cron_expr).ok()?;
    let tz = Tz::from_str(timezone).ok()?;

    let mut fires = Vec::new();
    for instant in schedule.after(&from.with_timezone(&tz)) {
        let utc = instant.with_timezone(&Utc);
        if utc > to {
            break;
        }
        fires.push(utc);
        // Defensive bound; a sane schedule never fires this densely.
        if fires.len() > 10_000 {
            break;
        }
    }
    Some(fires)
}
