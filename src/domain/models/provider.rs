//! Provider domain models.
//!
//! Providers are upstream AI services behind a uniform interface. Each
//! declares the task kinds it serves plus feature flags; live health is
//! tracked by the registry from recorded outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use super::task::TaskKind;

/// Identifier of a registered provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Feature flags a provider may declare (and a task may require).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityFlags {
    /// Streams partial output.
    #[serde(default)]
    pub streaming: bool,
    /// Accepts batched invocations.
    #[serde(default)]
    pub batching: bool,
}

impl CapabilityFlags {
    /// Whether these flags cover everything `required` asks for.
    pub fn covers(&self, required: &CapabilityFlags) -> bool {
        (!required.streaming || self.streaming) && (!required.batching || self.batching)
    }

    /// Number of flags set; used by capability-based selection to
    /// prefer providers with surplus features.
    pub fn count(&self) -> usize {
        usize::from(self.streaming) + usize::from(self.batching)
    }
}

/// Declared capabilities: supported task kinds plus flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub task_kinds: HashSet<TaskKind>,
    #[serde(default)]
    pub flags: CapabilityFlags,
    /// Upper bound on tasks per batched invocation. Meaningful only
    /// when `flags.batching` is set.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_max_batch_size() -> usize {
    1
}

impl Capabilities {
    pub fn for_kinds<I, K>(kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<TaskKind>,
    {
        Self {
            task_kinds: kinds.into_iter().map(Into::into).collect(),
            flags: CapabilityFlags::default(),
            max_batch_size: 1,
        }
    }

    pub fn with_flags(mut self, flags: CapabilityFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_batching(mut self, max_batch_size: usize) -> Self {
        self.flags.batching = true;
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Whether a task of `kind` with `required` flags can be served.
    pub fn supports(&self, kind: &TaskKind, required: &CapabilityFlags) -> bool {
        self.task_kinds.contains(kind) && self.flags.covers(required)
    }
}

/// Static description of a provider, supplied at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub id: ProviderId,
    /// Provider family, e.g. `anthropic`, `openai`, `local`.
    pub kind: String,
    /// Lower values are preferred by priority-based selection.
    pub priority: i32,
    pub capabilities: Capabilities,
    /// Opaque provider configuration (endpoints, credentials refs, ...).
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ProviderSpec {
    pub fn new(id: impl Into<ProviderId>, kind: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            priority: 0,
            capabilities,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Live health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Still eligible for selection, at half weight.
    Degraded,
    /// Skipped by selection until a successful probe.
    Unhealthy,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::Healthy
    }
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Selection weight multiplier for this state.
    pub fn selection_weight(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::Unhealthy => 0.0,
        }
    }
}

/// Consecutive failures at which a provider degrades / goes unhealthy.
pub const DEGRADED_THRESHOLD: u32 = 3;
pub const UNHEALTHY_THRESHOLD: u32 = 5;

/// Number of trailing outcomes over which latency is averaged.
pub const LATENCY_WINDOW: usize = 50;

/// Live health of a provider, driven only by outcome recording and
/// explicit probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    /// Trailing latency samples, most recent last. Capped at
    /// [`LATENCY_WINDOW`].
    latency_window: VecDeque<u32>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_check_at: None,
            latency_window: VecDeque::new(),
        }
    }
}

impl ProviderHealth {
    /// Record a successful invocation: reset failures, go Healthy.
    pub fn record_success(&mut self, latency_ms: u32, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.state = HealthState::Healthy;
        self.last_check_at = Some(now);
        self.push_latency(latency_ms);
    }

    /// Record a failed invocation and advance the state machine.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        self.last_check_at = Some(now);
        if self.consecutive_failures >= UNHEALTHY_THRESHOLD {
            self.state = HealthState::Unhealthy;
        } else if self.consecutive_failures >= DEGRADED_THRESHOLD {
            self.state = HealthState::Degraded;
        }
    }

    /// Apply a probe result. A healthy probe restores the provider.
    pub fn record_probe(&mut self, healthy: bool, latency_ms: u32, now: DateTime<Utc>) {
        self.last_check_at = Some(now);
        if healthy {
            self.consecutive_failures = 0;
            self.state = HealthState::Healthy;
            self.push_latency(latency_ms);
        } else {
            self.record_failure(now);
        }
    }

    fn push_latency(&mut self, latency_ms: u32) {
        self.latency_window.push_back(latency_ms);
        while self.latency_window.len() > LATENCY_WINDOW {
            self.latency_window.pop_front();
        }
    }

    /// Average latency over the trailing window, or `None` before the
    /// first sample.
    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latency_window.is_empty() {
            return None;
        }
        let sum: u64 = self.latency_window.iter().map(|&v| u64::from(v)).sum();
        #[allow(clippy::cast_precision_loss)]
        let avg = sum as f64 / self.latency_window.len() as f64;
        Some(avg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_cover() {
        let both = CapabilityFlags { streaming: true, batching: true };
        let stream_only = CapabilityFlags { streaming: true, batching: false };
        let none = CapabilityFlags::default();

        assert!(both.covers(&stream_only));
        assert!(both.covers(&none));
        assert!(!stream_only.covers(&both));
        assert!(stream_only.covers(&none));
    }

    #[test]
    fn test_capabilities_supports() {
        let caps = Capabilities::for_kinds(["code-review", "bug-fix"]);
        assert!(caps.supports(&TaskKind::new("code-review"), &CapabilityFlags::default()));
        assert!(!caps.supports(&TaskKind::new("analysis"), &CapabilityFlags::default()));
        assert!(!caps.supports(
            &TaskKind::new("code-review"),
            &CapabilityFlags { streaming: true, batching: false }
        ));
    }

    #[test]
    fn test_health_state_machine() {
        let mut health = ProviderHealth::default();
        let now = Utc::now();
        assert_eq!(health.state, HealthState::Healthy);

        health.record_failure(now);
        health.record_failure(now);
        assert_eq!(health.state, HealthState::Healthy);

        health.record_failure(now);
        assert_eq!(health.state, HealthState::Degraded);

        health.record_failure(now);
        health.record_failure(now);
        assert_eq!(health.state, HealthState::Unhealthy);

        // One success fully restores.
        health.record_success(20, now);
        assert_eq!(health.state, HealthState::Healthy);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn test_probe_restores_unhealthy() {
        let mut health = ProviderHealth::default();
        let now = Utc::now();
        for _ in 0..5 {
            health.record_failure(now);
        }
        assert_eq!(health.state, HealthState::Unhealthy);

        health.record_probe(false, 0, now);
        assert_eq!(health.state, HealthState::Unhealthy);

        health.record_probe(true, 35, now);
        assert_eq!(health.state, HealthState::Healthy);
    }

    #[test]
    fn test_latency_window_caps_at_fifty() {
        let mut health = ProviderHealth::default();
        let now = Utc::now();
        for i in 0..60 {
            health.record_success(i, now);
        }
        // Window holds samples 10..=59; average is 34.5.
        let avg = health.avg_latency_ms().unwrap();
        assert!((avg - 34.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_selection_weight() {
        assert!((HealthState::Healthy.selection_weight() - 1.0).abs() < f64::EPSILON);
        assert!((HealthState::Degraded.selection_weight() - 0.5).abs() < f64::EPSILON);
        assert!((HealthState::Unhealthy.selection_weight()).abs() < f64::EPSILON);
    }
}
