//! Quota domain models.
//!
//! Each provider carries one or more sub-keys (credentials). Usage is
//! accounted per (provider, sub-key) in fixed windows; reservations are
//! held until committed or refunded.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::provider::ProviderId;

/// Usage counters for one (provider, sub-key) window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub provider_id: ProviderId,
    pub sub_key: String,
    pub window_start: DateTime<Utc>,
    /// Committed plus reserved units in the current window.
    pub used: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

impl QuotaRecord {
    /// Open a fresh window starting at `now`.
    pub fn open(
        provider_id: ProviderId,
        sub_key: impl Into<String>,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_id,
            sub_key: sub_key.into(),
            window_start: now,
            used: 0,
            limit,
            reset_at: now + window,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    /// Roll over into a fresh window anchored at `now`.
    pub fn roll_over(&mut self, window: Duration, now: DateTime<Utc>) {
        self.window_start = now;
        self.used = 0;
        self.reset_at = now + window;
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn can_fit(&self, amount: u64) -> bool {
        self.used + amount <= self.limit
    }
}

/// A held claim on quota, committed on success or refunded on failure.
///
/// Tokens left uncommitted past the reservation TTL are auto-refunded
/// by the ledger's sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub provider_id: ProviderId,
    pub sub_key: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
}

/// Limit declaration for one sub-key, supplied when a provider's quota
/// is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubKeyLimit {
    pub sub_key: String,
    pub limit: u64,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl SubKeyLimit {
    pub fn new(sub_key: impl Into<String>, limit: u64, window_secs: u64) -> Self {
        Self {
            sub_key: sub_key.into(),
            limit,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(i64::try_from(self.window_secs).unwrap_or(i64::MAX))
    }
}
