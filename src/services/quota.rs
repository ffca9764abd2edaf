//! Quota ledger: windowed usage accounting per (provider, sub-key).
//!
//! Reservations are charged up front and either committed (kept) or
//! refunded. A reservation that is never settled is auto-refunded by
//! the sweeper once it outlives the reservation TTL, so a crashed
//! worker cannot leak quota.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::QuotaConfig;
use crate::domain::models::{ProviderId, QuotaRecord, Reservation, SubKeyLimit};
use crate::domain::ports::{Clock, SystemClock};

/// Per-provider quota state, guarded by its own mutex.
struct ProviderQuota {
    limits: HashMap<String, SubKeyLimit>,
    records: HashMap<String, QuotaRecord>,
    /// Last reservation instant per sub-key, for the LRU tie-break.
    last_used: HashMap<String, DateTime<Utc>>,
    /// Reservations awaiting commit/refund.
    pending: HashMap<Uuid, Reservation>,
}

impl ProviderQuota {
    fn new(provider_id: &ProviderId, limits: Vec<SubKeyLimit>, now: DateTime<Utc>) -> Self {
        let mut records = HashMap::new();
        let mut limit_map = HashMap::new();
        for limit in limits {
            records.insert(
                limit.sub_key.clone(),
                QuotaRecord::open(
                    provider_id.clone(),
                    limit.sub_key.clone(),
                    limit.limit,
                    limit.window(),
                    now,
                ),
            );
            limit_map.insert(limit.sub_key.clone(), limit);
        }
        Self {
            limits: limit_map,
            records,
            last_used: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn roll_expired(&mut self, now: DateTime<Utc>) {
        for (sub_key, record) in &mut self.records {
            if record.is_expired(now) {
                let window = self
                    .limits
                    .get(sub_key)
                    .map_or(Duration::hours(1), SubKeyLimit::window);
                record.roll_over(window, now);
                // Reservations from the closed window can no longer be
                // refunded against the fresh counters.
                self.pending.retain(|_, r| r.sub_key != *sub_key);
            }
        }
    }

    /// Pick the sub-key to book `amount` against: least-recently-used
    /// first, largest remaining headroom on a tie.
    fn pick_sub_key(&self, amount: u64) -> Option<String> {
        let epoch = DateTime::<Utc>::MIN_UTC;
        self.records
            .values()
            .filter(|r| r.can_fit(amount))
            .min_by(|a, b| {
                let a_used = self.last_used.get(&a.sub_key).copied().unwrap_or(epoch);
                let b_used = self.last_used.get(&b.sub_key).copied().unwrap_or(epoch);
                a_used
                    .cmp(&b_used)
                    .then_with(|| b.remaining().cmp(&a.remaining()))
                    .then_with(|| a.sub_key.cmp(&b.sub_key))
            })
            .map(|r| r.sub_key.clone())
    }

    fn earliest_reset(&self) -> Option<DateTime<Utc>> {
        self.records.values().map(|r| r.reset_at).min()
    }
}

/// Windowed quota accounting for all providers.
pub struct QuotaLedger {
    providers: RwLock<HashMap<ProviderId, Arc<Mutex<ProviderQuota>>>>,
    clock: Arc<dyn Clock>,
    reservation_ttl: Duration,
}

impl QuotaLedger {
    pub fn new(config: &QuotaConfig) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            reservation_ttl: Duration::milliseconds(
                i64::try_from(config.reservation_ttl_ms).unwrap_or(60_000),
            ),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Declare the sub-key limits for a provider, replacing any prior
    /// configuration. A provider with no configuration is unmetered.
    pub async fn configure(&self, provider_id: ProviderId, limits: Vec<SubKeyLimit>) {
        let now = self.clock.now();
        let quota = ProviderQuota::new(&provider_id, limits, now);
        self.providers
            .write()
            .await
            .insert(provider_id, Arc::new(Mutex::new(quota)));
    }

    /// Drop a provider's quota state.
    pub async fn remove(&self, provider_id: &ProviderId) {
        self.providers.write().await.remove(provider_id);
    }

    /// Atomically reserve `amount` units, preferring `sub_key` when
    /// given. Fails with `QuotaExhausted` carrying the earliest reset.
    pub async fn try_reserve(
        &self,
        provider_id: &ProviderId,
        sub_key: Option<&str>,
        amount: u64,
    ) -> OrchestratorResult<Reservation> {
        let Some(quota) = self.provider_quota(provider_id).await else {
            // Unmetered provider: hand out a token that settles as a
            // no-op.
            return Ok(Reservation {
                id: Uuid::new_v4(),
                provider_id: provider_id.clone(),
                sub_key: UNMETERED_SUB_KEY.to_string(),
                amount,
                created_at: self.clock.now(),
            });
        };

        let now = self.clock.now();
        let mut quota = quota.lock().await;
        quota.roll_expired(now);

        let chosen = match sub_key {
            Some(key) => quota
                .records
                .get(key)
                .filter(|r| r.can_fit(amount))
                .map(|r| r.sub_key.clone()),
            None => quota.pick_sub_key(amount),
        };

        let Some(chosen) = chosen else {
            let reset_at = quota.earliest_reset().unwrap_or(now);
            debug!(provider_id = %provider_id, amount, "quota exhausted");
            return Err(OrchestratorError::QuotaExhausted {
                provider_id: provider_id.to_string(),
                reset_at,
            });
        };

        let record = quota
            .records
            .get_mut(&chosen)
            .expect("chosen sub-key exists");
        record.used += amount;
        quota.last_used.insert(chosen.clone(), now);

        let reservation = Reservation {
            id: Uuid::new_v4(),
            provider_id: provider_id.clone(),
            sub_key: chosen,
            amount,
            created_at: now,
        };
        quota.pending.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    /// Commit a reservation: the usage stays booked for the window.
    pub async fn commit(&self, reservation: &Reservation) {
        if reservation.sub_key == UNMETERED_SUB_KEY {
            return;
        }
        if let Some(quota) = self.provider_quota(&reservation.provider_id).await {
            let mut quota = quota.lock().await;
            quota.pending.remove(&reservation.id);
        }
    }

    /// Refund a reservation: usage is released back to the window.
    ///
    /// Refunds for reservations whose window already rolled over are
    /// no-ops; the fresh window never saw their usage.
    pub async fn refund(&self, reservation: &Reservation) {
        if reservation.sub_key == UNMETERED_SUB_KEY {
            return;
        }
        let Some(quota) = self.provider_quota(&reservation.provider_id).await else {
            return;
        };
        let mut quota = quota.lock().await;
        if quota.pending.remove(&reservation.id).is_none() {
            return;
        }
        if let Some(record) = quota.records.get_mut(&reservation.sub_key) {
            if reservation.created_at >= record.window_start {
                record.used = record.used.saturating_sub(reservation.amount);
            }
        }
    }

    /// Whether `amount` units could currently be reserved. Pure
    /// snapshot check used by the coordinator's quota filter.
    pub async fn can_reserve(&self, provider_id: &ProviderId, amount: u64) -> bool {
        let Some(quota) = self.provider_quota(provider_id).await else {
            return true;
        };
        let now = self.clock.now();
        let mut quota = quota.lock().await;
        quota.roll_expired(now);
        quota.pick_sub_key(amount).is_some()
    }

    /// Earliest window reset among a provider's sub-keys.
    pub async fn earliest_reset(&self, provider_id: &ProviderId) -> Option<DateTime<Utc>> {
        let quota = self.provider_quota(provider_id).await?;
        let quota = quota.lock().await;
        quota.earliest_reset()
    }

    /// Current records for a provider (tests, stats).
    pub async fn usage(&self, provider_id: &ProviderId) -> Vec<QuotaRecord> {
        match self.provider_quota(provider_id).await {
            Some(quota) => {
                let quota = quota.lock().await;
                let mut records: Vec<QuotaRecord> = quota.records.values().cloned().collect();
                records.sort_by(|a, b| a.sub_key.cmp(&b.sub_key));
                records
            }
            None => Vec::new(),
        }
    }

    /// Refund all pending reservations older than the reservation TTL.
    /// Returns the number refunded.
    pub async fn sweep_expired_reservations(&self) -> usize {
        let now = self.clock.now();
        let providers: Vec<Arc<Mutex<ProviderQuota>>> = {
            let guard = self.providers.read().await;
            guard.values().cloned().collect()
        };

        let mut refunded = 0;
        for quota in providers {
            let mut quota = quota.lock().await;
            let expired: Vec<Reservation> = quota
                .pending
                .values()
                .filter(|r| now - r.created_at >= self.reservation_ttl)
                .cloned()
                .collect();
            for reservation in expired {
                quota.pending.remove(&reservation.id);
                if let Some(record) = quota.records.get_mut(&reservation.sub_key) {
                    if reservation.created_at >= record.window_start {
                        record.used = record.used.saturating_sub(reservation.amount);
                    }
                }
                warn!(
                    provider_id = %reservation.provider_id,
                    sub_key = %reservation.sub_key,
                    amount = reservation.amount,
                    "auto-refunded stale reservation"
                );
                refunded += 1;
            }
        }
        refunded
    }

    /// Spawn the background sweeper. Runs until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let ledger = self.clone();
        let interval = std::time::Duration::from_millis(
            u64::try_from(ledger.reservation_ttl.num_milliseconds().max(1000)).unwrap_or(60_000)
                / 2,
        );
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                ledger.sweep_expired_reservations().await;
            }
        })
    }

    async fn provider_quota(&self, provider_id: &ProviderId) -> Option<Arc<Mutex<ProviderQuota>>> {
        self.providers.read().await.get(provider_id).cloned()
    }
}

/// Sentinel sub-key handed out for providers with no configured quota.
const UNMETERED_SUB_KEY: &str = "__unmetered__";
