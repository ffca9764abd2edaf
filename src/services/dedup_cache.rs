//! Dedup / result cache.
//!
//! Collapses concurrent tasks with identical fingerprints: the first
//! caller becomes the producer, later callers attach as followers and
//! inherit the producer's result verbatim. Completed results are kept
//! for a TTL; in-flight entries live exactly as long as the producing
//! task.
//!
//! Sharded by fingerprint to keep lock contention local.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::domain::models::config::DedupConfig;
use crate::domain::models::Fingerprint;
use crate::domain::ports::{Clock, SystemClock};

/// Signal sent from producer to followers.
#[derive(Debug, Clone, PartialEq)]
enum ProducerSignal {
    Pending,
    Published(serde_json::Value),
    Abandoned,
}

enum CacheSlot {
    /// A producer is executing; followers watch the channel.
    InFlight {
        producer_task_id: Uuid,
        tx: watch::Sender<ProducerSignal>,
    },
    /// Result available until `expires_at`.
    Completed {
        result: serde_json::Value,
        producer_task_id: Uuid,
        expires_at: DateTime<Utc>,
    },
}

/// Producer claim token; settle with [`DedupCache::publish`] or
/// [`DedupCache::abandon`].
#[derive(Debug)]
pub struct DedupClaim {
    pub fingerprint: Fingerprint,
    pub producer_task_id: Uuid,
}

/// Follower side of an in-flight entry.
pub struct FollowerHandle {
    pub producer_task_id: Uuid,
    rx: watch::Receiver<ProducerSignal>,
}

/// What a follower observed after waiting.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowerOutcome {
    /// Producer published; the follower mirrors this result.
    Published(serde_json::Value),
    /// Producer failed or was cancelled; the follower re-queues as a
    /// fresh task and does not inherit the error.
    Abandoned,
    /// The producer outlived `follower_timeout`.
    TimedOut,
}

impl FollowerHandle {
    /// Wait until the producer settles, bounded by `timeout`.
    pub async fn wait(mut self, timeout: std::time::Duration) -> FollowerOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let current = self.rx.borrow_and_update().clone();
                match current {
                    ProducerSignal::Published(result) => return FollowerOutcome::Published(result),
                    ProducerSignal::Abandoned => return FollowerOutcome::Abandoned,
                    ProducerSignal::Pending => {}
                }
            }
            match tokio::time::timeout_at(deadline, self.rx.changed()).await {
                Ok(Ok(())) => {}
                // Sender dropped without publishing: treat as abandoned.
                Ok(Err(_)) => return FollowerOutcome::Abandoned,
                Err(_) => return FollowerOutcome::TimedOut,
            }
        }
    }
}

/// Result of the atomic lookup-or-claim.
pub enum DedupDecision {
    /// Fresh cached result.
    Hit {
        result: serde_json::Value,
        producer_task_id: Uuid,
    },
    /// Attach to the in-flight producer.
    Follower(FollowerHandle),
    /// Caller is the producer.
    Claim(DedupClaim),
}

/// Sharded fingerprint → result cache.
pub struct DedupCache {
    shards: Vec<Mutex<HashMap<Fingerprint, CacheSlot>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            ttl: Duration::milliseconds(i64::try_from(config.dedup_ttl_ms).unwrap_or(3_600_000)),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn shard(&self, fingerprint: &Fingerprint) -> &Mutex<HashMap<Fingerprint, CacheSlot>> {
        &self.shards[fingerprint.shard(self.shards.len())]
    }

    /// Atomic: return a fresh cached result, attach to the in-flight
    /// producer, or grant the caller the producer claim.
    pub async fn get_or_claim(&self, fingerprint: &Fingerprint, task_id: Uuid) -> DedupDecision {
        let now = self.clock.now();
        let mut shard = self.shard(fingerprint).lock().await;

        // Extract owned data first so the shard can be mutated below.
        enum Lookup {
            Fresh(serde_json::Value, Uuid),
            Expired,
            InFlight(Uuid, watch::Receiver<ProducerSignal>),
            Vacant,
        }
        let lookup = match shard.get(fingerprint) {
            Some(CacheSlot::Completed {
                result,
                producer_task_id,
                expires_at,
            }) if *expires_at > now => Lookup::Fresh(result.clone(), *producer_task_id),
            Some(CacheSlot::Completed { .. }) => Lookup::Expired,
            Some(CacheSlot::InFlight {
                producer_task_id,
                tx,
            }) => Lookup::InFlight(*producer_task_id, tx.subscribe()),
            None => Lookup::Vacant,
        };

        match lookup {
            Lookup::Fresh(result, producer_task_id) => {
                return DedupDecision::Hit {
                    result,
                    producer_task_id,
                };
            }
            Lookup::InFlight(producer_task_id, rx) => {
                debug!(%fingerprint, follower = %task_id, producer = %producer_task_id, "dedup follower attached");
                return DedupDecision::Follower(FollowerHandle {
                    producer_task_id,
                    rx,
                });
            }
            Lookup::Expired => {
                shard.remove(fingerprint);
            }
            Lookup::Vacant => {}
        }

        let (tx, _rx) = watch::channel(ProducerSignal::Pending);
        shard.insert(
            fingerprint.clone(),
            CacheSlot::InFlight {
                producer_task_id: task_id,
                tx,
            },
        );
        DedupDecision::Claim(DedupClaim {
            fingerprint: fingerprint.clone(),
            producer_task_id: task_id,
        })
    }

    /// Store the producer's result, wake followers, start the TTL.
    pub async fn publish(&self, claim: DedupClaim, result: serde_json::Value) {
        let now = self.clock.now();
        let mut shard = self.shard(&claim.fingerprint).lock().await;

        // Only the claim holder may publish.
        let owns = matches!(
            shard.get(&claim.fingerprint),
            Some(CacheSlot::InFlight { producer_task_id, .. })
                if *producer_task_id == claim.producer_task_id
        );
        if !owns {
            return;
        }
        if let Some(CacheSlot::InFlight { tx, .. }) = shard.remove(&claim.fingerprint) {
            let _ = tx.send(ProducerSignal::Published(result.clone()));
            shard.insert(
                claim.fingerprint,
                CacheSlot::Completed {
                    result,
                    producer_task_id: claim.producer_task_id,
                    expires_at: now + self.ttl,
                },
            );
        }
    }

    /// Producer failed or was cancelled: drop the entry and signal
    /// followers to re-queue themselves.
    pub async fn abandon(&self, claim: DedupClaim) {
        let mut shard = self.shard(&claim.fingerprint).lock().await;
        let owns = matches!(
            shard.get(&claim.fingerprint),
            Some(CacheSlot::InFlight { producer_task_id, .. })
                if *producer_task_id == claim.producer_task_id
        );
        if !owns {
            return;
        }
        if let Some(CacheSlot::InFlight { tx, .. }) = shard.remove(&claim.fingerprint) {
            let _ = tx.send(ProducerSignal::Abandoned);
        }
    }

    /// Drop expired completed entries. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().await;
            let before = shard.len();
            shard.retain(|_, slot| {
                !matches!(slot, CacheSlot::Completed { expires_at, .. } if *expires_at <= now)
            });
            removed += before - shard.len();
        }
        removed
    }

    /// Total entries across shards (tests, stats).
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ManualClock;
    use serde_json::json;

    fn fp(tag: &str) -> Fingerprint {
        use crate::domain::models::{CapabilityFlags, TaskKind, TaskPayload};
        Fingerprint::compute(
            &TaskKind::new("code-review"),
            &TaskPayload::from_metadata(json!({ "tag": tag })),
            &CapabilityFlags::default(),
        )
    }

    fn cache() -> (DedupCache, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let cache = DedupCache::new(&DedupConfig::default()).with_clock(Arc::new(clock.clone()));
        (cache, clock)
    }

    #[tokio::test]
    async fn test_first_caller_claims() {
        let (cache, _clock) = cache();
        let id = Uuid::new_v4();
        match cache.get_or_claim(&fp("a"), id).await {
            DedupDecision::Claim(claim) => assert_eq!(claim.producer_task_id, id),
            _ => panic!("first caller must claim"),
        }
    }

    #[tokio::test]
    async fn test_publish_then_hit() {
        let (cache, _clock) = cache();
        let producer = Uuid::new_v4();
        let DedupDecision::Claim(claim) = cache.get_or_claim(&fp("a"), producer).await else {
            panic!("expected claim");
        };
        cache.publish(claim, json!({"answer": 42})).await;

        match cache.get_or_claim(&fp("a"), Uuid::new_v4()).await {
            DedupDecision::Hit {
                result,
                producer_task_id,
            } => {
                assert_eq!(result, json!({"answer": 42}));
                assert_eq!(producer_task_id, producer);
            }
            _ => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_follower_receives_published_result() {
        let (cache, _clock) = cache();
        let producer = Uuid::new_v4();
        let DedupDecision::Claim(claim) = cache.get_or_claim(&fp("a"), producer).await else {
            panic!("expected claim");
        };

        let DedupDecision::Follower(handle) = cache.get_or_claim(&fp("a"), Uuid::new_v4()).await
        else {
            panic!("expected follower");
        };
        assert_eq!(handle.producer_task_id, producer);

        let waiter = tokio::spawn(handle.wait(std::time::Duration::from_secs(5)));
        cache.publish(claim, json!("done")).await;

        assert_eq!(
            waiter.await.unwrap(),
            FollowerOutcome::Published(json!("done"))
        );
    }

    #[tokio::test]
    async fn test_abandon_signals_followers() {
        let (cache, _clock) = cache();
        let DedupDecision::Claim(claim) = cache.get_or_claim(&fp("a"), Uuid::new_v4()).await else {
            panic!("expected claim");
        };
        let DedupDecision::Follower(handle) = cache.get_or_claim(&fp("a"), Uuid::new_v4()).await
        else {
            panic!("expected follower");
        };

        cache.abandon(claim).await;
        assert_eq!(
            handle.wait(std::time::Duration::from_secs(5)).await,
            FollowerOutcome::Abandoned
        );

        // Entry is gone; the next caller claims fresh.
        assert!(matches!(
            cache.get_or_claim(&fp("a"), Uuid::new_v4()).await,
            DedupDecision::Claim(_)
        ));
    }

    #[tokio::test]
    async fn test_follower_timeout() {
        let (cache, _clock) = cache();
        let DedupDecision::Claim(_held) = cache.get_or_claim(&fp("a"), Uuid::new_v4()).await else {
            panic!("expected claim");
        };
        let DedupDecision::Follower(handle) = cache.get_or_claim(&fp("a"), Uuid::new_v4()).await
        else {
            panic!("expected follower");
        };

        assert_eq!(
            handle.wait(std::time::Duration::from_millis(20)).await,
            FollowerOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn test_ttl_expiry_yields_fresh_claim() {
        let (cache, clock) = cache();
        let DedupDecision::Claim(claim) = cache.get_or_claim(&fp("a"), Uuid::new_v4()).await else {
            panic!("expected claim");
        };
        cache.publish(claim, json!(1)).await;

        clock.advance(Duration::milliseconds(3_600_001));
        assert!(matches!(
            cache.get_or_claim(&fp("a"), Uuid::new_v4()).await,
            DedupDecision::Claim(_)
        ));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (cache, clock) = cache();
        for tag in ["a", "b", "c"] {
            let DedupDecision::Claim(claim) = cache.get_or_claim(&fp(tag), Uuid::new_v4()).await
            else {
                panic!("expected claim");
            };
            cache.publish(claim, json!(tag)).await;
        }
        assert_eq!(cache.len().await, 3);

        clock.advance(Duration::milliseconds(3_600_001));
        assert_eq!(cache.purge_expired().await, 3);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_do_not_collide() {
        let (cache, _clock) = cache();
        assert!(matches!(
            cache.get_or_claim(&fp("a"), Uuid::new_v4()).await,
            DedupDecision::Claim(_)
        ));
        assert!(matches!(
            cache.get_or_claim(&fp("b"), Uuid::new_v4()).await,
            DedupDecision::Claim(_)
        ));
    }
}
