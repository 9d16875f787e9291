use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::admission::RejectionReason;
use crate::clock::Clock;
use crate::request_context::Fingerprint;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    UpstreamFetch,
    Decode,
    Internal,
}

/// A conversion that went wrong for reasons other than admission policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Failure {
            kind,
            detail: detail.into(),
        }
    }
}

/// Terminal result of a conversion attempt, as produced by the compute function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Converted(Bytes),
    Rejected(RejectionReason),
    Failed(Failure),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Success(Bytes),
    Rejected(RejectionReason),
    Failed(Failure),
}

impl From<Outcome> for EntryStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Converted(payload) => EntryStatus::Success(payload),
            Outcome::Rejected(reason) => EntryStatus::Rejected(reason),
            Outcome::Failed(failure) => EntryStatus::Failed(failure),
        }
    }
}

/// Read-only view of one cached conversion.
#[derive(Clone, Debug)]
pub struct ConversionEntry {
    pub fingerprint: Fingerprint,
    pub status: EntryStatus,
    pub created_at: Instant,
    /// `None` while pending.
    pub expires_at: Option<Instant>,
}

impl ConversionEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

type Completion = Option<Arc<ConversionEntry>>;

struct InFlight {
    generation: u64,
    started_at: Instant,
    done: watch::Receiver<Completion>,
}

// Pending computations live outside the LRU so capacity pressure can never
// evict them and start a second computation for the same fingerprint.
struct CacheState {
    entries: LruCache<Fingerprint, Arc<ConversionEntry>>,
    in_flight: HashMap<Fingerprint, InFlight>,
    generation: u64,
}

struct Shared {
    state: Mutex<CacheState>,
    clock: Arc<dyn Clock>,
    failure_ttl: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(
        &self,
        fingerprint: Fingerprint,
        generation: u64,
        created_at: Instant,
        ttl: Duration,
        outcome: Outcome,
    ) -> Arc<ConversionEntry> {
        let now = self.clock.now();
        let ttl = match outcome {
            Outcome::Failed(_) => self.failure_ttl,
            _ => ttl,
        };
        let entry = Arc::new(ConversionEntry {
            fingerprint: fingerprint.clone(),
            status: outcome.into(),
            created_at,
            expires_at: Some(now + ttl),
        });

        let mut state = self.lock();
        let owns_slot = state
            .in_flight
            .get(&fingerprint)
            .is_some_and(|in_flight| in_flight.generation == generation);
        if owns_slot {
            state.in_flight.remove(&fingerprint);
            if let Some((evicted, _)) = state.entries.push(fingerprint.clone(), entry.clone()) {
                if evicted != fingerprint {
                    debug!(fingerprint = %evicted, "evicted conversion cache entry");
                }
            }
        }
        entry
    }
}

enum Lookup {
    Hit(Arc<ConversionEntry>),
    Wait(watch::Receiver<Completion>),
    Compute {
        generation: u64,
        created_at: Instant,
        done: watch::Sender<Completion>,
        waiter: watch::Receiver<Completion>,
    },
}

/// Bounded, fingerprint-keyed memo of conversion outcomes with at most one
/// in-flight computation per fingerprint.
///
/// The capacity bounds completed entries only. Computations run on their own
/// task, so a caller that goes away while waiting does not cancel the work
/// other callers are waiting on.
#[derive(Clone)]
pub struct ConversionCache {
    shared: Arc<Shared>,
}

impl ConversionCache {
    pub fn new(capacity: NonZeroUsize, failure_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        ConversionCache {
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState {
                    entries: LruCache::new(capacity),
                    in_flight: HashMap::new(),
                    generation: 0,
                }),
                clock,
                failure_ttl,
            }),
        }
    }

    /// Returns the cached entry for `fingerprint`, joining an in-flight
    /// computation or starting one with `compute` on a miss. The returned
    /// entry is always terminal.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: F,
    ) -> Arc<ConversionEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let mut waiter = match self.lookup(fingerprint) {
            Lookup::Hit(entry) => {
                debug!(%fingerprint, "conversion cache hit");
                return entry;
            }
            Lookup::Wait(waiter) => waiter,
            Lookup::Compute {
                generation,
                created_at,
                done,
                waiter,
            } => {
                info!(%fingerprint, generation, "conversion cache miss");
                let shared = self.shared.clone();
                let fingerprint = fingerprint.clone();
                let work = tokio::spawn(compute());
                tokio::spawn(async move {
                    let outcome = work.await.unwrap_or_else(|e| {
                        warn!(%fingerprint, error = %e, "conversion task aborted");
                        Outcome::Failed(Failure::new(FailureKind::Internal, e.to_string()))
                    });
                    let entry = shared.complete(fingerprint, generation, created_at, ttl, outcome);
                    done.send_replace(Some(entry));
                });
                waiter
            }
        };

        let completed = waiter
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|completion| (*completion).clone());

        completed.unwrap_or_else(|| {
            Arc::new(ConversionEntry {
                fingerprint: fingerprint.clone(),
                status: EntryStatus::Failed(Failure::new(
                    FailureKind::Internal,
                    "conversion was dropped before completing",
                )),
                created_at: self.shared.clock.now(),
                expires_at: Some(self.shared.clock.now()),
            })
        })
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Lookup {
        let now = self.shared.clock.now();
        let mut state = self.shared.lock();

        if let Some(in_flight) = state.in_flight.get(fingerprint) {
            let pending_for = now.saturating_duration_since(in_flight.started_at);
            debug!(%fingerprint, ?pending_for, "joining in-flight conversion");
            return Lookup::Wait(in_flight.done.clone());
        }
        match state.entries.get(fingerprint) {
            Some(entry) if !entry.is_expired(now) => return Lookup::Hit(entry.clone()),
            Some(_) => {
                state.entries.pop(fingerprint);
            }
            None => {}
        }

        state.generation += 1;
        let generation = state.generation;
        let (done, waiter) = watch::channel(None);
        state.in_flight.insert(
            fingerprint.clone(),
            InFlight {
                generation,
                started_at: now,
                done: waiter.clone(),
            },
        );

        Lookup::Compute {
            generation,
            created_at: now,
            done,
            waiter,
        }
    }

    /// Current view of an entry without touching recency. Expired entries
    /// are reported as absent.
    #[cfg(test)]
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<Arc<ConversionEntry>> {
        let now = self.shared.clock.now();
        let state = self.shared.lock();
        if let Some(in_flight) = state.in_flight.get(fingerprint) {
            return Some(Arc::new(ConversionEntry {
                fingerprint: fingerprint.clone(),
                status: EntryStatus::Pending,
                created_at: in_flight.started_at,
                expires_at: None,
            }));
        }
        state
            .entries
            .peek(fingerprint)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Completed entries held, expired or not.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }
}
