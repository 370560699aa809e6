//! Per-chain in-flight markers
//!
//! At most one unit of work may run per chain. The boss acquires a [`Lease`]
//! before dispatching; the lease is released when dropped, which also happens
//! when the worker task is aborted. Every entry carries a token so a stale
//! lease never clears a newer worker's marker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use uuid::Uuid;

#[derive(Debug)]
struct Entry {
    token: u64,
    started: Instant,
    last_progress: Instant,
    phase: &'static str,
    abort: Option<AbortHandle>,
}

/// A worker that made no progress for longer than the heartbeat timeout
#[derive(Debug, Clone, PartialEq)]
pub struct Stalled {
    pub chain_id: Uuid,
    pub stalled_for: Duration,
    pub running_for: Duration,
    pub phase: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct InFlight {
    entries: Arc<Mutex<HashMap<Uuid, Entry>>>,
    next_token: Arc<AtomicU64>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a chain in flight; `None` if it already is
    pub fn try_acquire(&self, chain_id: Uuid) -> Option<Lease> {
        let mut entries = self.lock();
        if entries.contains_key(&chain_id) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        entries.insert(
            chain_id,
            Entry {
                token,
                started: now,
                last_progress: now,
                phase: "dispatch",
                abort: None,
            },
        );
        Some(Lease {
            chain_id,
            token,
            in_flight: self.clone(),
        })
    }

    pub fn is_in_flight(&self, chain_id: Uuid) -> bool {
        self.lock().contains_key(&chain_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach the handle used to abort the chain's worker task
    pub fn attach(&self, chain_id: Uuid, token: u64, abort: AbortHandle) {
        if let Some(entry) = self.lock().get_mut(&chain_id).filter(|e| e.token == token) {
            entry.abort = Some(abort);
        }
    }

    fn beat(&self, chain_id: Uuid, token: u64, phase: &'static str) {
        if let Some(entry) = self.lock().get_mut(&chain_id).filter(|e| e.token == token) {
            entry.last_progress = Instant::now();
            entry.phase = phase;
        }
    }

    fn release(&self, chain_id: Uuid, token: u64) {
        let mut entries = self.lock();
        if entries.get(&chain_id).map_or(false, |e| e.token == token) {
            entries.remove(&chain_id);
        }
    }

    /// Workers without progress for at least `threshold`
    pub fn stalled(&self, threshold: Duration) -> Vec<Stalled> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_progress) >= threshold)
            .map(|(chain_id, e)| Stalled {
                chain_id: *chain_id,
                stalled_for: now.duration_since(e.last_progress),
                running_for: now.duration_since(e.started),
                phase: e.phase,
            })
            .collect()
    }

    /// Abort stalled workers and clear their markers so the chain can be redispatched
    pub fn reap_stalled(&self, threshold: Duration) -> Vec<Stalled> {
        let stalled = self.stalled(threshold);
        let aborts: Vec<AbortHandle> = {
            let mut entries = self.lock();
            stalled
                .iter()
                .filter_map(|s| entries.remove(&s.chain_id))
                .filter_map(|e| e.abort)
                .collect()
        };
        // outside the lock: an aborted task drops its lease, which locks again
        for abort in aborts {
            abort.abort();
        }
        stalled
    }

    /// Wait until nothing is in flight; false on timeout
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

/// Exclusive right to work on one chain; released on drop
#[derive(Debug)]
pub struct Lease {
    chain_id: Uuid,
    token: u64,
    in_flight: InFlight,
}

impl Lease {
    pub fn chain_id(&self) -> Uuid {
        self.chain_id
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Report progress so the medic does not treat the worker as stalled
    pub fn beat(&self, phase: &'static str) {
        self.in_flight.beat(self.chain_id, self.token, phase);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.in_flight.release(self.chain_id, self.token);
    }
}
