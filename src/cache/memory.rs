//! In-process shared cache
//!
//! Every filter in the process that holds the same `Arc<MemoryCache>` sees the
//! same records, which is what the integration tests use to simulate a fleet.
//! Creation is single-flight per key: concurrent `get_or_create` calls for one
//! key run at most one factory at a time and the losers read the winner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{CacheError, CacheOptions, SharedCache, ValueFactory};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Per-key creation lock and the number of claimers holding or awaiting it
#[derive(Default)]
struct Gate {
    lock: Arc<Mutex<()>>,
    holders: usize,
}

type Gates = StdMutex<HashMap<String, Gate>>;

/// Claim on a key's creation gate. Dropping it (including when the claiming
/// future is cancelled) removes the gate once the last claimer is gone.
struct GateTicket<'a> {
    gates: &'a Gates,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for GateTicket<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(gate) = gates.get_mut(&self.key) {
            gate.holders = gate.holders.saturating_sub(1);
            if gate.holders == 0 {
                gates.remove(&self.key);
            }
        }
    }
}

/// In-memory [`SharedCache`]
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    /// Per-key creation gates, dropped once nobody is waiting on them
    gates: Gates,
    options: CacheOptions,
}

impl MemoryCache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            gates: StdMutex::new(HashMap::new()),
            options,
        }
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn live(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: drop it so the next claim starts clean
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        None
    }

    fn gate(&self, key: &str) -> GateTicket<'_> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        let gate = gates.entry(key.to_string()).or_default();
        gate.holders += 1;
        GateTicket {
            gates: &self.gates,
            key: key.to_string(),
            lock: gate.lock.clone(),
        }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.live(key).await)
    }

    async fn get_or_create(
        &self,
        key: &str,
        factory: ValueFactory<'_>,
    ) -> Result<Vec<u8>, CacheError> {
        if let Some(value) = self.live(key).await {
            return Ok(value);
        }

        let ticket = self.gate(key);
        let _guard = ticket.lock.lock().await;

        // Another creator may have finished while we waited for the gate
        if let Some(value) = self.live(key).await {
            return Ok(value);
        }

        let value = factory().await.map_err(CacheError::Factory)?;
        let expires_at = self.options.entry_ttl.map(|ttl| Instant::now() + ttl);
        self.entries.write().await.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(value)
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
