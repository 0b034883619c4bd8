use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

pub const DEFAULT_NONCE_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_NONCE_PRUNE_INTERVAL_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceStoreConfig {
    pub max_entries: usize,
    pub prune_interval_ms: i64,
}

impl Default for NonceStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_NONCE_MAX_ENTRIES,
            prune_interval_ms: DEFAULT_NONCE_PRUNE_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("nonce already used for wallet {wallet}")]
pub struct NonceReplay {
    pub wallet: String,
    pub nonce: String,
}

/// In-memory replay ledger keyed by `(wallet, nonce)`.
///
/// Entries are not persisted; losing them on restart only re-admits nonces
/// whose signatures have already aged past the freshness window.
#[derive(Debug)]
pub struct NonceStore {
    config: NonceStoreConfig,
    inner: Mutex<NonceStoreInner>,
}

#[derive(Debug, Default)]
struct NonceStoreInner {
    entries: HashMap<(String, String), i64>,
    last_pruned_at_ms: i64,
}

impl NonceStore {
    pub fn new(config: NonceStoreConfig) -> Self {
        Self {
            config: NonceStoreConfig {
                max_entries: config.max_entries.max(1),
                prune_interval_ms: config.prune_interval_ms.max(0),
            },
            inner: Mutex::new(NonceStoreInner::default()),
        }
    }

    pub fn config(&self) -> NonceStoreConfig {
        self.config
    }

    /// Records the pair, or rejects it if an unexpired entry already exists.
    pub fn consume(
        &self,
        wallet: &str,
        nonce: &str,
        expires_at_ms: i64,
        now_ms: i64,
    ) -> Result<(), NonceReplay> {
        let mut inner = self.lock();
        let key = (wallet.to_string(), nonce.to_string());

        if inner
            .entries
            .get(&key)
            .is_some_and(|expires_at_ms| *expires_at_ms > now_ms)
        {
            return Err(NonceReplay {
                wallet: key.0,
                nonce: key.1,
            });
        }

        let interval_elapsed =
            now_ms.saturating_sub(inner.last_pruned_at_ms) >= self.config.prune_interval_ms;
        let at_capacity = inner.entries.len() >= self.config.max_entries;
        if interval_elapsed || at_capacity {
            inner.prune_expired(now_ms);
        }
        if !inner.entries.contains_key(&key) {
            inner.evict_to_fit(self.config.max_entries);
        }

        inner.entries.insert(key, expires_at_ms);
        Ok(())
    }

    pub fn prune(&self, now_ms: i64) -> usize {
        self.lock().prune_expired(now_ms)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NonceStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for NonceStore {
    fn default() -> Self {
        Self::new(NonceStoreConfig::default())
    }
}

impl NonceStoreInner {
    fn prune_expired(&mut self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at_ms| *expires_at_ms > now_ms);
        self.last_pruned_at_ms = now_ms;
        before - self.entries.len()
    }

    // Evicting an unexpired entry re-opens its replay window; capacity wins.
    fn evict_to_fit(&mut self, max_entries: usize) {
        while self.entries.len() >= max_entries {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by(|left, right| left.1.cmp(right.1).then_with(|| left.0.cmp(right.0)))
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
            tracing::warn!(
                wallet = %oldest.0,
                "nonce store at capacity, evicted earliest-expiring entry"
            );
        }
    }
}
