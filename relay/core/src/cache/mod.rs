//! Similarity Cache
//!
//! Caches analysis results by input text so repeated and near-duplicate
//! submissions skip the analysis engine.
//!
//! # Design
//!
//! Lookups are two-tier:
//!
//! ```text
//!   get(text)
//!     ├─ exact:   sha256(trim(lowercase(text))) in map        ──► HitKind::Exact
//!     ├─ similar: best TF-IDF cosine >= similarity_threshold  ──► HitKind::Similar
//!     └─ miss
//! ```
//!
//! - **Capacity**: inserting at capacity evicts the single oldest entry
//! - **TTL**: expired entries are never returned; a full sweep runs every
//!   `sweep_every` lookups
//! - **Index**: the TF-IDF model depends on the whole corpus and is refit on
//!   every insertion and removal
//! - **Degradation**: under resource pressure the cache halves its capacity
//!   and raises its threshold; leaving degradation restores the prior config

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

mod tfidf;

use tfidf::TfidfIndex;

/// Cache configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_size: usize,
    /// Entry lifetime (seconds)
    pub ttl_secs: u64,
    /// Minimum cosine similarity for a near-duplicate hit
    pub similarity_threshold: f64,
    /// Run the expiry sweep every this many lookups (0 = never)
    pub sweep_every: u64,
    /// Vocabulary cap of the similarity index
    pub max_features: usize,
    /// Threshold floor applied in degradation mode
    pub degraded_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl_secs: 24 * 3600,
            similarity_threshold: 0.75,
            sweep_every: 100,
            max_features: 1000,
            degraded_threshold: 0.9,
        }
    }
}

impl CacheConfig {
    /// Entry lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Pull capacity up to one and both thresholds into `[0, 1]`
    #[must_use]
    pub fn clamped(mut self) -> Self {
        let defaults = Self::default();
        self.max_size = self.max_size.max(1);
        self.similarity_threshold =
            clamp_unit(self.similarity_threshold, defaults.similarity_threshold);
        self.degraded_threshold = clamp_unit(self.degraded_threshold, defaults.degraded_threshold);
        self
    }
}

/// Clamp into `[0, 1]`, substituting `fallback` for NaN
fn clamp_unit(value: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Partial reconfiguration; `None` leaves a value unchanged
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfigUpdate {
    /// New capacity
    pub max_size: Option<usize>,
    /// New entry lifetime (seconds)
    pub ttl_secs: Option<u64>,
    /// New similarity threshold
    pub similarity_threshold: Option<f64>,
}

/// How a lookup matched
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HitKind {
    /// Normalized text matched exactly
    Exact,
    /// A stored text was similar enough
    Similar {
        /// Cosine similarity of the match
        similarity: f64,
    },
}

impl HitKind {
    /// Short label (`exact` / `similar`)
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Similar { .. } => "similar",
        }
    }
}

/// A cached result and how it was found
#[derive(Clone, Debug, PartialEq)]
pub struct CacheHit {
    /// The stored result
    pub result: Value,
    /// Match tier
    pub kind: HitKind,
    /// Text the result was originally computed for
    pub matched_text: String,
}

/// Cache statistics
#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    /// Entries held
    pub size: usize,
    /// Current capacity
    pub max_size: usize,
    /// Hits of either tier
    pub hits: u64,
    /// Exact-tier hits
    pub exact_hits: u64,
    /// Near-duplicate hits
    pub similar_hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// All lookups
    pub total_lookups: u64,
    /// Hits as a percentage of lookups
    pub hit_rate_percent: f64,
    /// Entries evicted for capacity
    pub evictions: u64,
    /// Entries removed by the expiry sweep
    pub expired: u64,
    /// Current similarity threshold
    pub similarity_threshold: f64,
    /// Entry lifetime (seconds)
    pub ttl_secs: u64,
    /// Texts held in the similarity index
    pub indexed_texts: usize,
    /// Whether degradation mode is active
    pub degraded: bool,
}

struct Entry {
    result: Value,
    text: String,
    inserted_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    exact_hits: u64,
    similar_hits: u64,
    misses: u64,
    total_lookups: u64,
    evictions: u64,
    expired: u64,
}

struct CacheState {
    config: CacheConfig,
    saved_config: Option<CacheConfig>,
    entries: HashMap<String, Entry>,
    /// Entry keys in index order
    order: Vec<String>,
    index: TfidfIndex,
    next_seq: u64,
    counters: Counters,
}

impl CacheState {
    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) > self.config.ttl()
    }

    fn rebuild_index(&mut self) {
        let texts: Vec<&str> = self
            .order
            .iter()
            .filter_map(|key| self.entries.get(key).map(|e| e.text.as_str()))
            .collect();
        self.index = TfidfIndex::fit(&texts, self.config.max_features);
    }

    /// Remove entries without refitting the index
    fn remove_keys(&mut self, keys: &[String]) {
        for key in keys {
            self.entries.remove(key);
        }
        self.order.retain(|key| self.entries.contains_key(key));
    }

    fn oldest_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.inserted_at, e.seq))
            .map(|(key, _)| key.clone())
    }

    /// Evict oldest entries until at most `target` remain
    fn evict_down_to(&mut self, target: usize) -> usize {
        let mut evicted = Vec::new();
        while self.entries.len() > target {
            let Some(key) = self.oldest_key() else { break };
            self.entries.remove(&key);
            evicted.push(key);
        }
        if !evicted.is_empty() {
            self.order.retain(|key| self.entries.contains_key(key));
            self.counters.evictions += evicted.len() as u64;
            self.rebuild_index();
        }
        evicted.len()
    }

    fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(key, _)| key.clone())
            .collect();
        if !expired.is_empty() {
            self.remove_keys(&expired);
            self.rebuild_index();
            self.counters.expired += expired.len() as u64;
        }
        expired.len()
    }

    fn lookup(&self, text: &str, now: Instant) -> Option<CacheHit> {
        let key = cache_key(text);
        if let Some(entry) = self.entries.get(&key).filter(|e| !self.is_expired(e, now)) {
            return Some(CacheHit {
                result: entry.result.clone(),
                kind: HitKind::Exact,
                matched_text: entry.text.clone(),
            });
        }

        let (position, similarity) = self.index.best_match(text)?;
        if similarity <= 0.0 || similarity < self.config.similarity_threshold {
            return None;
        }
        let entry = self
            .order
            .get(position)
            .and_then(|key| self.entries.get(key))
            .filter(|e| !self.is_expired(e, now))?;
        Some(CacheHit {
            result: entry.result.clone(),
            kind: HitKind::Similar { similarity },
            matched_text: entry.text.clone(),
        })
    }
}

/// Key of the exact tier
fn cache_key(text: &str) -> String {
    let normalized = text.trim().to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Two-tier analysis result cache
///
/// Cheap to clone; all clones share the same entries.
#[derive(Clone)]
pub struct SimilarityCache {
    state: Arc<Mutex<CacheState>>,
}

impl Default for SimilarityCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl SimilarityCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                config: config.clamped(),
                saved_config: None,
                entries: HashMap::new(),
                order: Vec::new(),
                index: TfidfIndex::empty(),
                next_seq: 0,
                counters: Counters::default(),
            })),
        }
    }

    /// Look up a result for `text`
    pub fn get(&self, text: &str) -> Option<CacheHit> {
        let now = Instant::now();
        let mut state = self.state.lock();

        state.counters.total_lookups += 1;
        let sweep_every = state.config.sweep_every;
        if sweep_every > 0 && state.counters.total_lookups % sweep_every == 0 {
            let removed = state.sweep_expired(now);
            if removed > 0 {
                tracing::debug!(removed, "Swept expired cache entries");
            }
        }

        let hit = state.lookup(text, now);
        match &hit {
            Some(hit) => {
                state.counters.hits += 1;
                match hit.kind {
                    HitKind::Exact => {
                        state.counters.exact_hits += 1;
                        tracing::debug!("Cache hit (exact match)");
                    }
                    HitKind::Similar { similarity } => {
                        state.counters.similar_hits += 1;
                        tracing::debug!(similarity, "Cache hit (similarity match)");
                    }
                }
            }
            None => state.counters.misses += 1,
        }
        hit
    }

    /// Store a result for `text`
    ///
    /// Storing a text whose normalized form is already cached replaces the
    /// old entry.
    pub fn put(&self, text: &str, result: Value) {
        let key = cache_key(text);
        let mut state = self.state.lock();

        if state.entries.contains_key(&key) {
            state.remove_keys(std::slice::from_ref(&key));
        }
        let target = state.config.max_size.saturating_sub(1);
        if state.entries.len() > target {
            state.evict_down_to(target);
            tracing::debug!("Evicted oldest cache entry");
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key.clone(),
            Entry {
                result,
                text: text.to_string(),
                inserted_at: Instant::now(),
                seq,
            },
        );
        state.order.push(key);
        state.rebuild_index();

        tracing::debug!(size = state.entries.len(), "Cached analysis result");
    }

    /// Update configuration, evicting down if capacity shrank
    ///
    /// Values are clamped the same way as at construction: capacity is at
    /// least one and the threshold stays within `[0, 1]`.
    pub fn configure(&self, update: CacheConfigUpdate) {
        let mut state = self.state.lock();
        if let Some(max_size) = update.max_size {
            state.config.max_size = max_size.max(1);
        }
        if let Some(ttl_secs) = update.ttl_secs {
            state.config.ttl_secs = ttl_secs;
        }
        if let Some(threshold) = update.similarity_threshold {
            let current = state.config.similarity_threshold;
            state.config.similarity_threshold = clamp_unit(threshold, current);
        }
        let max_size = state.config.max_size;
        state.evict_down_to(max_size);

        tracing::info!(
            max_size = state.config.max_size,
            ttl_secs = state.config.ttl_secs,
            similarity_threshold = state.config.similarity_threshold,
            "Cache reconfigured"
        );
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.state.lock().config.clone()
    }

    /// Halve capacity and raise the similarity threshold
    ///
    /// The current configuration is saved for [`exit_degradation_mode`].
    /// Returns `false` if already degraded.
    ///
    /// [`exit_degradation_mode`]: Self::exit_degradation_mode
    pub fn enter_degradation_mode(&self) -> bool {
        let mut state = self.state.lock();
        if state.saved_config.is_some() {
            return false;
        }
        state.saved_config = Some(state.config.clone());

        let max_size = (state.config.max_size / 2).max(1);
        state.config.max_size = max_size;
        state.config.similarity_threshold = state
            .config
            .similarity_threshold
            .max(state.config.degraded_threshold);
        let evicted = state.evict_down_to(max_size);

        tracing::warn!(
            max_size,
            similarity_threshold = state.config.similarity_threshold,
            evicted,
            "Cache entered degradation mode"
        );
        true
    }

    /// Restore the configuration saved on entering degradation mode
    ///
    /// Returns `false` if not degraded.
    pub fn exit_degradation_mode(&self) -> bool {
        let mut state = self.state.lock();
        let Some(saved) = state.saved_config.take() else {
            return false;
        };
        state.config = saved;
        tracing::info!(
            max_size = state.config.max_size,
            similarity_threshold = state.config.similarity_threshold,
            "Cache left degradation mode"
        );
        true
    }

    /// Whether degradation mode is active
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.state.lock().saved_config.is_some()
    }

    /// Drop every entry; counters are kept
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.index = TfidfIndex::empty();
        tracing::info!("Cache cleared");
    }

    /// Number of entries held
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let c = &state.counters;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate_percent = if c.total_lookups > 0 {
            (c.hits as f64 / c.total_lookups as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        CacheStats {
            size: state.entries.len(),
            max_size: state.config.max_size,
            hits: c.hits,
            exact_hits: c.exact_hits,
            similar_hits: c.similar_hits,
            misses: c.misses,
            total_lookups: c.total_lookups,
            hit_rate_percent,
            evictions: c.evictions,
            expired: c.expired,
            similarity_threshold: state.config.similarity_threshold,
            ttl_secs: state.config.ttl_secs,
            indexed_texts: state.index.len(),
            degraded: state.saved_config.is_some(),
        }
    }
}

impl fmt::Debug for SimilarityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimilarityCache")
            .field("size", &state.entries.len())
            .field("max_size", &state.config.max_size)
            .field("degraded", &state.saved_config.is_some())
            .finish()
    }
}
