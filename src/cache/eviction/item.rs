//! Item policies rank mapped objects and pick eviction victims.
//!
//! Tier managers report every map change through [`ItemObserver`]. Recency
//! is measured on a logical clock that advances on every add, access and
//! update, so rankings do not depend on wall-clock resolution. LIFE and EXD
//! additionally use wall-clock age.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::key::CacheKey;
use crate::config::ItemPolicyKind;

/// Notifications about mapped objects
pub trait ItemObserver: Send + Sync {
    fn on_item_add(&self, key: &CacheKey, size: u64);
    fn on_item_access(&self, key: &CacheKey);
    fn on_item_update(&self, key: &CacheKey, size: u64);
    fn on_item_delete(&self, key: &CacheKey);
}

/// Victim selection
pub trait ItemPolicy: ItemObserver {
    /// Best victim not in `exclude`; the item stays tracked until deleted
    fn next_victim(&self, exclude: &HashSet<CacheKey>) -> Option<CacheKey>;

    /// Tracked items
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Victim ranking
#[derive(Debug, Clone, PartialEq)]
pub enum Ranking {
    /// Oldest insertion first
    Fifo,
    /// Least recently used first
    Lru,
    /// Most recently used first
    Mru,
    /// Fewest accesses first, ties by recency
    Lfu,
    /// Lowest combined recency/frequency value; `lambda` in 0..=1 moves the
    /// ranking from LFU (0) towards LRU (1)
    Lrfu { lambda: f64 },
    /// Objects used within `window` are protected; among the rest the
    /// largest goes first
    Life { window: Duration },
    /// Lowest exponentially decayed access score
    Exd { half_life: Duration },
}

impl From<&ItemPolicyKind> for Ranking {
    fn from(kind: &ItemPolicyKind) -> Self {
        match kind {
            ItemPolicyKind::Fifo => Ranking::Fifo,
            ItemPolicyKind::Lru => Ranking::Lru,
            ItemPolicyKind::Mru => Ranking::Mru,
            ItemPolicyKind::Lfu => Ranking::Lfu,
            ItemPolicyKind::Lrfu { lambda } => Ranking::Lrfu { lambda: *lambda },
            ItemPolicyKind::Life { window_secs } => Ranking::Life {
                window: Duration::from_secs(*window_secs),
            },
            ItemPolicyKind::Exd { half_life_secs } => Ranking::Exd {
                half_life: Duration::from_secs_f64(*half_life_secs),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct ItemStats {
    /// Insertion order
    seq: u64,
    /// Logical time of the last reference
    last_tick: u64,
    last_access: Instant,
    accesses: u64,
    /// Combined recency and frequency value at `last_tick`
    crf: f64,
    /// Decayed access score at `last_access`
    exd: f64,
    size: u64,
}

#[derive(Debug, Default)]
struct PolicyState {
    items: HashMap<CacheKey, ItemStats>,
    tick: u64,
    seq: u64,
}

/// Item policy parameterised by a [`Ranking`]
#[derive(Debug)]
pub struct RankedItemPolicy {
    ranking: Ranking,
    state: Mutex<PolicyState>,
}

impl RankedItemPolicy {
    pub fn new(ranking: Ranking) -> Self {
        Self {
            ranking,
            state: Mutex::new(PolicyState::default()),
        }
    }

    pub fn ranking(&self) -> &Ranking {
        &self.ranking
    }

    fn decay(lambda: f64, elapsed_ticks: u64) -> f64 {
        0.5f64.powf(lambda * elapsed_ticks as f64)
    }

    fn half_life_decay(half_life: Duration, elapsed: Duration) -> f64 {
        0.5f64.powf(elapsed.as_secs_f64() / half_life.as_secs_f64())
    }

    fn reference(&self, stats: &mut ItemStats, tick: u64, now: Instant) {
        if let Ranking::Lrfu { lambda } = self.ranking {
            stats.crf = 1.0 + Self::decay(lambda, tick - stats.last_tick) * stats.crf;
        }
        if let Ranking::Exd { half_life } = self.ranking {
            stats.exd =
                1.0 + Self::half_life_decay(half_life, now - stats.last_access) * stats.exd;
        }
        stats.accesses += 1;
        stats.last_tick = tick;
        stats.last_access = now;
    }

    /// Lower score is evicted first
    fn score(&self, stats: &ItemStats, tick: u64, now: Instant) -> f64 {
        match self.ranking {
            Ranking::Fifo => stats.seq as f64,
            Ranking::Lru => stats.last_tick as f64,
            Ranking::Mru => -(stats.last_tick as f64),
            Ranking::Lfu => stats.accesses as f64,
            Ranking::Lrfu { lambda } => {
                stats.crf * Self::decay(lambda, tick - stats.last_tick)
            }
            Ranking::Exd { half_life } => {
                stats.exd * Self::half_life_decay(half_life, now - stats.last_access)
            }
            Ranking::Life { .. } => stats.last_tick as f64,
        }
    }
}

impl ItemObserver for RankedItemPolicy {
    fn on_item_add(&self, key: &CacheKey, size: u64) {
        let mut state = self.state.lock();
        state.tick += 1;
        state.seq += 1;
        let (tick, seq) = (state.tick, state.seq);
        state.items.insert(
            key.clone(),
            ItemStats {
                seq,
                last_tick: tick,
                last_access: Instant::now(),
                accesses: 1,
                crf: 1.0,
                exd: 1.0,
                size,
            },
        );
    }

    fn on_item_access(&self, key: &CacheKey) {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        if let Some(stats) = state.items.get_mut(key) {
            self.reference(stats, tick, Instant::now());
        }
    }

    fn on_item_update(&self, key: &CacheKey, size: u64) {
        let mut state = self.state.lock();
        state.tick += 1;
        state.seq += 1;
        let (tick, seq) = (state.tick, state.seq);
        if let Some(stats) = state.items.get_mut(key) {
            self.reference(stats, tick, Instant::now());
            stats.seq = seq;
            stats.size = size;
            return;
        }
        drop(state);
        self.on_item_add(key, size);
    }

    fn on_item_delete(&self, key: &CacheKey) {
        self.state.lock().items.remove(key);
    }
}

impl ItemPolicy for RankedItemPolicy {
    fn next_victim(&self, exclude: &HashSet<CacheKey>) -> Option<CacheKey> {
        let state = self.state.lock();
        let now = Instant::now();
        let candidates = state.items.iter().filter(|(k, _)| !exclude.contains(*k));

        if let Ranking::Life { window } = self.ranking {
            let stale = candidates
                .clone()
                .filter(|(_, s)| now.duration_since(s.last_access) >= window)
                .max_by(|(_, a), (_, b)| a.size.cmp(&b.size).then(b.last_tick.cmp(&a.last_tick)));
            if let Some((key, _)) = stale {
                return Some(key.clone());
            }
        }

        candidates
            .min_by(|(_, a), (_, b)| {
                self.score(a, state.tick, now)
                    .total_cmp(&self.score(b, state.tick, now))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|(key, _)| key.clone())
    }

    fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
