// Session counters: load attempts, outcomes, fallbacks and lookahead usage.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub loads_started: u64,
    pub loads_succeeded: u64,
    pub loads_failed: u64,
    pub proxy_fallbacks: u64,
    pub preload_hits: u64,
    pub preloads_stored: u64,
    pub stale_dropped: u64,
}

impl StatsSnapshot {
    /// Share of started loads served from the lookahead queue.
    pub fn preload_hit_rate(&self) -> f64 {
        if self.loads_started > 0 {
            self.preload_hits as f64 / self.loads_started as f64
        } else {
            0.0
        }
    }
}

#[derive(Default)]
pub struct SessionStats {
    loads_started: AtomicU64,
    loads_succeeded: AtomicU64,
    loads_failed: AtomicU64,
    proxy_fallbacks: AtomicU64,
    preload_hits: AtomicU64,
    preloads_stored: AtomicU64,
    stale_dropped: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_load_started(&self) {
        self.loads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.loads_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.loads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.proxy_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preload_hit(&self) {
        self.preload_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preload_stored(&self) {
        self.preloads_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            loads_started: self.loads_started.load(Ordering::Relaxed),
            loads_succeeded: self.loads_succeeded.load(Ordering::Relaxed),
            loads_failed: self.loads_failed.load(Ordering::Relaxed),
            proxy_fallbacks: self.proxy_fallbacks.load(Ordering::Relaxed),
            preload_hits: self.preload_hits.load(Ordering::Relaxed),
            preloads_stored: self.preloads_stored.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = SessionStats::new();
        stats.record_load_started();
        stats.record_load_started();
        stats.record_load_started();
        stats.record_load_started();
        stats.record_preload_hit();
        stats.record_success();
        stats.record_failure();
        stats.record_fallback();
        stats.record_stale();

        let snap = stats.snapshot();
        assert_eq!(snap.loads_started, 4);
        assert_eq!(snap.loads_succeeded, 1);
        assert_eq!(snap.loads_failed, 1);
        assert_eq!(snap.proxy_fallbacks, 1);
        assert_eq!(snap.stale_dropped, 1);
        assert!((snap.preload_hit_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_hit_rate() {
        assert_eq!(StatsSnapshot::default().preload_hit_rate(), 0.0);
    }
}
