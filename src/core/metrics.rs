// src/core/metrics.rs

//! Ambient process counters. No exporter is wired up (metrics scraping
//! and alerting are out of scope); these exist so logs and an eventual
//! `INFO`-style surface have something to read. Plain atomics behind
//! `once_cell::Lazy` statics, not a metrics-registry crate, since the
//! whole surface is six counters.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub struct Counter(AtomicU64);

impl Counter {
    const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct Gauge(AtomicI64);

impl Gauge {
    const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub static CONNECTIONS_ACCEPTED: Lazy<Counter> = Lazy::new(Counter::new);
pub static CONNECTIONS_ACTIVE: Lazy<Gauge> = Lazy::new(Gauge::new);
pub static COMMANDS_PROCESSED: Lazy<Counter> = Lazy::new(Counter::new);
pub static REPLICAS_CONNECTED: Lazy<Gauge> = Lazy::new(Gauge::new);
pub static REPLICATED_COMMANDS: Lazy<Counter> = Lazy::new(Counter::new);
pub static MASTER_OFFSET: Lazy<Gauge> = Lazy::new(Gauge::new);

/// A point-in-time text rendering, Prometheus-exposition-ish but not
/// actually scraped by anything; useful from `INFO` and for tests.
pub fn render() -> String {
    format!(
        "connections_accepted {}\n\
         connections_active {}\n\
         commands_processed {}\n\
         replicas_connected {}\n\
         replicated_commands {}\n\
         master_offset {}\n",
        CONNECTIONS_ACCEPTED.get(),
        CONNECTIONS_ACTIVE.get(),
        COMMANDS_PROCESSED.get(),
        REPLICAS_CONNECTED.get(),
        REPLICATED_COMMANDS.get(),
        MASTER_OFFSET.get(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let before = COMMANDS_PROCESSED.get();
        COMMANDS_PROCESSED.inc();
        assert_eq!(COMMANDS_PROCESSED.get(), before + 1);
    }

    #[test]
    fn gauge_tracks_sign() {
        REPLICAS_CONNECTED.set(0);
        REPLICAS_CONNECTED.inc();
        REPLICAS_CONNECTED.inc();
        REPLICAS_CONNECTED.dec();
        assert_eq!(REPLICAS_CONNECTED.get(), 1);
    }

    #[test]
    fn render_includes_every_metric_name() {
        let text = render();
        assert!(text.contains("connections_active"));
        assert!(text.contains("master_offset"));
    }
}
