//! Fire-and-forget telemetry sink.
//!
//! The pipeline only ever calls into a [`MetricsSink`]; nothing it returns is consumed.
//! [`CounterMetrics`] keeps plain counters for the status endpoint.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::ErrorKind;

/// Receives counters from the poller, dispatcher and outbound queue. All methods default to no-ops.
pub trait MetricsSink: Send + Sync {
    fn record_message_sent(&self) {}
    fn record_queued(&self) {}
    /// A sender was denied by a command-class rate limiter.
    fn record_rate_limit(&self) {}
    /// The platform answered a send with 429.
    fn record_platform_rate_limit(&self) {}
    fn record_retry(&self) {}
    fn record_error(&self, _kind: ErrorKind) {}
    fn record_command(&self, _name: &str) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// In-process counters.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    messages_sent: AtomicU64,
    queued: AtomicU64,
    rate_limited: AtomicU64,
    platform_rate_limited: AtomicU64,
    retries: AtomicU64,
    errors: Mutex<BTreeMap<&'static str, u64>>,
    commands: Mutex<BTreeMap<String, u64>>,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub queued: u64,
    /// Admission denials by the dispatcher.
    pub rate_limited: u64,
    /// 429 responses from the platform.
    pub platform_rate_limited: u64,
    pub retries: u64,
    pub errors: BTreeMap<String, u64>,
    pub commands: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn errors_of(&self, kind: ErrorKind) -> u64 {
        self.errors.get(kind.as_str()).copied().unwrap_or(0)
    }
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors = match self.errors.lock() {
            Ok(g) => g.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            Err(_) => BTreeMap::new(),
        };
        let commands = match self.commands.lock() {
            Ok(g) => g.clone(),
            Err(_) => BTreeMap::new(),
        };
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            platform_rate_limited: self.platform_rate_limited.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors,
            commands,
        }
    }
}

impl MetricsSink for CounterMetrics {
    fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rate_limit(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn record_platform_rate_limit(&self) {
        self.platform_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, kind: ErrorKind) {
        if let Ok(mut g) = self.errors.lock() {
            *g.entry(kind.as_str()).or_insert(0) += 1;
        }
    }

    fn record_command(&self, name: &str) {
        if let Ok(mut g) = self.commands.lock() {
            *g.entry(name.to_string()).or_insert(0) += 1;
        }
    }
}
