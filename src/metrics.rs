//! Publish and delivery counters
//!
//! Every backend adapter owns one `BrokerMetrics` and bumps it from its
//! publish path and delivery loops. Counters only — exporting them is the
//! host application's business.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared between a broker and its delivery loops
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    published: AtomicU64,
    publish_errors: AtomicU64,
    delivered: AtomicU64,
    decode_errors: AtomicU64,
    handler_errors: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    dropped: AtomicU64,
}

impl BrokerMetrics {
    /// Messages handed to the backend by `publish`
    pub fn incr_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// `publish` calls that returned an error
    pub fn incr_publish_errors(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Handler invocations (decode failures are not deliveries)
    pub fn incr_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Inbound messages dropped because their payload would not decode
    pub fn incr_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Handler invocations that returned an error
    pub fn incr_handler_errors(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful acknowledgements
    pub fn incr_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    /// Negative acknowledgements
    pub fn incr_nacked(&self) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages dropped before dispatch (e.g., a full subscriber buffer)
    pub fn incr_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.published.store(0, Ordering::Relaxed);
        self.publish_errors.store(0, Ordering::Relaxed);
        self.delivered.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
        self.handler_errors.store(0, Ordering::Relaxed);
        self.acked.store(0, Ordering::Relaxed);
        self.nacked.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

/// Serializable view of `BrokerMetrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub published: u64,
    pub publish_errors: u64,
    pub delivered: u64,
    pub decode_errors: u64,
    pub handler_errors: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dropped: u64,
}
