//! Per-subscription diagnostics counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every item of one subscription.
///
/// Handed to items and the sampling path explicitly so that two
/// subscriptions never share a counter.
#[derive(Debug, Default)]
pub struct SubscriptionDiagnostics {
    subscription_id: u32,
    monitoring_queue_overflow_count: AtomicU64,
    data_change_count: AtomicU64,
    sampling_error_count: AtomicU64,
}

/// Point-in-time copy of [`SubscriptionDiagnostics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub subscription_id: u32,
    pub monitoring_queue_overflow_count: u64,
    pub data_change_count: u64,
    pub sampling_error_count: u64,
}

impl SubscriptionDiagnostics {
    pub fn new(subscription_id: u32) -> Self {
        Self {
            subscription_id,
            ..Default::default()
        }
    }

    pub fn subscription_id(&self) -> u32 {
        self.subscription_id
    }

    #[inline]
    pub fn record_overflow(&self) {
        self.monitoring_queue_overflow_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_data_change(&self) {
        self.data_change_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sampling_error(&self) {
        self.sampling_error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overflow_count(&self) -> u64 {
        self.monitoring_queue_overflow_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            subscription_id: self.subscription_id,
            monitoring_queue_overflow_count: self.overflow_count(),
            data_change_count: self.data_change_count.load(Ordering::Relaxed),
            sampling_error_count: self.sampling_error_count.load(Ordering::Relaxed),
        }
    }
}
