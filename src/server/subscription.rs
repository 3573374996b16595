//! Server-side subscription: a container of monitored items.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::monitoring::{DiagnosticsSnapshot, MonitoredItem, SubscriptionDiagnostics};
use crate::service::MonitoredItemNotification;

/// Revised publishing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionParameters {
    pub publishing_interval: f64,
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
}

pub struct ServerSubscription {
    id: u32,
    parameters: RwLock<SubscriptionParameters>,
    publishing_enabled: AtomicBool,
    items: RwLock<HashMap<u32, Arc<MonitoredItem>>>,
    diagnostics: Arc<SubscriptionDiagnostics>,
}

impl ServerSubscription {
    pub fn new(id: u32, parameters: SubscriptionParameters, publishing_enabled: bool) -> Self {
        Self {
            id,
            parameters: RwLock::new(parameters),
            publishing_enabled: AtomicBool::new(publishing_enabled),
            items: RwLock::new(HashMap::new()),
            diagnostics: Arc::new(SubscriptionDiagnostics::new(id)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn parameters(&self) -> SubscriptionParameters {
        *self.parameters.read()
    }

    pub fn set_parameters(&self, parameters: SubscriptionParameters) {
        *self.parameters.write() = parameters;
    }

    pub fn publishing_enabled(&self) -> bool {
        self.publishing_enabled.load(Ordering::Acquire)
    }

    pub fn set_publishing_enabled(&self, enabled: bool) {
        self.publishing_enabled.store(enabled, Ordering::Release);
    }

    pub fn diagnostics(&self) -> &Arc<SubscriptionDiagnostics> {
        &self.diagnostics
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn item(&self, id: u32) -> Option<Arc<MonitoredItem>> {
        self.items.read().get(&id).cloned()
    }

    /// All items ordered by id.
    pub fn items(&self) -> Vec<Arc<MonitoredItem>> {
        let mut items: Vec<_> = self.items.read().values().cloned().collect();
        items.sort_by_key(|i| i.id());
        items
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub(crate) fn insert_item(&self, item: Arc<MonitoredItem>) {
        self.items.write().insert(item.id(), item);
    }

    pub(crate) fn remove_item(&self, id: u32) -> Option<Arc<MonitoredItem>> {
        self.items.write().remove(&id)
    }

    pub(crate) fn drain_items(&self) -> Vec<Arc<MonitoredItem>> {
        self.items.write().drain().map(|(_, item)| item).collect()
    }

    /// Drain every item's pending values into notifications, ordered by item id.
    ///
    /// Nothing is drained while publishing is disabled; values stay queued.
    pub fn collect_notifications(&self) -> Vec<MonitoredItemNotification> {
        if !self.publishing_enabled() {
            return Vec::new();
        }

        let mut notifications = Vec::new();
        for item in self.items() {
            let client_handle = item.client_handle();
            notifications.extend(
                item.take_notifications()
                    .into_iter()
                    .map(|value| MonitoredItemNotification { client_handle, value }),
            );
        }
        notifications
    }
}
