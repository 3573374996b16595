//! Client subscription and monitored item reconciliation.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

use super::{
    BatchChangeListener, BatchOutcome, ClientError, ClientMonitoredItem, ItemOutcome, ServerItemState,
    SynchronizationFailure,
};
use crate::config::ClientConfig;
use crate::service::*;
use crate::types::{DataValue, MonitoringMode, MonitoringParameters, ReadValueId, StatusCode};

const KEEP_ALIVE_TARGET_MS: f64 = 10_000.0;
const LIFETIME_TARGET_MS: f64 = 60_000.0;

/// Lifetime and keep-alive counts derived from a publishing interval.
///
/// Keep-alive covers about ten seconds, lifetime at least a minute and never
/// less than three keep-alive periods. Returns `(lifetime, keep_alive)`.
pub fn default_counts(publishing_interval: f64) -> (u32, u32) {
    if publishing_interval.is_nan() || publishing_interval <= 0.0 {
        return (60, 10);
    }
    let keep_alive = ((KEEP_ALIVE_TARGET_MS / publishing_interval).ceil() as u32).max(1);
    let lifetime = keep_alive
        .saturating_mul(3)
        .max((LIFETIME_TARGET_MS / publishing_interval).ceil() as u32);
    (lifetime, keep_alive)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not created on the server.
    Initial,
    Synchronized,
    /// Local parameters changed since the server last confirmed them.
    Unsynchronized,
}

/// Publishing parameters as requested locally.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSettings {
    pub publishing_interval: f64,
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
    pub publishing_enabled: bool,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        let publishing_interval = 1000.0;
        let (lifetime_count, max_keep_alive_count) = default_counts(publishing_interval);
        Self {
            publishing_interval,
            lifetime_count,
            max_keep_alive_count,
            max_notifications_per_publish: 0,
            priority: 0,
            publishing_enabled: true,
        }
    }
}

/// Values the server granted in the last create or modify.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RevisedSettings {
    pub publishing_interval: f64,
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
}

#[derive(Debug)]
struct SubscriptionState {
    subscription_id: u32,
    sync_state: SyncState,
    requested: SubscriptionSettings,
    revised: Option<RevisedSettings>,
    auto_calculate: bool,
}

impl SubscriptionState {
    fn mark_changed(&mut self) {
        if self.sync_state != SyncState::Initial {
            self.sync_state = SyncState::Unsynchronized;
        }
    }

    fn apply_auto_counts(&mut self) {
        if self.auto_calculate {
            let (lifetime, keep_alive) = default_counts(self.requested.publishing_interval);
            self.requested.lifetime_count = lifetime;
            self.requested.max_keep_alive_count = keep_alive;
        }
    }
}

/// A subscription declared on the client and mirrored on a server.
///
/// Every async operation has a `*_blocking` twin that drives the same
/// future on the runtime handle given at construction; those must not be
/// called from inside that runtime.
pub struct ClientSubscription {
    service: Arc<dyn SubscriptionService>,
    runtime: Handle,
    config: ClientConfig,
    state: Mutex<SubscriptionState>,
    items: DashMap<u32, Arc<ClientMonitoredItem>>,
    items_by_server_id: DashMap<u32, Arc<ClientMonitoredItem>>,
    next_client_handle: AtomicU32,
    last_sequence_number: AtomicU32,
    batch_listeners: RwLock<Vec<Arc<dyn BatchChangeListener>>>,
}

impl ClientSubscription {
    pub fn new(service: Arc<dyn SubscriptionService>, config: ClientConfig, runtime: Handle) -> Self {
        Self::with_settings(service, config, runtime, SubscriptionSettings::default())
    }

    pub fn with_settings(
        service: Arc<dyn SubscriptionService>,
        config: ClientConfig,
        runtime: Handle,
        settings: SubscriptionSettings,
    ) -> Self {
        Self {
            service,
            runtime,
            config,
            state: Mutex::new(SubscriptionState {
                subscription_id: 0,
                sync_state: SyncState::Initial,
                requested: settings,
                revised: None,
                auto_calculate: true,
            }),
            items: DashMap::new(),
            items_by_server_id: DashMap::new(),
            next_client_handle: AtomicU32::new(1),
            last_sequence_number: AtomicU32::new(0),
            batch_listeners: RwLock::new(Vec::new()),
        }
    }

    /// Server-assigned id, or `None` before creation.
    pub fn subscription_id(&self) -> Option<u32> {
        let state = self.state.lock();
        match state.sync_state {
            SyncState::Initial => None,
            _ => Some(state.subscription_id),
        }
    }

    pub fn sync_state(&self) -> SyncState {
        self.state.lock().sync_state
    }

    pub fn settings(&self) -> SubscriptionSettings {
        self.state.lock().requested.clone()
    }

    pub fn revised(&self) -> Option<RevisedSettings> {
        self.state.lock().revised
    }

    pub fn last_sequence_number(&self) -> u32 {
        self.last_sequence_number.load(Ordering::Acquire)
    }

    pub fn set_publishing_interval(&self, interval: f64) {
        let mut state = self.state.lock();
        state.requested.publishing_interval = interval;
        state.mark_changed();
    }

    pub fn set_lifetime_count(&self, count: u32) {
        let mut state = self.state.lock();
        state.requested.lifetime_count = count;
        state.mark_changed();
    }

    pub fn set_max_keep_alive_count(&self, count: u32) {
        let mut state = self.state.lock();
        state.requested.max_keep_alive_count = count;
        state.mark_changed();
    }

    pub fn set_max_notifications_per_publish(&self, max: u32) {
        let mut state = self.state.lock();
        state.requested.max_notifications_per_publish = max;
        state.mark_changed();
    }

    pub fn set_priority(&self, priority: u8) {
        let mut state = self.state.lock();
        state.requested.priority = priority;
        state.mark_changed();
    }

    /// Whether create and modify derive lifetime and keep-alive counts from
    /// the publishing interval (on by default).
    pub fn set_auto_calculate(&self, enabled: bool) {
        self.state.lock().auto_calculate = enabled;
    }

    pub fn add_batch_listener(&self, listener: Arc<dyn BatchChangeListener>) {
        self.batch_listeners.write().push(listener);
    }

    /// Declare a new item. It is created on the server by the next
    /// synchronization or an explicit create call.
    pub fn add_item(&self, target: ReadValueId, parameters: MonitoringParameters) -> Arc<ClientMonitoredItem> {
        let handle = self.next_client_handle.fetch_add(1, Ordering::Relaxed);
        let item = Arc::new(ClientMonitoredItem::new(handle, target, parameters));
        self.items.insert(handle, item.clone());
        item
    }

    /// Stop declaring an item. A created item is deleted from the server by
    /// the next synchronization.
    pub fn remove_item(&self, client_handle: u32) -> Option<Arc<ClientMonitoredItem>> {
        self.items.remove(&client_handle).map(|(_, item)| item)
    }

    pub fn item(&self, client_handle: u32) -> Option<Arc<ClientMonitoredItem>> {
        self.items.get(&client_handle).map(|e| e.value().clone())
    }

    pub fn item_by_server_id(&self, monitored_item_id: u32) -> Option<Arc<ClientMonitoredItem>> {
        self.items_by_server_id.get(&monitored_item_id).map(|e| e.value().clone())
    }

    /// Declared items ordered by client handle.
    pub fn items(&self) -> Vec<Arc<ClientMonitoredItem>> {
        let mut items: Vec<_> = self.items.iter().map(|e| e.value().clone()).collect();
        items.sort_by_key(|i| i.client_handle());
        items
    }

    /// Latest received value of every declared item, by client handle.
    pub fn values(&self) -> Vec<(u32, Option<DataValue>)> {
        self.items().iter().map(|i| (i.client_handle(), i.value())).collect()
    }

    fn require_id(&self) -> Result<u32, ClientError> {
        self.subscription_id().ok_or(ClientError::NotCreated)
    }

    /// Create the subscription on the server. No-op once created.
    pub async fn create(&self) -> Result<(), ClientError> {
        let request = {
            let mut state = self.state.lock();
            if state.sync_state != SyncState::Initial {
                return Ok(());
            }
            state.apply_auto_counts();
            CreateSubscriptionRequest {
                requested_publishing_interval: state.requested.publishing_interval,
                requested_lifetime_count: state.requested.lifetime_count,
                requested_max_keep_alive_count: state.requested.max_keep_alive_count,
                max_notifications_per_publish: state.requested.max_notifications_per_publish,
                publishing_enabled: state.requested.publishing_enabled,
                priority: state.requested.priority,
            }
        };

        let response = self.service.create_subscription(request).await?;

        let mut state = self.state.lock();
        state.subscription_id = response.subscription_id;
        state.revised = Some(RevisedSettings {
            publishing_interval: response.revised_publishing_interval,
            lifetime_count: response.revised_lifetime_count,
            max_keep_alive_count: response.revised_max_keep_alive_count,
        });
        state.sync_state = SyncState::Synchronized;
        tracing::info!(
            "ClientSubscription: Created subscription {} ({}ms)",
            response.subscription_id,
            response.revised_publishing_interval
        );
        Ok(())
    }

    /// Push locally changed publishing parameters to the server and adopt
    /// the revised values it returns.
    pub async fn modify(&self) -> Result<(), ClientError> {
        let request = {
            let mut state = self.state.lock();
            if state.sync_state == SyncState::Initial {
                return Err(ClientError::NotCreated);
            }
            state.apply_auto_counts();
            ModifySubscriptionRequest {
                subscription_id: state.subscription_id,
                requested_publishing_interval: state.requested.publishing_interval,
                requested_lifetime_count: state.requested.lifetime_count,
                requested_max_keep_alive_count: state.requested.max_keep_alive_count,
                max_notifications_per_publish: state.requested.max_notifications_per_publish,
                priority: state.requested.priority,
            }
        };

        let response = self.service.modify_subscription(request).await?;

        let mut state = self.state.lock();
        state.revised = Some(RevisedSettings {
            publishing_interval: response.revised_publishing_interval,
            lifetime_count: response.revised_lifetime_count,
            max_keep_alive_count: response.revised_max_keep_alive_count,
        });
        state.sync_state = SyncState::Synchronized;
        Ok(())
    }

    /// Delete the subscription from the server. No-op when never created.
    pub async fn delete(&self) -> Result<(), ClientError> {
        let id = {
            let state = self.state.lock();
            if state.sync_state == SyncState::Initial {
                return Ok(());
            }
            state.subscription_id
        };

        let results = self.service.delete_subscriptions(vec![id]).await?;
        let status = results.first().copied().unwrap_or(StatusCode::BAD_INTERNAL_ERROR);
        // already gone on the server counts as deleted
        if status.is_bad() && status != StatusCode::BAD_SUBSCRIPTION_ID_INVALID {
            return Err(ClientError::Operation(status));
        }

        self.items_by_server_id.clear();
        for item in self.items.iter() {
            item.set_server_state(None);
        }

        let mut state = self.state.lock();
        state.subscription_id = 0;
        state.revised = None;
        state.sync_state = SyncState::Initial;
        tracing::info!("ClientSubscription: Deleted subscription {}", id);
        Ok(())
    }

    /// Issue one call per chunk of at most `max_items_per_call` items and
    /// collect per-item outcomes in input order.
    ///
    /// `apply` receives each item with its positional result and returns the
    /// operation status; it updates the local mirror only for good results.
    async fn chunked<R, Fut>(
        &self,
        items: &[Arc<ClientMonitoredItem>],
        call: impl Fn(&[Arc<ClientMonitoredItem>]) -> Fut,
        apply: impl Fn(&Arc<ClientMonitoredItem>, &R) -> StatusCode,
    ) -> BatchOutcome
    where
        Fut: Future<Output = Result<Vec<R>, ServiceFault>>,
    {
        let chunk_size = match self.config.max_items_per_call {
            0 => items.len().max(1),
            n => n,
        };

        let mut outcome = BatchOutcome::default();
        for chunk in items.chunks(chunk_size) {
            let results = match call(chunk).await {
                Ok(results) if results.len() == chunk.len() => results,
                Ok(results) => {
                    tracing::warn!(
                        "ClientSubscription: Expected {} results, got {}",
                        chunk.len(),
                        results.len()
                    );
                    outcome.chunks.push(fault_chunk(chunk, StatusCode::BAD_INTERNAL_ERROR));
                    continue;
                }
                Err(fault) => {
                    tracing::warn!("ClientSubscription: Chunk of {} items failed: {}", chunk.len(), fault);
                    outcome.chunks.push(fault_chunk(chunk, fault.status_code()));
                    continue;
                }
            };

            let chunk_outcomes = chunk
                .iter()
                .zip(results.iter())
                .map(|(item, result)| {
                    let status = apply(item, result);
                    item.set_status(status);
                    ItemOutcome {
                        item: item.clone(),
                        service_status: StatusCode::GOOD,
                        operation_status: status,
                    }
                })
                .collect();
            outcome.chunks.push(chunk_outcomes);
        }
        outcome
    }

    pub async fn create_monitored_items(
        &self,
        items: &[Arc<ClientMonitoredItem>],
    ) -> Result<BatchOutcome, ClientError> {
        let subscription_id = self.require_id()?;

        let outcome = self
            .chunked(
                items,
                |chunk| {
                    let requests: Vec<MonitoredItemCreateRequest> = chunk
                        .iter()
                        .map(|item| MonitoredItemCreateRequest {
                            item_to_monitor: item.target().clone(),
                            monitoring_mode: item.monitoring_mode(),
                            requested_parameters: item.parameters(),
                        })
                        .collect();
                    let service = self.service.clone();
                    async move { service.create_monitored_items(subscription_id, requests).await }
                },
                |item, result: &MonitoredItemCreateResult| {
                    if result.status_code.is_good() {
                        item.set_server_state(Some(ServerItemState {
                            monitored_item_id: result.monitored_item_id,
                            requested: item.parameters(),
                            monitoring_mode: item.monitoring_mode(),
                            revised_sampling_interval: result.revised_sampling_interval,
                            revised_queue_size: result.revised_queue_size,
                        }));
                        self.items_by_server_id.insert(result.monitored_item_id, item.clone());
                    }
                    result.status_code
                },
            )
            .await;

        Ok(outcome)
    }

    pub async fn modify_monitored_items(
        &self,
        items: &[Arc<ClientMonitoredItem>],
    ) -> Result<BatchOutcome, ClientError> {
        let subscription_id = self.require_id()?;

        let outcome = self
            .chunked(
                items,
                |chunk| {
                    let requests: Vec<MonitoredItemModifyRequest> = chunk
                        .iter()
                        .map(|item| MonitoredItemModifyRequest {
                            monitored_item_id: item.monitored_item_id().unwrap_or(0),
                            requested_parameters: item.parameters(),
                        })
                        .collect();
                    let service = self.service.clone();
                    async move { service.modify_monitored_items(subscription_id, requests).await }
                },
                |item, result: &MonitoredItemModifyResult| {
                    if result.status_code.is_good() {
                        item.confirm_modify(
                            item.parameters(),
                            result.revised_sampling_interval,
                            result.revised_queue_size,
                        );
                    }
                    result.status_code
                },
            )
            .await;

        Ok(outcome)
    }

    pub async fn delete_monitored_items(
        &self,
        items: &[Arc<ClientMonitoredItem>],
    ) -> Result<BatchOutcome, ClientError> {
        let subscription_id = self.require_id()?;

        let outcome = self
            .chunked(
                items,
                |chunk| {
                    let ids: Vec<u32> = chunk.iter().map(|i| i.monitored_item_id().unwrap_or(0)).collect();
                    let service = self.service.clone();
                    async move { service.delete_monitored_items(subscription_id, ids).await }
                },
                |item, status: &StatusCode| {
                    if status.is_good() {
                        if let Some(id) = item.monitored_item_id() {
                            self.items_by_server_id.remove(&id);
                        }
                        item.set_server_state(None);
                        self.items.remove_if(&item.client_handle(), |_, v| Arc::ptr_eq(v, item));
                    }
                    *status
                },
            )
            .await;

        Ok(outcome)
    }

    pub async fn set_monitoring_mode(
        &self,
        mode: MonitoringMode,
        items: &[Arc<ClientMonitoredItem>],
    ) -> Result<BatchOutcome, ClientError> {
        let subscription_id = self.require_id()?;

        let outcome = self
            .chunked(
                items,
                |chunk| {
                    let ids: Vec<u32> = chunk.iter().map(|i| i.monitored_item_id().unwrap_or(0)).collect();
                    let service = self.service.clone();
                    async move { service.set_monitoring_mode(subscription_id, mode, ids).await }
                },
                |item, status: &StatusCode| {
                    if status.is_good() {
                        item.confirm_mode(mode);
                    }
                    *status
                },
            )
            .await;

        Ok(outcome)
    }

    pub async fn set_publishing_mode(&self, enabled: bool) -> Result<(), ClientError> {
        let subscription_id = self.require_id()?;

        let results = self.service.set_publishing_mode(enabled, vec![subscription_id]).await?;
        let status = results.first().copied().unwrap_or(StatusCode::BAD_INTERNAL_ERROR);
        if !status.is_good() {
            return Err(ClientError::Operation(status));
        }

        self.state.lock().requested.publishing_enabled = enabled;
        Ok(())
    }

    /// Link `links` to a triggering item on the server.
    pub async fn set_triggering(
        &self,
        triggering_item: &ClientMonitoredItem,
        links_to_add: &[Arc<ClientMonitoredItem>],
        links_to_remove: &[Arc<ClientMonitoredItem>],
    ) -> Result<SetTriggeringResponse, ClientError> {
        let subscription_id = self.require_id()?;
        let trigger_id = triggering_item
            .monitored_item_id()
            .ok_or(ClientError::Operation(StatusCode::BAD_MONITORED_ITEM_ID_INVALID))?;

        let ids = |items: &[Arc<ClientMonitoredItem>]| -> Vec<u32> {
            items.iter().map(|i| i.monitored_item_id().unwrap_or(0)).collect()
        };

        let response = self
            .service
            .set_triggering(subscription_id, trigger_id, ids(links_to_add), ids(links_to_remove))
            .await?;
        Ok(response)
    }

    /// Reconcile declared items with the server.
    ///
    /// Creates undeclared-remotely items, modifies items whose parameters
    /// changed, deletes items no longer declared, then applies pending
    /// monitoring mode changes. Every pass runs even when an earlier one had
    /// failures; any failed item yields [`ClientError::SynchronizationFailed`].
    pub async fn synchronize_monitored_items(&self) -> Result<(), ClientError> {
        self.require_id()?;

        let declared = self.items();
        let to_create: Vec<_> = declared.iter().filter(|i| !i.is_created()).cloned().collect();
        let to_modify: Vec<_> = declared.iter().filter(|i| i.needs_modify()).cloned().collect();
        let mut to_delete: Vec<_> = self
            .items_by_server_id
            .iter()
            .filter(|e| {
                self.items
                    .get(&e.value().client_handle())
                    .map_or(true, |declared| !Arc::ptr_eq(declared.value(), e.value()))
            })
            .map(|e| e.value().clone())
            .collect();
        to_delete.sort_by_key(|i| i.client_handle());

        tracing::debug!(
            "ClientSubscription: Synchronizing: {} to create, {} to modify, {} to delete",
            to_create.len(),
            to_modify.len(),
            to_delete.len()
        );

        let mut failure = SynchronizationFailure {
            create_results: self.create_monitored_items(&to_create).await?,
            modify_results: self.modify_monitored_items(&to_modify).await?,
            delete_results: self.delete_monitored_items(&to_delete).await?,
            ..Default::default()
        };

        // items that just got created carry their desired mode already
        let mode_changes: Vec<_> = self.items().into_iter().filter(|i| i.needs_mode_change()).collect();
        for mode in [MonitoringMode::Disabled, MonitoringMode::Sampling, MonitoringMode::Reporting] {
            let batch: Vec<_> = mode_changes
                .iter()
                .filter(|i| i.monitoring_mode() == mode)
                .cloned()
                .collect();
            let outcome = self.set_monitoring_mode(mode, &batch).await?;
            failure.mode_results.chunks.extend(outcome.chunks);
        }

        if failure.failed_count() > 0 {
            tracing::warn!("ClientSubscription: {}", failure);
            return Err(ClientError::SynchronizationFailed(Box::new(failure)));
        }
        Ok(())
    }

    /// Deliver one notification batch from the server.
    ///
    /// Values for unknown client handles are dropped. Value listeners fire
    /// per item, then batch listeners once with everything delivered.
    pub fn on_data_change(&self, sequence_number: u32, notifications: &[MonitoredItemNotification]) {
        self.last_sequence_number.store(sequence_number, Ordering::Release);

        let mut changes = Vec::with_capacity(notifications.len());
        for notification in notifications {
            let Some(item) = self.item(notification.client_handle) else {
                tracing::debug!(
                    "ClientSubscription: No item for client handle {}",
                    notification.client_handle
                );
                continue;
            };
            item.on_value(&notification.value);
            changes.push((item, notification.value.clone()));
        }

        if changes.is_empty() {
            return;
        }

        let listeners = self.batch_listeners.read().clone();
        for listener in listeners {
            listener.on_batch_changed(self, &changes);
        }
    }

    pub fn create_blocking(&self) -> Result<(), ClientError> {
        self.runtime.block_on(self.create())
    }

    pub fn modify_blocking(&self) -> Result<(), ClientError> {
        self.runtime.block_on(self.modify())
    }

    pub fn delete_blocking(&self) -> Result<(), ClientError> {
        self.runtime.block_on(self.delete())
    }

    pub fn create_monitored_items_blocking(
        &self,
        items: &[Arc<ClientMonitoredItem>],
    ) -> Result<BatchOutcome, ClientError> {
        self.runtime.block_on(self.create_monitored_items(items))
    }

    pub fn modify_monitored_items_blocking(
        &self,
        items: &[Arc<ClientMonitoredItem>],
    ) -> Result<BatchOutcome, ClientError> {
        self.runtime.block_on(self.modify_monitored_items(items))
    }

    pub fn delete_monitored_items_blocking(
        &self,
        items: &[Arc<ClientMonitoredItem>],
    ) -> Result<BatchOutcome, ClientError> {
        self.runtime.block_on(self.delete_monitored_items(items))
    }

    pub fn set_monitoring_mode_blocking(
        &self,
        mode: MonitoringMode,
        items: &[Arc<ClientMonitoredItem>],
    ) -> Result<BatchOutcome, ClientError> {
        self.runtime.block_on(self.set_monitoring_mode(mode, items))
    }

    pub fn set_publishing_mode_blocking(&self, enabled: bool) -> Result<(), ClientError> {
        self.runtime.block_on(self.set_publishing_mode(enabled))
    }

    pub fn synchronize_monitored_items_blocking(&self) -> Result<(), ClientError> {
        self.runtime.block_on(self.synchronize_monitored_items())
    }
}

fn fault_chunk(chunk: &[Arc<ClientMonitoredItem>], status: StatusCode) -> Vec<ItemOutcome> {
    chunk
        .iter()
        .map(|item| {
            item.set_status(status);
            ItemOutcome {
                item: item.clone(),
                service_status: status,
                operation_status: status,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    use crate::config::SamplingConfig;
    use crate::server::LocalServer;
    use crate::store::MemoryStore;
    use crate::types::{NodeId, Variant};

    /// Records calls and answers like a well-behaved server.
    #[derive(Default)]
    struct MockService {
        calls: parking_lot::Mutex<Vec<(&'static str, usize)>>,
        next_id: AtomicU32,
        faulting_create_call: parking_lot::Mutex<Option<usize>>,
        rejected_handles: parking_lot::Mutex<HashSet<u32>>,
        last_modify: parking_lot::Mutex<Option<ModifySubscriptionRequest>>,
    }

    impl MockService {
        fn record(&self, name: &'static str, len: usize) -> usize {
            let mut calls = self.calls.lock();
            calls.push((name, len));
            calls.iter().filter(|(n, _)| *n == name).count() - 1
        }

        fn calls(&self, name: &str) -> Vec<usize> {
            self.calls
                .lock()
                .iter()
                .filter(|(n, _)| *n == name)
                .map(|(_, len)| *len)
                .collect()
        }
    }

    #[async_trait]
    impl SubscriptionService for MockService {
        async fn create_subscription(
            &self,
            request: CreateSubscriptionRequest,
        ) -> Result<CreateSubscriptionResponse, ServiceFault> {
            self.record("create_subscription", 1);
            Ok(CreateSubscriptionResponse {
                subscription_id: 7,
                revised_publishing_interval: request.requested_publishing_interval,
                revised_lifetime_count: request.requested_lifetime_count,
                revised_max_keep_alive_count: request.requested_max_keep_alive_count,
            })
        }

        async fn modify_subscription(
            &self,
            request: ModifySubscriptionRequest,
        ) -> Result<ModifySubscriptionResponse, ServiceFault> {
            self.record("modify_subscription", 1);
            // grant intervals in whole 100ms steps
            let response = ModifySubscriptionResponse {
                revised_publishing_interval: (request.requested_publishing_interval / 100.0).ceil() * 100.0,
                revised_lifetime_count: request.requested_lifetime_count,
                revised_max_keep_alive_count: request.requested_max_keep_alive_count,
            };
            *self.last_modify.lock() = Some(request);
            Ok(response)
        }

        async fn delete_subscriptions(&self, subscription_ids: Vec<u32>) -> Result<Vec<StatusCode>, ServiceFault> {
            self.record("delete_subscriptions", subscription_ids.len());
            Ok(vec![StatusCode::GOOD; subscription_ids.len()])
        }

        async fn create_monitored_items(
            &self,
            _subscription_id: u32,
            items: Vec<MonitoredItemCreateRequest>,
        ) -> Result<Vec<MonitoredItemCreateResult>, ServiceFault> {
            let call = self.record("create_monitored_items", items.len());
            if *self.faulting_create_call.lock() == Some(call) {
                return Err(ServiceFault(StatusCode::BAD_TOO_MANY_OPERATIONS));
            }

            let rejected = self.rejected_handles.lock().clone();
            Ok(items
                .iter()
                .map(|req| {
                    if rejected.contains(&req.requested_parameters.client_handle) {
                        MonitoredItemCreateResult::failed(StatusCode::BAD_NODE_ID_UNKNOWN)
                    } else {
                        MonitoredItemCreateResult {
                            status_code: StatusCode::GOOD,
                            monitored_item_id: self.next_id.fetch_add(1, Ordering::Relaxed) + 100,
                            revised_sampling_interval: req.requested_parameters.sampling_interval,
                            revised_queue_size: req.requested_parameters.queue_size.max(1),
                        }
                    }
                })
                .collect())
        }

        async fn modify_monitored_items(
            &self,
            _subscription_id: u32,
            items: Vec<MonitoredItemModifyRequest>,
        ) -> Result<Vec<MonitoredItemModifyResult>, ServiceFault> {
            self.record("modify_monitored_items", items.len());
            Ok(items
                .iter()
                .map(|req| MonitoredItemModifyResult {
                    status_code: StatusCode::GOOD,
                    revised_sampling_interval: req.requested_parameters.sampling_interval * 2.0,
                    revised_queue_size: req.requested_parameters.queue_size,
                })
                .collect())
        }

        async fn delete_monitored_items(
            &self,
            _subscription_id: u32,
            monitored_item_ids: Vec<u32>,
        ) -> Result<Vec<StatusCode>, ServiceFault> {
            self.record("delete_monitored_items", monitored_item_ids.len());
            Ok(vec![StatusCode::GOOD; monitored_item_ids.len()])
        }

        async fn set_monitoring_mode(
            &self,
            _subscription_id: u32,
            _monitoring_mode: MonitoringMode,
            monitored_item_ids: Vec<u32>,
        ) -> Result<Vec<StatusCode>, ServiceFault> {
            self.record("set_monitoring_mode", monitored_item_ids.len());
            Ok(monitored_item_ids
                .iter()
                .map(|id| if *id == 0 { StatusCode::BAD_MONITORED_ITEM_ID_INVALID } else { StatusCode::GOOD })
                .collect())
        }

        async fn set_publishing_mode(
            &self,
            _publishing_enabled: bool,
            subscription_ids: Vec<u32>,
        ) -> Result<Vec<StatusCode>, ServiceFault> {
            self.record("set_publishing_mode", subscription_ids.len());
            Ok(vec![StatusCode::GOOD; subscription_ids.len()])
        }

        async fn set_triggering(
            &self,
            _subscription_id: u32,
            _triggering_item_id: u32,
            links_to_add: Vec<u32>,
            links_to_remove: Vec<u32>,
        ) -> Result<SetTriggeringResponse, ServiceFault> {
            self.record("set_triggering", links_to_add.len() + links_to_remove.len());
            Ok(SetTriggeringResponse {
                add_results: vec![StatusCode::GOOD; links_to_add.len()],
                remove_results: vec![StatusCode::GOOD; links_to_remove.len()],
            })
        }
    }

    fn subscription(service: Arc<MockService>, max_items_per_call: usize) -> ClientSubscription {
        ClientSubscription::new(service, ClientConfig { max_items_per_call }, Handle::current())
    }

    fn declare(sub: &ClientSubscription, n: u32) -> Vec<Arc<ClientMonitoredItem>> {
        (0..n)
            .map(|i| {
                sub.add_item(
                    ReadValueId::value_of(NodeId::numeric(2, i)),
                    MonitoringParameters {
                        sampling_interval: 100.0,
                        queue_size: 5,
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_default_counts() {
        assert_eq!(default_counts(1000.0), (60, 10));
        assert_eq!(default_counts(25.0), (2400, 400));
        assert_eq!(default_counts(100_000.0), (3, 1));
        assert_eq!(default_counts(0.0), (60, 10));
    }

    #[tokio::test]
    async fn test_create_chunks_ceil_n_over_k() {
        let service = Arc::new(MockService::default());
        let sub = subscription(service.clone(), 3);
        assert_ok!(sub.create().await);

        let items = declare(&sub, 10);
        let outcome = sub.create_monitored_items(&items).await.unwrap();

        assert_eq!(service.calls("create_monitored_items"), vec![3, 3, 3, 1]);
        assert_eq!(outcome.chunks.len(), 4);
        assert_eq!(outcome.len(), 10);
        let handles: Vec<u32> = outcome.merged().map(|o| o.item.client_handle()).collect();
        let expected: Vec<u32> = items.iter().map(|i| i.client_handle()).collect();
        assert_eq!(handles, expected);
        assert!(outcome.is_good());
        assert!(items.iter().all(|i| i.is_created()));
        assert_eq!(sub.item_by_server_id(100).unwrap().client_handle(), items[0].client_handle());
    }

    #[tokio::test]
    async fn test_unlimited_items_per_call() {
        let service = Arc::new(MockService::default());
        let sub = subscription(service.clone(), 0);
        sub.create().await.unwrap();
        declare(&sub, 25);

        assert_ok!(sub.synchronize_monitored_items().await);
        assert_eq!(service.calls("create_monitored_items"), vec![25]);
    }

    #[tokio::test]
    async fn test_chunk_fault_marks_every_item_in_chunk() {
        let service = Arc::new(MockService::default());
        *service.faulting_create_call.lock() = Some(1);
        let sub = subscription(service.clone(), 2);
        sub.create().await.unwrap();
        let items = declare(&sub, 5);

        let err = sub.synchronize_monitored_items().await.unwrap_err();
        let ClientError::SynchronizationFailed(failure) = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(err.status_code(), StatusCode::BAD_TOO_MANY_OPERATIONS);

        let chunks = &failure.create_results.chunks;
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].iter().all(ItemOutcome::is_good));
        assert!(chunks[1].iter().all(|o| {
            o.service_status == StatusCode::BAD_TOO_MANY_OPERATIONS
                && o.operation_status == StatusCode::BAD_TOO_MANY_OPERATIONS
        }));
        assert!(chunks[2].iter().all(ItemOutcome::is_good));
        assert_eq!(failure.failed_count(), 2);
        assert!(!items[2].is_created() && !items[3].is_created());
        assert_eq!(items[2].status_code(), StatusCode::BAD_TOO_MANY_OPERATIONS);

        // a retry only sends the failed items
        assert_ok!(sub.synchronize_monitored_items().await);
        assert_eq!(service.calls("create_monitored_items"), vec![2, 2, 1, 2]);
        assert!(items.iter().all(|i| i.is_created()));
    }

    #[tokio::test]
    async fn test_per_item_failures_are_independent() {
        let service = Arc::new(MockService::default());
        let sub = subscription(service.clone(), 10);
        sub.create().await.unwrap();
        let items = declare(&sub, 3);
        service.rejected_handles.lock().insert(items[1].client_handle());

        let err = assert_err!(sub.synchronize_monitored_items().await);
        let ClientError::SynchronizationFailed(failure) = err else {
            panic!("expected a synchronization failure");
        };
        let failed: Vec<u32> = failure.failed().map(|o| o.item.client_handle()).collect();
        assert_eq!(failed, vec![items[1].client_handle()]);
        let outcome = &failure.create_results.chunks[0][1];
        assert_eq!(outcome.service_status, StatusCode::GOOD);
        assert_eq!(outcome.operation_status, StatusCode::BAD_NODE_ID_UNKNOWN);
        assert!(items[0].is_created() && items[2].is_created());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let service = Arc::new(MockService::default());
        let sub = subscription(service.clone(), 10);
        assert_eq!(sub.sync_state(), SyncState::Initial);

        // deleting before creation never reaches the server
        assert_ok!(sub.delete().await);
        assert!(service.calls("delete_subscriptions").is_empty());
        assert!(matches!(sub.modify().await, Err(ClientError::NotCreated)));

        sub.create().await.unwrap();
        assert_eq!(sub.sync_state(), SyncState::Synchronized);
        assert_eq!(sub.subscription_id(), Some(7));

        sub.set_publishing_interval(250.0);
        assert_eq!(sub.sync_state(), SyncState::Unsynchronized);
        sub.set_priority(3);
        assert_eq!(sub.sync_state(), SyncState::Unsynchronized);

        sub.modify().await.unwrap();
        assert_eq!(sub.sync_state(), SyncState::Synchronized);
        let request = service.last_modify.lock().clone().unwrap();
        assert_eq!(request.requested_lifetime_count, 240);
        assert_eq!(request.requested_max_keep_alive_count, 40);
        assert_eq!(request.priority, 3);
        assert_eq!(
            sub.revised(),
            Some(RevisedSettings {
                publishing_interval: 300.0,
                lifetime_count: 240,
                max_keep_alive_count: 40,
            })
        );

        sub.set_auto_calculate(false);
        sub.set_lifetime_count(1000);
        sub.modify().await.unwrap();
        assert_eq!(service.last_modify.lock().as_ref().unwrap().requested_lifetime_count, 1000);

        sub.delete().await.unwrap();
        assert_eq!(sub.sync_state(), SyncState::Initial);
        assert_eq!(sub.subscription_id(), None);
        assert_ok!(sub.delete().await);
        assert_eq!(service.calls("delete_subscriptions"), vec![1]);
    }

    #[tokio::test]
    async fn test_synchronize_modify_delete_and_mode() {
        let service = Arc::new(MockService::default());
        let sub = subscription(service.clone(), 10);
        assert!(matches!(sub.synchronize_monitored_items().await, Err(ClientError::NotCreated)));

        sub.create().await.unwrap();
        let items = declare(&sub, 3);
        sub.synchronize_monitored_items().await.unwrap();

        items[0].set_sampling_interval(500.0);
        let removed = sub.remove_item(items[1].client_handle()).unwrap();
        items[2].set_monitoring_mode(MonitoringMode::Disabled);
        sub.synchronize_monitored_items().await.unwrap();

        assert_eq!(service.calls("modify_monitored_items"), vec![1]);
        assert_eq!(service.calls("delete_monitored_items"), vec![1]);
        assert_eq!(service.calls("set_monitoring_mode"), vec![1]);

        assert_eq!(items[0].revised_sampling_interval(), Some(1000.0));
        assert!(!removed.is_created());
        assert!(sub.item_by_server_id(101).is_none());
        assert_eq!(items[2].server_state().unwrap().monitoring_mode, MonitoringMode::Disabled);

        // nothing left to reconcile
        sub.synchronize_monitored_items().await.unwrap();
        assert_eq!(service.calls("create_monitored_items"), vec![3]);
        assert_eq!(service.calls("modify_monitored_items"), vec![1]);
    }

    #[tokio::test]
    async fn test_mode_change_updates_only_good_items() {
        let service = Arc::new(MockService::default());
        let sub = subscription(service.clone(), 10);
        sub.create().await.unwrap();
        let items = declare(&sub, 2);
        sub.create_monitored_items(&items[..1]).await.unwrap();

        let outcome = sub.set_monitoring_mode(MonitoringMode::Sampling, &items).await.unwrap();
        assert!(!outcome.is_good());
        assert_eq!(items[0].monitoring_mode(), MonitoringMode::Sampling);
        assert_eq!(items[1].monitoring_mode(), MonitoringMode::Reporting);
        assert_eq!(items[1].status_code(), StatusCode::BAD_MONITORED_ITEM_ID_INVALID);
    }

    #[tokio::test]
    async fn test_on_data_change_dispatches_listeners() {
        let service = Arc::new(MockService::default());
        let sub = subscription(service, 10);
        let items = declare(&sub, 2);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_item = seen.clone();
        items[0].add_value_listener(Arc::new(move |item: &ClientMonitoredItem, value: &DataValue| {
            seen_item.lock().push((item.client_handle(), value.value.clone()));
        }));

        let batches = Arc::new(AtomicU32::new(0));
        let batch_sizes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (batches_cb, sizes_cb) = (batches.clone(), batch_sizes.clone());
        sub.add_batch_listener(Arc::new(
            move |_sub: &ClientSubscription, changes: &[(Arc<ClientMonitoredItem>, DataValue)]| {
                batches_cb.fetch_add(1, Ordering::SeqCst);
                sizes_cb.lock().push(changes.len());
            },
        ));

        let notifications = vec![
            MonitoredItemNotification { client_handle: items[0].client_handle(), value: DataValue::new(1i32) },
            MonitoredItemNotification { client_handle: 999, value: DataValue::new(2i32) },
            MonitoredItemNotification { client_handle: items[1].client_handle(), value: DataValue::new(3i32) },
            MonitoredItemNotification { client_handle: items[0].client_handle(), value: DataValue::new(4i32) },
        ];
        sub.on_data_change(12, &notifications);

        assert_eq!(sub.last_sequence_number(), 12);
        assert_eq!(batches.load(Ordering::SeqCst), 1);
        assert_eq!(*batch_sizes.lock(), vec![3]);
        let h0 = items[0].client_handle();
        assert_eq!(*seen.lock(), vec![(h0, Variant::Int32(1)), (h0, Variant::Int32(4))]);
        assert_eq!(items[1].value().unwrap().value, Variant::Int32(3));

        // nothing delivered, no batch callback
        sub.on_data_change(13, &notifications[1..2]);
        assert_eq!(batches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_entry_points() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = Arc::new(MockService::default());
        let config = ClientConfig { max_items_per_call: 2 };
        let sub = ClientSubscription::new(service.clone(), config, runtime.handle().clone());

        sub.create_blocking().unwrap();
        let items = declare(&sub, 3);
        let outcome = sub.create_monitored_items_blocking(&items).unwrap();
        assert_eq!(outcome.len(), 3);
        assert_eq!(service.calls("create_monitored_items"), vec![2, 1]);

        sub.set_publishing_mode_blocking(false).unwrap();
        assert!(!sub.settings().publishing_enabled);

        let outcome = sub.delete_monitored_items_blocking(&items[..1]).unwrap();
        assert!(outcome.is_good());
        assert!(sub.item(items[0].client_handle()).is_none());
        sub.delete_blocking().unwrap();
        assert_eq!(sub.sync_state(), SyncState::Initial);
    }

    #[tokio::test]
    async fn test_loopback_with_local_server() {
        let store = Arc::new(MemoryStore::new());
        let node = NodeId::string(2, "Tank.Level");
        store.add_node(node.clone(), DataValue::new(40.0f64));

        let server = Arc::new(LocalServer::new(store.clone(), SamplingConfig::default()));
        server.start();

        let sub = ClientSubscription::new(server.clone(), ClientConfig::default(), Handle::current());
        sub.set_publishing_interval(100.0);
        sub.create().await.unwrap();
        let id = sub.subscription_id().unwrap();

        let level = sub.add_item(
            ReadValueId::value_of(node.clone()),
            MonitoringParameters {
                sampling_interval: 25.0,
                queue_size: 10,
                ..Default::default()
            },
        );
        let missing = sub.add_item(ReadValueId::value_of(NodeId::string(2, "Nope")), MonitoringParameters::default());

        let err = sub.synchronize_monitored_items().await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_NODE_ID_UNKNOWN);
        assert!(level.is_created());
        assert_eq!(level.revised_sampling_interval(), Some(25.0));
        sub.remove_item(missing.client_handle());

        tokio::time::sleep(Duration::from_millis(60)).await;
        store.add_node(node.clone(), DataValue::new(41.5f64));
        tokio::time::sleep(Duration::from_millis(80)).await;

        let notifications = server.collect_notifications(id).unwrap();
        sub.on_data_change(1, &notifications);
        let values: Vec<Variant> = notifications.iter().map(|n| n.value.value.clone()).collect();
        assert_eq!(values, vec![Variant::Double(40.0), Variant::Double(41.5)]);
        assert_eq!(level.value().unwrap().value, Variant::Double(41.5));

        sub.delete().await.unwrap();
        assert!(server.subscription_ids().is_empty());
        assert_eq!(server.manager().group_count(), 0);
        server.shutdown();
    }
}
