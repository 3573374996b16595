//! In-process subscription service backed by the sampling engine.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::{ServerSubscription, SubscriptionParameters};
use crate::config::SamplingConfig;
use crate::monitoring::{DiagnosticsSnapshot, MonitoredItem, MonitoredItemConfig};
use crate::sampling::{SampleSource, SamplingManager};
use crate::service::*;
use crate::store::{AttributeStore, StoreError};
use crate::types::{IndexRange, MonitoringMode, StatusCode};

/// Serves subscription calls directly against a [`SamplingManager`].
pub struct LocalServer {
    config: SamplingConfig,
    store: Arc<dyn AttributeStore>,
    manager: SamplingManager,
    subscriptions: RwLock<HashMap<u32, Arc<ServerSubscription>>>,
    next_subscription_id: AtomicU32,
    next_item_id: AtomicU32,
}

impl LocalServer {
    /// Create a server on the current tokio runtime.
    pub fn new(store: Arc<dyn AttributeStore>, config: SamplingConfig) -> Self {
        let manager = SamplingManager::new(store.clone(), config.clone());
        Self {
            config,
            store,
            manager,
            subscriptions: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU32::new(1),
            next_item_id: AtomicU32::new(1),
        }
    }

    pub fn manager(&self) -> &SamplingManager {
        &self.manager
    }

    pub fn add_source(&self, source: Arc<dyn SampleSource>) {
        self.manager.add_source(source);
    }

    pub fn start(&self) {
        self.manager.start();
    }

    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    pub fn subscription(&self, id: u32) -> Option<Arc<ServerSubscription>> {
        self.subscriptions.read().get(&id).cloned()
    }

    pub fn subscription_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.subscriptions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Pending notifications of a subscription, or `None` if it does not exist.
    pub fn collect_notifications(&self, subscription_id: u32) -> Option<Vec<MonitoredItemNotification>> {
        self.subscription(subscription_id).map(|s| s.collect_notifications())
    }

    pub fn diagnostics(&self, subscription_id: u32) -> Option<DiagnosticsSnapshot> {
        self.subscription(subscription_id).map(|s| s.diagnostics_snapshot())
    }

    fn require_subscription(&self, id: u32) -> Result<Arc<ServerSubscription>, ServiceFault> {
        self.subscription(id)
            .ok_or(ServiceFault(StatusCode::BAD_SUBSCRIPTION_ID_INVALID))
    }

    fn revise_publishing_interval(&self, requested: f64) -> f64 {
        if requested.is_nan() || requested <= 0.0 {
            return self.config.min_sampling_interval_ms;
        }
        requested.clamp(self.config.min_sampling_interval_ms, self.config.max_sampling_interval_ms)
    }

    /// Negative requests take the publishing interval; the result is clamped
    /// to the configured bounds.
    fn revise_sampling_interval(&self, requested: f64, publishing_interval: f64) -> f64 {
        let interval = if requested < 0.0 { publishing_interval } else { requested };
        if interval.is_nan() {
            return self.config.min_sampling_interval_ms;
        }
        interval.clamp(self.config.min_sampling_interval_ms, self.config.max_sampling_interval_ms)
    }

    fn revise_queue_size(&self, requested: u32) -> u32 {
        requested.clamp(1, self.config.max_queue_size.max(1))
    }

    fn revise_counts(lifetime: u32, keep_alive: u32) -> (u32, u32) {
        let keep_alive = keep_alive.max(1);
        let lifetime = lifetime.max(keep_alive.saturating_mul(3));
        (lifetime, keep_alive)
    }

    fn create_item(
        &self,
        subscription: &ServerSubscription,
        request: MonitoredItemCreateRequest,
    ) -> Result<Arc<MonitoredItem>, StatusCode> {
        let target = &request.item_to_monitor;

        if !target.attribute_id.is_valid() {
            return Err(StatusCode::BAD_ATTRIBUTE_ID_INVALID);
        }
        if let Some(range) = target.index_range.as_deref() {
            if IndexRange::parse(range).is_none() {
                return Err(StatusCode::BAD_INDEX_RANGE_INVALID);
            }
        }
        if request.requested_parameters.filter.is_some() && !target.attribute_id.is_value() {
            return Err(StatusCode::BAD_FILTER_NOT_ALLOWED);
        }

        match self.store.read(target) {
            Err(e @ (StoreError::NodeNotFound(_) | StoreError::AttributeInvalid(_))) => {
                return Err(e.status_code());
            }
            _ => {}
        }

        let publishing_interval = subscription.parameters().publishing_interval;
        let mut parameters = request.requested_parameters;
        let revised_sampling_interval =
            self.revise_sampling_interval(parameters.sampling_interval, publishing_interval);
        parameters.queue_size = self.revise_queue_size(parameters.queue_size);

        let config = MonitoredItemConfig {
            id: self.next_item_id.fetch_add(1, Ordering::Relaxed),
            subscription_id: subscription.id(),
            eu_range: self.store.eu_range(&target.node_id),
            target: request.item_to_monitor,
            monitoring_mode: request.monitoring_mode,
            parameters,
            revised_sampling_interval,
        };

        MonitoredItem::new(config, subscription.diagnostics().clone())
            .map(Arc::new)
            .map_err(|e| {
                tracing::debug!("LocalServer: Rejected filter: {}", e);
                e.status_code()
            })
    }
}

#[async_trait]
impl SubscriptionService for LocalServer {
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<CreateSubscriptionResponse, ServiceFault> {
        let publishing_interval = self.revise_publishing_interval(request.requested_publishing_interval);
        let (lifetime_count, max_keep_alive_count) =
            Self::revise_counts(request.requested_lifetime_count, request.requested_max_keep_alive_count);

        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let parameters = SubscriptionParameters {
            publishing_interval,
            lifetime_count,
            max_keep_alive_count,
            max_notifications_per_publish: request.max_notifications_per_publish,
            priority: request.priority,
        };
        let subscription = Arc::new(ServerSubscription::new(id, parameters, request.publishing_enabled));
        self.subscriptions.write().insert(id, subscription);

        tracing::info!("LocalServer: Created subscription {} ({}ms)", id, publishing_interval);
        Ok(CreateSubscriptionResponse {
            subscription_id: id,
            revised_publishing_interval: publishing_interval,
            revised_lifetime_count: lifetime_count,
            revised_max_keep_alive_count: max_keep_alive_count,
        })
    }

    async fn modify_subscription(
        &self,
        request: ModifySubscriptionRequest,
    ) -> Result<ModifySubscriptionResponse, ServiceFault> {
        let subscription = self.require_subscription(request.subscription_id)?;

        let publishing_interval = self.revise_publishing_interval(request.requested_publishing_interval);
        let (lifetime_count, max_keep_alive_count) =
            Self::revise_counts(request.requested_lifetime_count, request.requested_max_keep_alive_count);
        subscription.set_parameters(SubscriptionParameters {
            publishing_interval,
            lifetime_count,
            max_keep_alive_count,
            max_notifications_per_publish: request.max_notifications_per_publish,
            priority: request.priority,
        });

        Ok(ModifySubscriptionResponse {
            revised_publishing_interval: publishing_interval,
            revised_lifetime_count: lifetime_count,
            revised_max_keep_alive_count: max_keep_alive_count,
        })
    }

    async fn delete_subscriptions(&self, subscription_ids: Vec<u32>) -> Result<Vec<StatusCode>, ServiceFault> {
        if subscription_ids.is_empty() {
            return Err(ServiceFault(StatusCode::BAD_NOTHING_TO_DO));
        }

        let mut results = Vec::with_capacity(subscription_ids.len());
        for id in subscription_ids {
            let removed = self.subscriptions.write().remove(&id);
            match removed {
                Some(subscription) => {
                    let items = subscription.drain_items();
                    self.manager.remove_items(&items);
                    tracing::info!("LocalServer: Deleted subscription {} with {} items", id, items.len());
                    results.push(StatusCode::GOOD);
                }
                None => results.push(StatusCode::BAD_SUBSCRIPTION_ID_INVALID),
            }
        }
        Ok(results)
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: Vec<MonitoredItemCreateRequest>,
    ) -> Result<Vec<MonitoredItemCreateResult>, ServiceFault> {
        let subscription = self.require_subscription(subscription_id)?;
        if items.is_empty() {
            return Err(ServiceFault(StatusCode::BAD_NOTHING_TO_DO));
        }

        let mut results = Vec::with_capacity(items.len());
        let mut created = Vec::new();

        for request in items {
            match self.create_item(&subscription, request) {
                Ok(item) => {
                    let settings = item.settings();
                    results.push(MonitoredItemCreateResult {
                        status_code: StatusCode::GOOD,
                        monitored_item_id: item.id(),
                        revised_sampling_interval: settings.sampling_interval,
                        revised_queue_size: settings.queue_size,
                    });
                    subscription.insert_item(item.clone());
                    created.push(item);
                }
                Err(status) => results.push(MonitoredItemCreateResult::failed(status)),
            }
        }

        self.manager.add_items(&created);
        tracing::debug!(
            "LocalServer: Created {}/{} items on subscription {}",
            created.len(),
            results.len(),
            subscription_id
        );
        Ok(results)
    }

    async fn modify_monitored_items(
        &self,
        subscription_id: u32,
        items: Vec<MonitoredItemModifyRequest>,
    ) -> Result<Vec<MonitoredItemModifyResult>, ServiceFault> {
        let subscription = self.require_subscription(subscription_id)?;
        if items.is_empty() {
            return Err(ServiceFault(StatusCode::BAD_NOTHING_TO_DO));
        }

        let publishing_interval = subscription.parameters().publishing_interval;
        let mut results = Vec::with_capacity(items.len());
        let mut modified = Vec::new();

        for request in items {
            let Some(item) = subscription.item(request.monitored_item_id) else {
                results.push(MonitoredItemModifyResult::failed(StatusCode::BAD_MONITORED_ITEM_ID_INVALID));
                continue;
            };

            let mut parameters = request.requested_parameters;
            let revised = self.revise_sampling_interval(parameters.sampling_interval, publishing_interval);
            parameters.queue_size = self.revise_queue_size(parameters.queue_size);

            match item.modify(&parameters, revised) {
                Ok(()) => {
                    results.push(MonitoredItemModifyResult {
                        status_code: StatusCode::GOOD,
                        revised_sampling_interval: revised,
                        revised_queue_size: parameters.queue_size,
                    });
                    modified.push(item);
                }
                Err(e) => results.push(MonitoredItemModifyResult::failed(e.status_code())),
            }
        }

        self.manager.modify_items(&modified);
        Ok(results)
    }

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, ServiceFault> {
        let subscription = self.require_subscription(subscription_id)?;
        if monitored_item_ids.is_empty() {
            return Err(ServiceFault(StatusCode::BAD_NOTHING_TO_DO));
        }

        let mut results = Vec::with_capacity(monitored_item_ids.len());
        let mut removed = Vec::new();
        for id in monitored_item_ids {
            match subscription.remove_item(id) {
                Some(item) => {
                    removed.push(item);
                    results.push(StatusCode::GOOD);
                }
                None => results.push(StatusCode::BAD_MONITORED_ITEM_ID_INVALID),
            }
        }

        self.manager.remove_items(&removed);
        Ok(results)
    }

    async fn set_monitoring_mode(
        &self,
        subscription_id: u32,
        monitoring_mode: MonitoringMode,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, ServiceFault> {
        let subscription = self.require_subscription(subscription_id)?;
        if monitored_item_ids.is_empty() {
            return Err(ServiceFault(StatusCode::BAD_NOTHING_TO_DO));
        }

        let mut results = Vec::with_capacity(monitored_item_ids.len());
        let mut changed = Vec::new();
        for id in monitored_item_ids {
            match subscription.item(id) {
                Some(item) => {
                    item.set_monitoring_mode(monitoring_mode);
                    changed.push(item);
                    results.push(StatusCode::GOOD);
                }
                None => results.push(StatusCode::BAD_MONITORED_ITEM_ID_INVALID),
            }
        }

        // groups re-snapshot their active items on the next cycle
        self.manager.modify_items(&changed);
        Ok(results)
    }

    async fn set_publishing_mode(
        &self,
        publishing_enabled: bool,
        subscription_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, ServiceFault> {
        if subscription_ids.is_empty() {
            return Err(ServiceFault(StatusCode::BAD_NOTHING_TO_DO));
        }

        Ok(subscription_ids
            .into_iter()
            .map(|id| match self.subscription(id) {
                Some(subscription) => {
                    subscription.set_publishing_enabled(publishing_enabled);
                    StatusCode::GOOD
                }
                None => StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            })
            .collect())
    }

    async fn set_triggering(
        &self,
        subscription_id: u32,
        triggering_item_id: u32,
        links_to_add: Vec<u32>,
        links_to_remove: Vec<u32>,
    ) -> Result<SetTriggeringResponse, ServiceFault> {
        let subscription = self.require_subscription(subscription_id)?;
        if links_to_add.is_empty() && links_to_remove.is_empty() {
            return Err(ServiceFault(StatusCode::BAD_NOTHING_TO_DO));
        }
        let trigger = subscription
            .item(triggering_item_id)
            .ok_or(ServiceFault(StatusCode::BAD_MONITORED_ITEM_ID_INVALID))?;

        let remove_results = links_to_remove
            .into_iter()
            .map(|id| {
                if trigger.remove_triggered_item(id) {
                    StatusCode::GOOD
                } else {
                    StatusCode::BAD_MONITORED_ITEM_ID_INVALID
                }
            })
            .collect();

        let add_results = links_to_add
            .into_iter()
            .map(|id| match subscription.item(id) {
                Some(linked) => {
                    trigger.add_triggered_item(&linked);
                    StatusCode::GOOD
                }
                None => StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
            })
            .collect();

        Ok(SetTriggeringResponse {
            add_results,
            remove_results,
        })
    }
}
