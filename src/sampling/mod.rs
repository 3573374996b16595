//! Sampling module: buckets monitored items onto shared timers and feeds
//! sampled values into each item's filter and queue.

mod group;
mod sink;

pub use group::*;
pub use sink::*;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

use crate::config::SamplingConfig;
use crate::monitoring::MonitoredItem;
use crate::store::AttributeStore;
use crate::types::DataValue;

/// Round `requested` up to the nearest multiple of `bucket`.
///
/// Exact multiples are unchanged. A non-positive bucket disables bucketing.
pub fn bucket_interval(requested: f64, bucket: f64) -> f64 {
    if bucket <= 0.0 {
        return requested;
    }
    (requested / bucket).ceil() * bucket
}

/// An external data source that pushes values at the start of each cycle.
pub trait SampleSource: Send + Sync {
    fn sample(&self, items: &[Arc<SampledItem>], sink: &dyn SampleSink);
}

type IntervalKey = u64;

fn interval_key(interval: f64) -> IntervalKey {
    interval.to_bits()
}

/// Owns the sampling groups and routes item membership changes between them.
///
/// Item ids must be unique across everything registered with one manager.
#[derive(Clone)]
pub struct SamplingManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: SamplingConfig,
    store: Arc<dyn AttributeStore>,
    groups: RwLock<HashMap<IntervalKey, Arc<SamplingGroup>>>,
    item_groups: RwLock<HashMap<u32, IntervalKey>>,
    sources: RwLock<Vec<Arc<dyn SampleSource>>>,
    pending: Mutex<Vec<Arc<MonitoredItem>>>,
    immediate_scheduled: AtomicBool,
    running: AtomicBool,
    periodic_sink: Arc<dyn SampleSink>,
    immediate_sink: Arc<dyn SampleSink>,
    runtime: Handle,
    self_ref: Weak<ManagerInner>,
}

impl SamplingManager {
    /// Create a manager on the current tokio runtime.
    pub fn new(store: Arc<dyn AttributeStore>, config: SamplingConfig) -> Self {
        Self::with_runtime(store, config, Handle::current())
    }

    pub fn with_runtime(store: Arc<dyn AttributeStore>, config: SamplingConfig, runtime: Handle) -> Self {
        let periodic_sink: Arc<dyn SampleSink> = Arc::new(AsyncSink::spawn_on(store.clone(), &runtime));
        let immediate_sink: Arc<dyn SampleSink> = Arc::new(BlockingSink::new(store.clone()));

        let inner = Arc::new_cyclic(|self_ref| ManagerInner {
            config,
            store,
            groups: RwLock::new(HashMap::new()),
            item_groups: RwLock::new(HashMap::new()),
            sources: RwLock::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            immediate_scheduled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            periodic_sink,
            immediate_sink,
            runtime,
            self_ref: self_ref.clone(),
        });

        Self { inner }
    }

    /// Register a data source invoked at the start of every cycle.
    pub fn add_source(&self, source: Arc<dyn SampleSource>) {
        self.inner.sources.write().push(source);
    }

    /// Start all groups. Groups created later start on creation.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let groups = self.inner.groups.read();
        tracing::info!("SamplingManager: Starting with {} groups", groups.len());
        for group in groups.values() {
            group.start(&self.inner.runtime);
        }
    }

    /// Stop every group. In-flight cycles complete but do not reschedule.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for group in self.inner.groups.read().values() {
            group.shutdown();
        }
        tracing::info!("SamplingManager: Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Register items with the group for their bucketed interval and queue
    /// them for a one-shot immediate sample.
    pub fn add_items(&self, items: &[Arc<MonitoredItem>]) {
        if items.is_empty() {
            return;
        }

        {
            let mut groups = self.inner.groups.write();
            let mut item_groups = self.inner.item_groups.write();
            for item in items {
                let interval = self.inner.bucketed(item);
                let key = self.inner.join_group(&mut groups, item.clone(), interval);
                item_groups.insert(item.id(), key);
            }
        }

        tracing::debug!("SamplingManager: Added {} items", items.len());
        self.inner.schedule_immediate(items);
    }

    /// Re-bucket modified items. An interval change migrates the item to
    /// another group; otherwise its group is marked dirty so mode changes are
    /// picked up on the next cycle.
    pub fn modify_items(&self, items: &[Arc<MonitoredItem>]) {
        let mut groups = self.inner.groups.write();
        let mut item_groups = self.inner.item_groups.write();

        for item in items {
            let interval = self.inner.bucketed(item);
            let new_key = interval_key(interval);

            match item_groups.get(&item.id()).copied() {
                Some(old_key) if old_key == new_key => {
                    if let Some(group) = groups.get(&old_key) {
                        group.mark_dirty();
                    }
                }
                Some(old_key) => {
                    self.inner.leave_group(&mut groups, old_key, item.id());
                    let key = self.inner.join_group(&mut groups, item.clone(), interval);
                    item_groups.insert(item.id(), key);
                    tracing::debug!("SamplingManager: Item {} moved to {}ms group", item.id(), interval);
                }
                None => {
                    tracing::warn!("SamplingManager: Modify for unknown item {}, adding it", item.id());
                    let key = self.inner.join_group(&mut groups, item.clone(), interval);
                    item_groups.insert(item.id(), key);
                }
            }
        }
    }

    /// Remove items from their groups, deleting groups left empty.
    pub fn remove_items(&self, items: &[Arc<MonitoredItem>]) {
        let mut groups = self.inner.groups.write();
        let mut item_groups = self.inner.item_groups.write();

        for item in items {
            if let Some(key) = item_groups.remove(&item.id()) {
                self.inner.leave_group(&mut groups, key, item.id());
            }
        }
        drop(item_groups);
        drop(groups);

        let mut pending = self.inner.pending.lock();
        pending.retain(|p| !items.iter().any(|i| i.id() == p.id()));
    }

    pub fn group_count(&self) -> usize {
        self.inner.groups.read().len()
    }

    /// Bucketed intervals of all groups, ascending.
    pub fn group_intervals(&self) -> Vec<f64> {
        let mut intervals: Vec<f64> = self.inner.groups.read().values().map(|g| g.interval()).collect();
        intervals.sort_by(|a, b| a.total_cmp(b));
        intervals
    }

    /// Bucketed interval an item is currently sampled at.
    pub fn item_interval(&self, item_id: u32) -> Option<f64> {
        self.inner.item_groups.read().get(&item_id).map(|k| f64::from_bits(*k))
    }

    pub fn group(&self, interval: f64) -> Option<Arc<SamplingGroup>> {
        self.inner.groups.read().get(&interval_key(interval)).cloned()
    }
}

impl ManagerInner {
    fn bucketed(&self, item: &MonitoredItem) -> f64 {
        let interval = bucket_interval(item.sampling_interval(), self.config.bucket_size_ms);
        if interval > 0.0 {
            interval
        } else {
            self.config.min_sampling_interval_ms.max(1.0)
        }
    }

    fn callback(&self) -> SamplingCallback {
        let weak = self.self_ref.clone();
        Arc::new(move |group: &SamplingGroup, sink: &dyn SampleSink| {
            if let Some(inner) = weak.upgrade() {
                inner.sample_group(group, sink);
            }
        })
    }

    fn join_group(
        &self,
        groups: &mut HashMap<IntervalKey, Arc<SamplingGroup>>,
        item: Arc<MonitoredItem>,
        interval: f64,
    ) -> IntervalKey {
        let key = interval_key(interval);
        let group = groups.entry(key).or_insert_with(|| {
            tracing::debug!("SamplingManager: Creating {}ms group", interval);
            let group = SamplingGroup::new(interval, self.callback(), self.periodic_sink.clone());
            if self.running.load(Ordering::Acquire) {
                group.start(&self.runtime);
            }
            group
        });
        group.add(Arc::new(SampledItem::new(item, interval)));
        key
    }

    fn leave_group(&self, groups: &mut HashMap<IntervalKey, Arc<SamplingGroup>>, key: IntervalKey, item_id: u32) {
        let Some(group) = groups.get(&key) else {
            return;
        };
        group.remove(item_id);

        if group.is_empty() {
            group.shutdown();
            groups.remove(&key);
            tracing::debug!("SamplingManager: Removed empty {}ms group", f64::from_bits(key));
        }
    }

    /// Queue items for the debounced immediate pass.
    fn schedule_immediate(&self, items: &[Arc<MonitoredItem>]) {
        self.pending.lock().extend(items.iter().cloned());

        if self.immediate_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak = self.self_ref.clone();
        let delay = self.config.immediate_sample_delay;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.sample_pending();
            }
        });
    }

    /// Sample everything queued since the last immediate pass through a
    /// temporary group and the blocking sink.
    fn sample_pending(&self) {
        self.immediate_scheduled.store(false, Ordering::Release);
        let items = std::mem::take(&mut *self.pending.lock());
        if items.is_empty() {
            return;
        }

        let sampled: Vec<Arc<SampledItem>> = items
            .into_iter()
            .map(|item| Arc::new(SampledItem::new(item, 0.0)))
            .collect();

        tracing::debug!("SamplingManager: Immediate sampling of {} items", sampled.len());
        let group = SamplingGroup::temporary(sampled, self.callback(), self.immediate_sink.clone());
        group.run_once();
    }

    /// One sampling pass: data sources push first, then every active item is
    /// read back from storage and offered to its filter.
    fn sample_group(&self, group: &SamplingGroup, sink: &dyn SampleSink) {
        let items = group.active_items();
        if items.is_empty() {
            return;
        }

        let sources = self.sources.read().clone();
        for source in &sources {
            source.sample(&items, sink);
        }

        for sampled in items.iter() {
            let item = sampled.item();
            let value = match self.store.read(item.target()) {
                Ok(value) => value,
                Err(e) => {
                    item.diagnostics().record_sampling_error();
                    tracing::debug!("SamplingManager: Read failed for {}: {}", item.target(), e);
                    DataValue::from_status(e.status_code())
                }
            };
            item.set_value(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{MonitoredItemConfig, SubscriptionDiagnostics};
    use crate::store::MemoryStore;
    use crate::types::{MonitoringMode, MonitoringParameters, NodeId, ReadValueId, StatusCode, Variant};
    use std::time::Duration;

    #[test]
    fn test_bucket_interval() {
        assert_eq!(bucket_interval(100.0, 25.0), 100.0);
        assert_eq!(bucket_interval(101.0, 25.0), 125.0);
        assert_eq!(bucket_interval(124.0, 25.0), 125.0);
        assert_eq!(bucket_interval(26.0, 25.0), 50.0);
        assert_eq!(bucket_interval(37.0, 0.0), 37.0);
        assert_eq!(bucket_interval(37.0, -5.0), 37.0);
    }

    fn item(id: u32, node: &NodeId, interval: f64) -> Arc<MonitoredItem> {
        item_for(id, ReadValueId::value_of(node.clone()), interval)
    }

    fn item_for(id: u32, target: ReadValueId, interval: f64) -> Arc<MonitoredItem> {
        let config = MonitoredItemConfig {
            id,
            subscription_id: 1,
            target,
            monitoring_mode: MonitoringMode::Reporting,
            parameters: MonitoringParameters {
                client_handle: id,
                sampling_interval: interval,
                queue_size: 100,
                ..Default::default()
            },
            revised_sampling_interval: interval,
            eu_range: None,
        };
        Arc::new(MonitoredItem::new(config, Arc::new(SubscriptionDiagnostics::new(1))).unwrap())
    }

    fn setup() -> (Arc<MemoryStore>, SamplingManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = SamplingManager::new(store.clone(), SamplingConfig::default());
        (store, manager)
    }

    #[tokio::test]
    async fn test_items_bucketed_into_groups() {
        let (store, manager) = setup();
        let node = NodeId::numeric(2, 1);
        store.add_node(node.clone(), DataValue::new(0i32));

        let a = item(1, &node, 101.0);
        let b = item(2, &node, 124.0);
        let c = item(3, &node, 26.0);
        manager.add_items(&[a.clone(), b.clone(), c.clone()]);

        assert_eq!(manager.group_intervals(), vec![50.0, 125.0]);
        assert_eq!(manager.item_interval(1), Some(125.0));
        assert_eq!(manager.group(125.0).unwrap().len(), 2);
        assert!(manager.group(125.0).unwrap().contains(2));
        assert!(manager.group(50.0).unwrap().contains(3));

        manager.remove_items(&[a]);
        assert_eq!(manager.group_count(), 2);
        manager.remove_items(&[b]);
        assert_eq!(manager.group_intervals(), vec![50.0]);
        assert_eq!(manager.item_interval(2), None);
    }

    #[tokio::test]
    async fn test_immediate_sample_after_add() {
        let (store, manager) = setup();
        let node = NodeId::string(2, "Temp");
        store.add_node(node.clone(), DataValue::new(21.5f64));

        // manager not started: only the immediate pass samples
        let it = item(1, &node, 1000.0);
        manager.add_items(&[it.clone()]);
        assert!(it.last_value().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(it.last_value().unwrap().value, Variant::Double(21.5));
        assert_eq!(it.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_immediate_pass_coalesces_burst() {
        let (store, manager) = setup();
        let node = NodeId::string(2, "Burst");
        store.add_node(node.clone(), DataValue::new(1i32));

        let items: Vec<_> = (0..10).map(|i| item(i, &node, 500.0)).collect();
        for it in &items {
            manager.add_items(std::slice::from_ref(it));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(items.iter().all(|it| it.queue_len() == 1));
        assert!(!manager.inner.immediate_scheduled.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_modify_migrates_between_groups() {
        let (store, manager) = setup();
        let node = NodeId::numeric(2, 9);
        store.add_node(node.clone(), DataValue::new(0i32));

        let it = item(1, &node, 100.0);
        manager.add_items(&[it.clone()]);
        let old_group = manager.group(100.0).unwrap();

        // same bucket: group only marked dirty
        it.modify(&MonitoringParameters { client_handle: 1, sampling_interval: 90.0, ..Default::default() }, 90.0)
            .unwrap();
        manager.modify_items(&[it.clone()]);
        assert_eq!(manager.group_intervals(), vec![100.0]);

        it.modify(&MonitoringParameters { client_handle: 1, sampling_interval: 260.0, ..Default::default() }, 260.0)
            .unwrap();
        manager.modify_items(&[it.clone()]);
        assert_eq!(manager.group_intervals(), vec![275.0]);
        assert_eq!(manager.item_interval(1), Some(275.0));
        assert!(old_group.is_empty());
    }

    #[tokio::test]
    async fn test_periodic_sampling_and_read_failures() {
        let (store, manager) = setup();
        let node = NodeId::string(2, "Level");
        store.add_node(node.clone(), DataValue::new(1i32));

        let ok = item(1, &node, 25.0);
        let missing = item(2, &NodeId::string(2, "Gone"), 25.0);
        manager.add_items(&[ok.clone(), missing.clone()]);
        manager.start();
        assert!(manager.group(25.0).unwrap().is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        store.add_node(node.clone(), DataValue::new(2i32));
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown();

        let values: Vec<Variant> = ok.take_notifications().into_iter().map(|dv| dv.value).collect();
        assert_eq!(values, vec![Variant::Int32(1), Variant::Int32(2)]);

        let bad = missing.last_value().unwrap();
        assert_eq!(bad.status, StatusCode::BAD_NODE_ID_UNKNOWN);
        assert!(missing.diagnostics().snapshot().sampling_error_count >= 1);
        assert!(!manager.group(25.0).unwrap().is_running());
    }

    #[tokio::test]
    async fn test_ranged_read_on_retyped_node_keeps_group_sampling() {
        let (store, manager) = setup();
        let level = NodeId::string(2, "Level");
        let tags = NodeId::string(2, "Tags");
        store.add_node(level.clone(), DataValue::new(1i32));
        store.add_node(tags.clone(), DataValue::new(vec![1i32, 2, 3]));

        let good = item(1, &level, 25.0);
        let ranged = item_for(2, ReadValueId::value_of(tags.clone()).with_index_range("0:18446744073709551615"), 25.0);
        manager.add_items(&[good.clone(), ranged.clone()]);
        manager.start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ranged.last_value().unwrap().value, Variant::from(vec![1i32, 2, 3]));

        store.add_node(tags.clone(), DataValue::new("abc"));
        store.add_node(level.clone(), DataValue::new(2i32));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(manager.group(25.0).unwrap().is_running());
        manager.shutdown();

        assert_eq!(good.last_value().unwrap().value, Variant::Int32(2));
        assert_eq!(ranged.last_value().unwrap().value, Variant::from("abc"));
    }

    struct CounterSource {
        node: NodeId,
        next: Mutex<i32>,
    }

    impl SampleSource for CounterSource {
        fn sample(&self, items: &[Arc<SampledItem>], sink: &dyn SampleSink) {
            if !items.iter().any(|s| s.item().target().node_id == self.node) {
                return;
            }
            let mut next = self.next.lock();
            *next += 1;
            sink.post(Sample::now().with(SampledValue::new(ReadValueId::value_of(self.node.clone()), *next)));
        }
    }

    #[tokio::test]
    async fn test_immediate_pass_sees_source_values() {
        let (store, manager) = setup();
        let node = NodeId::string(2, "Counter");
        store.add_node(node.clone(), DataValue::new(0i32));
        manager.add_source(Arc::new(CounterSource {
            node: node.clone(),
            next: Mutex::new(0),
        }));

        let it = item(1, &node, 1000.0);
        manager.add_items(&[it.clone()]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the blocking sink applied the source's value before the read-back
        assert_eq!(it.last_value().unwrap().value, Variant::Int32(1));
    }
}
