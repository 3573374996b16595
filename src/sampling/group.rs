//! Sampling groups: all items sharing one bucketed interval, driven by one task.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::SampleSink;
use crate::monitoring::MonitoredItem;
use crate::types::MonitoringMode;

/// A monitored item paired with the bucketed interval it is sampled at.
///
/// Never mutated: an interval change produces a new `SampledItem` in another group.
#[derive(Debug, Clone)]
pub struct SampledItem {
    item: Arc<MonitoredItem>,
    interval: f64,
}

impl SampledItem {
    pub fn new(item: Arc<MonitoredItem>, interval: f64) -> Self {
        Self { item, interval }
    }

    pub fn item(&self) -> &Arc<MonitoredItem> {
        &self.item
    }

    pub fn id(&self) -> u32 {
        self.item.id()
    }

    /// Bucketed interval in milliseconds.
    pub fn interval(&self) -> f64 {
        self.interval
    }
}

/// Invoked once per cycle with the group and the sink data sources should post to.
pub type SamplingCallback = Arc<dyn Fn(&SamplingGroup, &dyn SampleSink) + Send + Sync>;

/// Items sampled together on one timer.
///
/// Membership may change at any time; the set of items actually sampled is a
/// snapshot taken at the start of a cycle when the group is dirty, so a
/// running cycle never observes adds or removes.
pub struct SamplingGroup {
    interval: f64,
    items: RwLock<HashMap<u32, Arc<SampledItem>>>,
    active: RwLock<Arc<Vec<Arc<SampledItem>>>>,
    dirty: AtomicBool,
    running: AtomicBool,
    stop_tx: broadcast::Sender<()>,
    callback: SamplingCallback,
    sink: Arc<dyn SampleSink>,
}

impl SamplingGroup {
    pub fn new(interval: f64, callback: SamplingCallback, sink: Arc<dyn SampleSink>) -> Arc<Self> {
        let (stop_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            interval,
            items: RwLock::new(HashMap::new()),
            active: RwLock::new(Arc::new(Vec::new())),
            dirty: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop_tx,
            callback,
            sink,
        })
    }

    /// A zero-interval group for one immediate pass over `items`.
    ///
    /// The snapshot is taken here and the group never reschedules.
    pub fn temporary(items: Vec<Arc<SampledItem>>, callback: SamplingCallback, sink: Arc<dyn SampleSink>) -> Arc<Self> {
        let group = Self::new(0.0, callback, sink);
        {
            let mut members = group.items.write();
            for item in items {
                members.insert(item.id(), item);
            }
        }
        group.refresh_snapshot();
        group
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn contains(&self, item_id: u32) -> bool {
        self.items.read().contains_key(&item_id)
    }

    pub fn add(&self, item: Arc<SampledItem>) {
        self.items.write().insert(item.id(), item);
        self.mark_dirty();
    }

    pub fn remove(&self, item_id: u32) -> Option<Arc<SampledItem>> {
        let removed = self.items.write().remove(&item_id);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    /// Request a snapshot refresh at the start of the next cycle.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Items sampled in the current cycle: members whose mode is not Disabled.
    pub fn active_items(&self) -> Arc<Vec<Arc<SampledItem>>> {
        self.active.read().clone()
    }

    fn refresh_snapshot(&self) {
        let snapshot: Vec<Arc<SampledItem>> = self
            .items
            .read()
            .values()
            .filter(|s| s.item().monitoring_mode() != MonitoringMode::Disabled)
            .cloned()
            .collect();
        *self.active.write() = Arc::new(snapshot);
    }

    /// Run a single cycle on the calling thread.
    pub fn run_once(&self) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.refresh_snapshot();
        }
        (self.callback)(self, self.sink.as_ref());
    }

    /// Start cycling on the given runtime. Groups with a non-positive interval never start.
    pub fn start(self: &Arc<Self>, runtime: &tokio::runtime::Handle) {
        if self.interval <= 0.0 {
            return;
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let stop_rx = self.stop_tx.subscribe();
        runtime.spawn(run_group_loop(self.clone(), stop_rx));
    }

    /// Stop rescheduling. A cycle already in progress completes.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.stop_tx.send(());
        }
    }
}

/// Run cycles until shutdown, holding cadence against the cycle start time.
async fn run_group_loop(group: Arc<SamplingGroup>, mut stop_rx: broadcast::Receiver<()>) {
    let period = Duration::from_secs_f64(group.interval / 1000.0);
    tracing::debug!("SamplingGroup: Started {}ms group", group.interval);

    loop {
        if !group.is_running() {
            break;
        }

        let started = Instant::now();
        group.run_once();

        if !group.is_running() {
            break;
        }

        let wait = period.saturating_sub(started.elapsed());
        if wait.is_zero() {
            tracing::debug!(
                "SamplingGroup: {}ms cycle overran by {:?}",
                group.interval,
                started.elapsed() - period
            );
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    tracing::debug!("SamplingGroup: Stopped {}ms group", group.interval);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{MonitoredItemConfig, SubscriptionDiagnostics};
    use crate::sampling::Sample;
    use crate::types::{MonitoringParameters, NodeId, ReadValueId};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct NullSink;

    impl SampleSink for NullSink {
        fn post(&self, _sample: Sample) {}
    }

    fn sampled(id: u32, mode: MonitoringMode) -> Arc<SampledItem> {
        let config = MonitoredItemConfig {
            id,
            subscription_id: 1,
            target: ReadValueId::value_of(NodeId::numeric(1, id)),
            monitoring_mode: mode,
            parameters: MonitoringParameters::default(),
            revised_sampling_interval: 50.0,
            eu_range: None,
        };
        let item = MonitoredItem::new(config, Arc::new(SubscriptionDiagnostics::new(1))).unwrap();
        Arc::new(SampledItem::new(Arc::new(item), 50.0))
    }

    fn recording_callback() -> (SamplingCallback, Arc<Mutex<Vec<Vec<u32>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let cb: SamplingCallback = Arc::new(move |group: &SamplingGroup, _sink: &dyn SampleSink| {
            let mut ids: Vec<u32> = group.active_items().iter().map(|s| s.id()).collect();
            ids.sort();
            seen_cb.lock().push(ids);
        });
        (cb, seen)
    }

    #[test]
    fn test_snapshot_excludes_disabled_and_refreshes_on_dirty() {
        let (cb, seen) = recording_callback();
        let group = SamplingGroup::new(50.0, cb, Arc::new(NullSink));

        group.add(sampled(1, MonitoringMode::Reporting));
        group.add(sampled(2, MonitoringMode::Disabled));
        group.add(sampled(3, MonitoringMode::Sampling));
        group.run_once();

        let removed = group.remove(3).unwrap();
        assert_eq!(removed.id(), 3);
        assert!(group.remove(3).is_none());
        group.run_once();

        assert_eq!(*seen.lock(), vec![vec![1, 3], vec![1]]);
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_snapshot_not_refreshed_without_dirty() {
        let (cb, seen) = recording_callback();
        let group = SamplingGroup::new(50.0, cb, Arc::new(NullSink));
        let item = sampled(1, MonitoringMode::Reporting);
        group.add(item.clone());
        group.run_once();

        // a mode change alone is invisible until the group is marked dirty
        item.item().set_monitoring_mode(MonitoringMode::Disabled);
        group.run_once();
        group.mark_dirty();
        group.run_once();

        assert_eq!(*seen.lock(), vec![vec![1], vec![1], vec![]]);
    }

    #[tokio::test]
    async fn test_temporary_group_snapshot_at_construction() {
        let (cb, seen) = recording_callback();
        let group = SamplingGroup::temporary(
            vec![sampled(4, MonitoringMode::Reporting), sampled(5, MonitoringMode::Disabled)],
            cb,
            Arc::new(NullSink),
        );
        assert_eq!(group.interval(), 0.0);
        assert_eq!(group.active_items().len(), 1);

        group.start(&tokio::runtime::Handle::current());
        assert!(!group.is_running());
        group.run_once();
        assert_eq!(*seen.lock(), vec![vec![4]]);
    }

    #[tokio::test]
    async fn test_cycles_until_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        let cb: SamplingCallback = Arc::new(move |_group: &SamplingGroup, _sink: &dyn SampleSink| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });

        let group = SamplingGroup::new(20.0, cb, Arc::new(NullSink));
        group.start(&tokio::runtime::Handle::current());
        assert!(group.is_running());

        tokio::time::sleep(Duration::from_millis(110)).await;
        group.shutdown();
        let after_shutdown = count.load(Ordering::SeqCst);
        assert!(after_shutdown >= 3, "only {} cycles ran", after_shutdown);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_shutdown);
        assert!(!group.is_running());
    }

    #[tokio::test]
    async fn test_zero_interval_group_never_starts() {
        let (cb, seen) = recording_callback();
        let group = SamplingGroup::new(0.0, cb, Arc::new(NullSink));
        group.start(&tokio::runtime::Handle::current());
        assert!(!group.is_running());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().is_empty());
    }
}
