//! Server-side monitored item.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use super::{ChangeFilter, FilterError, ItemQueue, SubscriptionDiagnostics};
use crate::types::{DataValue, MonitoringFilter, MonitoringMode, MonitoringParameters, Range, ReadValueId};

/// Everything needed to create a [`MonitoredItem`].
#[derive(Debug, Clone)]
pub struct MonitoredItemConfig {
    pub id: u32,
    pub subscription_id: u32,
    pub target: ReadValueId,
    pub monitoring_mode: MonitoringMode,
    pub parameters: MonitoringParameters,
    /// Sampling interval after server-side revision, in milliseconds.
    pub revised_sampling_interval: f64,
    pub eu_range: Option<Range>,
}

/// Settings that change through modify and set-monitoring-mode calls.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSettings {
    pub monitoring_mode: MonitoringMode,
    pub requested_sampling_interval: f64,
    pub sampling_interval: f64,
    pub queue_size: u32,
    pub discard_oldest: bool,
    pub filter: Option<MonitoringFilter>,
}

#[derive(Debug)]
struct ItemState {
    last_value: Option<DataValue>,
    queue: ItemQueue,
    filter: ChangeFilter,
    eu_range: Option<Range>,
}

/// A monitored item: filter, last reported value and a bounded queue.
///
/// Value state sits behind one mutex so concurrent `set_value` calls for the
/// same item never interleave.
#[derive(Debug)]
pub struct MonitoredItem {
    id: u32,
    subscription_id: u32,
    client_handle: AtomicU32,
    target: ReadValueId,
    settings: RwLock<ItemSettings>,
    state: Mutex<ItemState>,
    triggered: AtomicBool,
    triggered_items: RwLock<Vec<Weak<MonitoredItem>>>,
    diagnostics: Arc<SubscriptionDiagnostics>,
}

impl MonitoredItem {
    pub fn new(config: MonitoredItemConfig, diagnostics: Arc<SubscriptionDiagnostics>) -> Result<Self, FilterError> {
        let params = &config.parameters;
        let filter = ChangeFilter::install(params.filter.as_ref(), config.eu_range)?;

        Ok(Self {
            id: config.id,
            subscription_id: config.subscription_id,
            client_handle: AtomicU32::new(params.client_handle),
            target: config.target,
            settings: RwLock::new(ItemSettings {
                monitoring_mode: config.monitoring_mode,
                requested_sampling_interval: params.sampling_interval,
                sampling_interval: config.revised_sampling_interval,
                queue_size: params.queue_size.max(1),
                discard_oldest: params.discard_oldest,
                filter: params.filter.clone(),
            }),
            state: Mutex::new(ItemState {
                last_value: None,
                queue: ItemQueue::new(params.queue_size, params.discard_oldest),
                filter,
                eu_range: config.eu_range,
            }),
            triggered: AtomicBool::new(false),
            triggered_items: RwLock::new(Vec::new()),
            diagnostics,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn subscription_id(&self) -> u32 {
        self.subscription_id
    }

    pub fn client_handle(&self) -> u32 {
        self.client_handle.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> &ReadValueId {
        &self.target
    }

    pub fn settings(&self) -> ItemSettings {
        self.settings.read().clone()
    }

    pub fn monitoring_mode(&self) -> MonitoringMode {
        self.settings.read().monitoring_mode
    }

    /// Revised sampling interval in milliseconds.
    pub fn sampling_interval(&self) -> f64 {
        self.settings.read().sampling_interval
    }

    pub fn diagnostics(&self) -> &Arc<SubscriptionDiagnostics> {
        &self.diagnostics
    }

    pub fn last_value(&self) -> Option<DataValue> {
        self.state.lock().last_value.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Offer a freshly sampled value.
    ///
    /// The first value always passes; later values pass when the installed
    /// filter says they changed. Passing values are queued and flag every
    /// triggered item. Returns whether the value passed.
    pub fn set_value(&self, value: DataValue) -> bool {
        if self.monitoring_mode() == MonitoringMode::Disabled {
            return false;
        }

        {
            let mut state = self.state.lock();
            let passes = match &state.last_value {
                None => true,
                Some(last) => state.filter.passes(last, &value),
            };
            if !passes {
                return false;
            }

            state.last_value = Some(value.clone());
            state.queue.enqueue(value, &self.diagnostics);
        }

        self.diagnostics.record_data_change();
        self.fire_triggers();
        true
    }

    fn fire_triggers(&self) {
        for link in self.triggered_items.read().iter() {
            if let Some(item) = link.upgrade() {
                item.triggered.store(true, Ordering::Release);
            }
        }
    }

    /// Link `item` so that every reported change of `self` force-reports it.
    pub fn add_triggered_item(&self, item: &Arc<MonitoredItem>) {
        let mut links = self.triggered_items.write();
        links.retain(|l| l.upgrade().is_some_and(|i| i.id != item.id));
        links.push(Arc::downgrade(item));
    }

    pub fn remove_triggered_item(&self, id: u32) -> bool {
        let mut links = self.triggered_items.write();
        let before = links.len();
        links.retain(|l| l.upgrade().is_some_and(|i| i.id != id));
        links.len() != before
    }

    pub fn triggered_item_ids(&self) -> Vec<u32> {
        self.triggered_items
            .read()
            .iter()
            .filter_map(|l| l.upgrade().map(|i| i.id))
            .collect()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Switch monitoring mode. Disabling drops queued values and the last
    /// value, so the first sample after re-enabling is always reported.
    pub fn set_monitoring_mode(&self, mode: MonitoringMode) {
        let previous = {
            let mut settings = self.settings.write();
            std::mem::replace(&mut settings.monitoring_mode, mode)
        };

        if mode == MonitoringMode::Disabled && previous != MonitoringMode::Disabled {
            let mut state = self.state.lock();
            state.last_value = None;
            state.queue.clear();
            self.triggered.store(false, Ordering::Release);
        }
    }

    /// Apply modified parameters. The new filter is validated first; on error nothing changes.
    pub fn modify(&self, params: &MonitoringParameters, revised_sampling_interval: f64) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        let filter = ChangeFilter::install(params.filter.as_ref(), state.eu_range)?;

        state.filter = filter;
        state.queue.resize(params.queue_size, params.discard_oldest);

        let mut settings = self.settings.write();
        settings.requested_sampling_interval = params.sampling_interval;
        settings.sampling_interval = revised_sampling_interval;
        settings.queue_size = params.queue_size.max(1);
        settings.discard_oldest = params.discard_oldest;
        settings.filter = params.filter.clone();

        self.client_handle.store(params.client_handle, Ordering::Relaxed);
        Ok(())
    }

    /// Replace the engineering-unit range used by a percent deadband.
    pub fn set_eu_range(&self, range: Option<Range>) {
        let mut state = self.state.lock();
        state.eu_range = range;
        state.filter = state.filter.with_range(range);
    }

    /// Values to report in the next notification cycle.
    ///
    /// Reporting items hand over their queue. Sampling items only report when
    /// a triggering item fired since the last cycle. A triggered item with an
    /// empty queue reports its last value.
    pub fn take_notifications(&self) -> Vec<DataValue> {
        let mode = self.monitoring_mode();
        let triggered = self.triggered.swap(false, Ordering::AcqRel);

        let mut state = self.state.lock();
        match mode {
            MonitoringMode::Disabled => Vec::new(),
            MonitoringMode::Sampling if !triggered => Vec::new(),
            MonitoringMode::Sampling | MonitoringMode::Reporting => {
                let values = state.queue.drain();
                if values.is_empty() && triggered {
                    state.last_value.clone().into_iter().collect()
                } else {
                    values
                }
            }
        }
    }
}
