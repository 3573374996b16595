//! Client-side mirror of a monitored item.

use parking_lot::RwLock;
use std::sync::Arc;

use super::ValueChangeListener;
use crate::types::{DataValue, MonitoringFilter, MonitoringMode, MonitoringParameters, ReadValueId, StatusCode};

/// What the server last confirmed for an item.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerItemState {
    pub monitored_item_id: u32,
    /// Parameters as requested in the last successful create or modify.
    pub requested: MonitoringParameters,
    pub monitoring_mode: MonitoringMode,
    pub revised_sampling_interval: f64,
    pub revised_queue_size: u32,
}

/// A locally declared monitored item.
///
/// Setters only change the desired state; the server learns about them on
/// the next synchronization.
pub struct ClientMonitoredItem {
    client_handle: u32,
    target: ReadValueId,
    desired: RwLock<MonitoringParameters>,
    desired_mode: RwLock<MonitoringMode>,
    server: RwLock<Option<ServerItemState>>,
    status: RwLock<StatusCode>,
    value: RwLock<Option<DataValue>>,
    listeners: RwLock<Vec<Arc<dyn ValueChangeListener>>>,
}

impl std::fmt::Debug for ClientMonitoredItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMonitoredItem")
            .field("client_handle", &self.client_handle)
            .field("target", &self.target)
            .field("server", &*self.server.read())
            .finish_non_exhaustive()
    }
}

impl ClientMonitoredItem {
    pub(crate) fn new(client_handle: u32, target: ReadValueId, mut parameters: MonitoringParameters) -> Self {
        parameters.client_handle = client_handle;
        Self {
            client_handle,
            target,
            desired: RwLock::new(parameters),
            desired_mode: RwLock::new(MonitoringMode::Reporting),
            server: RwLock::new(None),
            status: RwLock::new(StatusCode::BAD_WAITING_FOR_INITIAL_DATA),
            value: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn client_handle(&self) -> u32 {
        self.client_handle
    }

    pub fn target(&self) -> &ReadValueId {
        &self.target
    }

    /// Server-assigned id, once created.
    pub fn monitored_item_id(&self) -> Option<u32> {
        self.server.read().as_ref().map(|s| s.monitored_item_id)
    }

    pub fn is_created(&self) -> bool {
        self.server.read().is_some()
    }

    pub fn server_state(&self) -> Option<ServerItemState> {
        self.server.read().clone()
    }

    /// Status of the last service operation on this item.
    pub fn status_code(&self) -> StatusCode {
        *self.status.read()
    }

    pub fn parameters(&self) -> MonitoringParameters {
        self.desired.read().clone()
    }

    pub fn monitoring_mode(&self) -> MonitoringMode {
        *self.desired_mode.read()
    }

    pub fn revised_sampling_interval(&self) -> Option<f64> {
        self.server.read().as_ref().map(|s| s.revised_sampling_interval)
    }

    pub fn revised_queue_size(&self) -> Option<u32> {
        self.server.read().as_ref().map(|s| s.revised_queue_size)
    }

    pub fn set_sampling_interval(&self, interval: f64) {
        self.desired.write().sampling_interval = interval;
    }

    pub fn set_queue_size(&self, size: u32) {
        self.desired.write().queue_size = size;
    }

    pub fn set_discard_oldest(&self, discard_oldest: bool) {
        self.desired.write().discard_oldest = discard_oldest;
    }

    pub fn set_filter(&self, filter: Option<MonitoringFilter>) {
        self.desired.write().filter = filter;
    }

    /// Desired mode, applied by the next synchronization.
    pub fn set_monitoring_mode(&self, mode: MonitoringMode) {
        *self.desired_mode.write() = mode;
    }

    /// Latest value received in a data change notification.
    pub fn value(&self) -> Option<DataValue> {
        self.value.read().clone()
    }

    pub fn add_value_listener(&self, listener: Arc<dyn ValueChangeListener>) {
        self.listeners.write().push(listener);
    }

    /// Created on the server and desired parameters differ from the confirmed ones.
    pub(crate) fn needs_modify(&self) -> bool {
        match &*self.server.read() {
            Some(state) => state.requested != *self.desired.read(),
            None => false,
        }
    }

    pub(crate) fn needs_mode_change(&self) -> bool {
        match &*self.server.read() {
            Some(state) => state.monitoring_mode != *self.desired_mode.read(),
            None => false,
        }
    }

    pub(crate) fn set_status(&self, status: StatusCode) {
        *self.status.write() = status;
    }

    pub(crate) fn set_server_state(&self, state: Option<ServerItemState>) {
        *self.server.write() = state;
    }

    pub(crate) fn confirm_modify(&self, requested: MonitoringParameters, revised_interval: f64, revised_queue: u32) {
        if let Some(state) = self.server.write().as_mut() {
            state.requested = requested;
            state.revised_sampling_interval = revised_interval;
            state.revised_queue_size = revised_queue;
        }
    }

    pub(crate) fn confirm_mode(&self, mode: MonitoringMode) {
        *self.desired_mode.write() = mode;
        if let Some(state) = self.server.write().as_mut() {
            state.monitoring_mode = mode;
        }
    }

    /// Store an inbound value and notify value listeners.
    pub(crate) fn on_value(&self, value: &DataValue) {
        *self.value.write() = Some(value.clone());

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_value_changed(self, value);
        }
    }
}
