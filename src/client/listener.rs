//! Observer interfaces for inbound data changes.

use std::sync::Arc;

use super::{ClientMonitoredItem, ClientSubscription};
use crate::types::DataValue;

/// Called once per value received for one item.
pub trait ValueChangeListener: Send + Sync {
    fn on_value_changed(&self, item: &ClientMonitoredItem, value: &DataValue);
}

impl<F> ValueChangeListener for F
where
    F: Fn(&ClientMonitoredItem, &DataValue) + Send + Sync,
{
    fn on_value_changed(&self, item: &ClientMonitoredItem, value: &DataValue) {
        self(item, value)
    }
}

/// Called once per notification batch with every value it carried.
pub trait BatchChangeListener: Send + Sync {
    fn on_batch_changed(&self, subscription: &ClientSubscription, changes: &[(Arc<ClientMonitoredItem>, DataValue)]);
}

impl<F> BatchChangeListener for F
where
    F: Fn(&ClientSubscription, &[(Arc<ClientMonitoredItem>, DataValue)]) + Send + Sync,
{
    fn on_batch_changed(&self, subscription: &ClientSubscription, changes: &[(Arc<ClientMonitoredItem>, DataValue)]) {
        self(subscription, changes)
    }
}
