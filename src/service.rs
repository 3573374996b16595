//! Request/response contract between the client reconciler and a server.
//!
//! Every batch call returns one result per request entry, in request order.
//! A failure of the whole call is reported as `Err(ServiceFault)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DataValue, MonitoringMode, MonitoringParameters, ReadValueId, StatusCode};

/// A call-level failure: nothing in the request was applied.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("service fault: {0}")]
pub struct ServiceFault(pub StatusCode);

impl ServiceFault {
    pub fn status_code(&self) -> StatusCode {
        self.0
    }
}

impl From<StatusCode> for ServiceFault {
    fn from(status: StatusCode) -> Self {
        Self(status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub requested_publishing_interval: f64,
    pub requested_lifetime_count: u32,
    pub requested_max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub publishing_enabled: bool,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSubscriptionResponse {
    pub subscription_id: u32,
    pub revised_publishing_interval: f64,
    pub revised_lifetime_count: u32,
    pub revised_max_keep_alive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifySubscriptionRequest {
    pub subscription_id: u32,
    pub requested_publishing_interval: f64,
    pub requested_lifetime_count: u32,
    pub requested_max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifySubscriptionResponse {
    pub revised_publishing_interval: f64,
    pub revised_lifetime_count: u32,
    pub revised_max_keep_alive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemCreateRequest {
    pub item_to_monitor: ReadValueId,
    pub monitoring_mode: MonitoringMode,
    pub requested_parameters: MonitoringParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemCreateResult {
    pub status_code: StatusCode,
    pub monitored_item_id: u32,
    pub revised_sampling_interval: f64,
    pub revised_queue_size: u32,
}

impl MonitoredItemCreateResult {
    pub fn failed(status_code: StatusCode) -> Self {
        Self {
            status_code,
            monitored_item_id: 0,
            revised_sampling_interval: 0.0,
            revised_queue_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemModifyRequest {
    pub monitored_item_id: u32,
    pub requested_parameters: MonitoringParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemModifyResult {
    pub status_code: StatusCode,
    pub revised_sampling_interval: f64,
    pub revised_queue_size: u32,
}

impl MonitoredItemModifyResult {
    pub fn failed(status_code: StatusCode) -> Self {
        Self {
            status_code,
            revised_sampling_interval: 0.0,
            revised_queue_size: 0,
        }
    }
}

/// Per-link outcomes of a set-triggering call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetTriggeringResponse {
    pub add_results: Vec<StatusCode>,
    pub remove_results: Vec<StatusCode>,
}

/// One reported value, addressed by the client's handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemNotification {
    pub client_handle: u32,
    pub value: DataValue,
}

/// Subscription and monitored-item services.
#[async_trait]
pub trait SubscriptionService: Send + Sync {
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<CreateSubscriptionResponse, ServiceFault>;

    async fn modify_subscription(
        &self,
        request: ModifySubscriptionRequest,
    ) -> Result<ModifySubscriptionResponse, ServiceFault>;

    async fn delete_subscriptions(&self, subscription_ids: Vec<u32>) -> Result<Vec<StatusCode>, ServiceFault>;

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: Vec<MonitoredItemCreateRequest>,
    ) -> Result<Vec<MonitoredItemCreateResult>, ServiceFault>;

    async fn modify_monitored_items(
        &self,
        subscription_id: u32,
        items: Vec<MonitoredItemModifyRequest>,
    ) -> Result<Vec<MonitoredItemModifyResult>, ServiceFault>;

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, ServiceFault>;

    async fn set_monitoring_mode(
        &self,
        subscription_id: u32,
        monitoring_mode: MonitoringMode,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, ServiceFault>;

    async fn set_publishing_mode(
        &self,
        publishing_enabled: bool,
        subscription_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, ServiceFault>;

    async fn set_triggering(
        &self,
        subscription_id: u32,
        triggering_item_id: u32,
        links_to_add: Vec<u32>,
        links_to_remove: Vec<u32>,
    ) -> Result<SetTriggeringResponse, ServiceFault>;
}
