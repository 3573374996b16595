//! Monitoring configuration types shared by server and client.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MonitoringMode {
    Disabled,
    Sampling,
    #[default]
    Reporting,
}

/// Which changes of a data value count as a notification-worthy change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataChangeTrigger {
    Status,
    #[default]
    StatusValue,
    StatusValueTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeadbandType {
    #[default]
    None,
    Absolute,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DataChangeFilter {
    pub trigger: DataChangeTrigger,
    pub deadband_type: DeadbandType,
    pub deadband_value: f64,
}

impl DataChangeFilter {
    pub fn absolute(deadband: f64) -> Self {
        Self {
            trigger: DataChangeTrigger::StatusValue,
            deadband_type: DeadbandType::Absolute,
            deadband_value: deadband,
        }
    }

    pub fn percent(deadband: f64) -> Self {
        Self {
            trigger: DataChangeTrigger::StatusValue,
            deadband_type: DeadbandType::Percent,
            deadband_value: deadband,
        }
    }

    pub fn with_trigger(mut self, trigger: DataChangeTrigger) -> Self {
        self.trigger = trigger;
        self
    }
}

/// Filter attached to a monitored item. Only data-change filters are evaluated by this engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MonitoringFilter {
    DataChange(DataChangeFilter),
    Event { select_clauses: Vec<String> },
    Aggregate { aggregate_type: String, processing_interval: f64 },
}

impl MonitoringFilter {
    pub fn kind(&self) -> &'static str {
        match self {
            MonitoringFilter::DataChange(_) => "DataChangeFilter",
            MonitoringFilter::Event { .. } => "EventFilter",
            MonitoringFilter::Aggregate { .. } => "AggregateFilter",
        }
    }
}

/// Engineering-unit range of an analog item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub low: f64,
    pub high: f64,
}

impl Range {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// Width of the range, or `None` when it is non-positive or not finite.
    pub fn span(&self) -> Option<f64> {
        let span = self.high - self.low;
        if span.is_finite() && span > 0.0 {
            Some(span)
        } else {
            None
        }
    }
}

/// Parameters a client requests for a monitored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringParameters {
    pub client_handle: u32,
    /// Milliseconds. Negative means "use the publishing interval".
    pub sampling_interval: f64,
    pub filter: Option<MonitoringFilter>,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

impl Default for MonitoringParameters {
    fn default() -> Self {
        Self {
            client_handle: 0,
            sampling_interval: 1000.0,
            filter: None,
            queue_size: 1,
            discard_oldest: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_span() {
        assert_eq!(Range::new(0.0, 100.0).span(), Some(100.0));
        assert_eq!(Range::new(-50.0, 50.0).span(), Some(100.0));
        assert_eq!(Range::new(10.0, 10.0).span(), None);
        assert_eq!(Range::new(10.0, 0.0).span(), None);
        assert_eq!(Range::new(f64::NAN, 1.0).span(), None);
    }
}
