//! Data-change filter evaluation.
//!
//! A filter is installed once per item (and again on modify) and then decides,
//! for every sampled value, whether it differs enough from the last reported
//! value to be queued.

use thiserror::Error;

use crate::types::{
    DataChangeFilter, DataChangeTrigger, DataValue, DeadbandType, MonitoringFilter, Range, StatusCode, Variant,
};

/// Filter configuration errors, raised when a filter is installed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("deadband value {0} is out of range")]
    InvalidDeadbandValue(f64),
    #[error("percent deadband requires an engineering-unit range")]
    PercentWithoutRange,
    #[error("{0} is not supported for data monitoring")]
    Unsupported(&'static str),
}

impl FilterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FilterError::InvalidDeadbandValue(_) => StatusCode::BAD_DEADBAND_FILTER_INVALID,
            FilterError::PercentWithoutRange => StatusCode::BAD_FILTER_NOT_ALLOWED,
            FilterError::Unsupported(_) => StatusCode::BAD_MONITORED_ITEM_FILTER_UNSUPPORTED,
        }
    }
}

/// How far a value has to move before it counts as changed.
///
/// Chosen from the deadband type and whether the item carries an
/// engineering-unit range; the item itself does not care which one it holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeadbandPolicy {
    None,
    Absolute(f64),
    /// `threshold` is `None` when the range is missing or degenerate; every change then passes.
    Percent { deadband: f64, threshold: Option<f64> },
}

impl DeadbandPolicy {
    pub fn new(deadband_type: DeadbandType, deadband: f64, range: Option<Range>) -> Self {
        match deadband_type {
            DeadbandType::None => DeadbandPolicy::None,
            DeadbandType::Absolute => DeadbandPolicy::Absolute(deadband),
            DeadbandType::Percent => DeadbandPolicy::Percent {
                deadband,
                threshold: range.and_then(|r| r.span()).map(|span| deadband * span / 100.0),
            },
        }
    }

    /// Re-derive the policy against a new range. Only Percent depends on it.
    pub fn with_range(self, range: Option<Range>) -> Self {
        match self {
            DeadbandPolicy::Percent { deadband, .. } => DeadbandPolicy::new(DeadbandType::Percent, deadband, range),
            other => other,
        }
    }

    pub fn exceeded(&self, last: &Variant, current: &Variant) -> bool {
        match self {
            DeadbandPolicy::None => !last.same_as(current),
            DeadbandPolicy::Absolute(deadband) => exceeds_deadband(last, current, *deadband),
            DeadbandPolicy::Percent {
                threshold: Some(threshold),
                ..
            } => exceeds_deadband(last, current, *threshold),
            DeadbandPolicy::Percent { threshold: None, .. } => !both_nan(last, current),
        }
    }
}

fn both_nan(last: &Variant, current: &Variant) -> bool {
    matches!((last.as_f64(), current.as_f64()), (Some(a), Some(b)) if a.is_nan() && b.is_nan())
}

fn exceeds_deadband(last: &Variant, current: &Variant, threshold: f64) -> bool {
    if let (Variant::Array(a), Variant::Array(b)) = (last, current) {
        return a.len() != b.len() || a.iter().zip(b).any(|(x, y)| exceeds_deadband(x, y, threshold));
    }

    if let (Some(a), Some(b)) = (as_integer(last), as_integer(current)) {
        // i128 so that u64/i64 extremes cannot overflow the subtraction
        return (a - b).unsigned_abs() as f64 > threshold;
    }

    match (last.as_f64(), current.as_f64()) {
        (Some(a), Some(b)) => {
            if a.is_nan() || b.is_nan() {
                return !(a.is_nan() && b.is_nan());
            }
            if a == b {
                return false;
            }
            let diff = (a - b).abs();
            diff.is_nan() || diff > threshold
        }
        _ => !last.same_as(current),
    }
}

fn as_integer(v: &Variant) -> Option<i128> {
    match v {
        Variant::SByte(v) => Some(*v as i128),
        Variant::Byte(v) => Some(*v as i128),
        Variant::Int16(v) => Some(*v as i128),
        Variant::UInt16(v) => Some(*v as i128),
        Variant::Int32(v) => Some(*v as i128),
        Variant::UInt32(v) => Some(*v as i128),
        Variant::Int64(v) => Some(*v as i128),
        Variant::UInt64(v) => Some(*v as i128),
        _ => None,
    }
}

/// An installed data-change filter: trigger plus deadband policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeFilter {
    pub trigger: DataChangeTrigger,
    pub policy: DeadbandPolicy,
}

impl Default for ChangeFilter {
    fn default() -> Self {
        Self {
            trigger: DataChangeTrigger::StatusValue,
            policy: DeadbandPolicy::None,
        }
    }
}

impl ChangeFilter {
    /// Validate a requested filter and build its evaluator.
    pub fn install(filter: Option<&MonitoringFilter>, range: Option<Range>) -> Result<Self, FilterError> {
        let filter = match filter {
            None => return Ok(Self::default()),
            Some(MonitoringFilter::DataChange(f)) => f,
            Some(other) => return Err(FilterError::Unsupported(other.kind())),
        };

        validate_deadband(filter, range)?;

        Ok(Self {
            trigger: filter.trigger,
            policy: DeadbandPolicy::new(filter.deadband_type, filter.deadband_value, range),
        })
    }

    pub fn with_range(self, range: Option<Range>) -> Self {
        Self {
            policy: self.policy.with_range(range),
            ..self
        }
    }

    /// Whether `current` should be reported given the last reported value.
    pub fn passes(&self, last: &DataValue, current: &DataValue) -> bool {
        let status_changed = last.status != current.status;

        match self.trigger {
            DataChangeTrigger::Status => status_changed,
            DataChangeTrigger::StatusValue => status_changed || self.policy.exceeded(&last.value, &current.value),
            DataChangeTrigger::StatusValueTimestamp => {
                status_changed
                    || last.source_timestamp != current.source_timestamp
                    || self.policy.exceeded(&last.value, &current.value)
            }
        }
    }
}

fn validate_deadband(filter: &DataChangeFilter, range: Option<Range>) -> Result<(), FilterError> {
    let value = filter.deadband_value;

    match filter.deadband_type {
        DeadbandType::None => Ok(()),
        DeadbandType::Absolute => {
            if value.is_nan() || value < 0.0 {
                return Err(FilterError::InvalidDeadbandValue(value));
            }
            Ok(())
        }
        DeadbandType::Percent => {
            if !(0.0..=100.0).contains(&value) {
                return Err(FilterError::InvalidDeadbandValue(value));
            }
            match range {
                None => Err(FilterError::PercentWithoutRange),
                Some(r) => {
                    if r.span().is_none() {
                        tracing::warn!(
                            "ChangeFilter: Degenerate EU range [{}, {}], percent deadband will pass every change",
                            r.low,
                            r.high
                        );
                    }
                    Ok(())
                }
            }
        }
    }
}
