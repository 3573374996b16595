//! Protocol status codes.
//!
//! The top two bits carry severity (00 good, 01 uncertain, 10 bad). The low
//! 16 bits carry info flags; when the info type bit (0x400) is set, bit 7
//! signals a queue overflow on a data value.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StatusCode(pub u32);

const SEVERITY_MASK: u32 = 0xC000_0000;
const SEVERITY_UNCERTAIN: u32 = 0x4000_0000;
const SEVERITY_BAD: u32 = 0x8000_0000;
const INFO_TYPE_DATA_VALUE: u32 = 0x0000_0400;
const INFO_BITS_MASK: u32 = 0x0000_03FF;
const OVERFLOW_BIT: u32 = 0x0000_0080;

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0);
    pub const UNCERTAIN: StatusCode = StatusCode(0x4000_0000);
    pub const BAD: StatusCode = StatusCode(0x8000_0000);
    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_TOO_MANY_OPERATIONS: StatusCode = StatusCode(0x8010_0000);
    pub const BAD_NOTHING_TO_DO: StatusCode = StatusCode(0x800F_0000);
    pub const BAD_SUBSCRIPTION_ID_INVALID: StatusCode = StatusCode(0x8028_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_ATTRIBUTE_ID_INVALID: StatusCode = StatusCode(0x8035_0000);
    pub const BAD_INDEX_RANGE_INVALID: StatusCode = StatusCode(0x8036_0000);
    pub const BAD_INDEX_RANGE_NO_DATA: StatusCode = StatusCode(0x8037_0000);
    pub const BAD_MONITORED_ITEM_ID_INVALID: StatusCode = StatusCode(0x8042_0000);
    pub const BAD_MONITORED_ITEM_FILTER_INVALID: StatusCode = StatusCode(0x8043_0000);
    pub const BAD_MONITORED_ITEM_FILTER_UNSUPPORTED: StatusCode = StatusCode(0x8044_0000);
    pub const BAD_FILTER_NOT_ALLOWED: StatusCode = StatusCode(0x8045_0000);
    pub const BAD_MONITORING_MODE_INVALID: StatusCode = StatusCode(0x8041_0000);
    pub const BAD_DEADBAND_FILTER_INVALID: StatusCode = StatusCode(0x808E_0000);
    pub const BAD_WAITING_FOR_INITIAL_DATA: StatusCode = StatusCode(0x8032_0000);

    pub fn is_good(&self) -> bool {
        self.0 & SEVERITY_MASK == 0
    }

    pub fn is_uncertain(&self) -> bool {
        self.0 & SEVERITY_MASK == SEVERITY_UNCERTAIN
    }

    pub fn is_bad(&self) -> bool {
        self.0 & SEVERITY_BAD != 0
    }

    pub fn has_overflow(&self) -> bool {
        self.0 & INFO_TYPE_DATA_VALUE != 0 && self.0 & OVERFLOW_BIT != 0
    }

    /// Returns a copy with the overflow indicator set or cleared.
    pub fn with_overflow(self, overflow: bool) -> Self {
        if overflow {
            StatusCode(self.0 | INFO_TYPE_DATA_VALUE | OVERFLOW_BIT)
        } else {
            let bits = self.0 & !OVERFLOW_BIT;
            // drop the info type once no info bits remain
            if bits & INFO_BITS_MASK == 0 {
                StatusCode(bits & !INFO_TYPE_DATA_VALUE)
            } else {
                StatusCode(bits)
            }
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        let name = match StatusCode(self.0 & 0xFFFF_0000) {
            StatusCode::GOOD => "Good",
            StatusCode::UNCERTAIN => "Uncertain",
            StatusCode::BAD => "Bad",
            StatusCode::BAD_INTERNAL_ERROR => "BadInternalError",
            StatusCode::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            StatusCode::BAD_TIMEOUT => "BadTimeout",
            StatusCode::BAD_TOO_MANY_OPERATIONS => "BadTooManyOperations",
            StatusCode::BAD_NOTHING_TO_DO => "BadNothingToDo",
            StatusCode::BAD_SUBSCRIPTION_ID_INVALID => "BadSubscriptionIdInvalid",
            StatusCode::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            StatusCode::BAD_ATTRIBUTE_ID_INVALID => "BadAttributeIdInvalid",
            StatusCode::BAD_INDEX_RANGE_INVALID => "BadIndexRangeInvalid",
            StatusCode::BAD_INDEX_RANGE_NO_DATA => "BadIndexRangeNoData",
            StatusCode::BAD_MONITORED_ITEM_ID_INVALID => "BadMonitoredItemIdInvalid",
            StatusCode::BAD_MONITORED_ITEM_FILTER_INVALID => "BadMonitoredItemFilterInvalid",
            StatusCode::BAD_MONITORED_ITEM_FILTER_UNSUPPORTED => "BadMonitoredItemFilterUnsupported",
            StatusCode::BAD_FILTER_NOT_ALLOWED => "BadFilterNotAllowed",
            StatusCode::BAD_MONITORING_MODE_INVALID => "BadMonitoringModeInvalid",
            StatusCode::BAD_DEADBAND_FILTER_INVALID => "BadDeadbandFilterInvalid",
            StatusCode::BAD_WAITING_FOR_INITIAL_DATA => "BadWaitingForInitialData",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08X})", name, self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}
