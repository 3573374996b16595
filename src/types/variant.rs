//! Values and timestamped data values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StatusCode;

/// A dynamically typed attribute value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Variant {
    #[default]
    Empty,
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    ByteString(Vec<u8>),
    Array(Vec<Variant>),
}

impl Variant {
    pub fn is_empty(&self) -> bool {
        matches!(self, Variant::Empty)
    }

    /// Numeric view of a scalar value. Non-numeric scalars and arrays return `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::SByte(v) => Some(*v as f64),
            Variant::Byte(v) => Some(*v as f64),
            Variant::Int16(v) => Some(*v as f64),
            Variant::UInt16(v) => Some(*v as f64),
            Variant::Int32(v) => Some(*v as f64),
            Variant::UInt32(v) => Some(*v as f64),
            Variant::Int64(v) => Some(*v as f64),
            Variant::UInt64(v) => Some(*v as f64),
            Variant::Float(v) => Some(*v as f64),
            Variant::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Structural equality where NaN equals NaN.
    ///
    /// Plain `==` follows IEEE semantics and would report every NaN sample as a change.
    pub fn same_as(&self, other: &Variant) -> bool {
        match (self, other) {
            (Variant::Float(a), Variant::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Variant::Double(a), Variant::Double(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Variant::Array(a), Variant::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            _ => self == other,
        }
    }

    /// Select `[low, high]` out of an array, or out of a string/byte string.
    pub fn slice(&self, low: usize, high: usize) -> Option<Variant> {
        match self {
            Variant::Array(items) if low < items.len() => {
                let end = high.min(items.len() - 1);
                Some(Variant::Array(items[low..=end].to_vec()))
            }
            Variant::String(s) if low < s.chars().count() => {
                let end = high.min(s.chars().count() - 1);
                let taken: String = s.chars().skip(low).take(end - low + 1).collect();
                Some(Variant::String(taken))
            }
            Variant::ByteString(b) if low < b.len() => {
                let end = high.min(b.len() - 1);
                Some(Variant::ByteString(b[low..=end].to_vec()))
            }
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Variant {
                fn from(v: $ty) -> Self {
                    Variant::$variant(v)
                }
            }
        )*
    };
}

impl_from!(
    bool => Boolean,
    i8 => SByte,
    u8 => Byte,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float,
    f64 => Double,
    String => String,
    DateTime<Utc> => DateTime,
);

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_string())
    }
}

impl<T: Into<Variant>> From<Vec<T>> for Variant {
    fn from(v: Vec<T>) -> Self {
        Variant::Array(v.into_iter().map(Into::into).collect())
    }
}

/// A value with its status and timestamps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataValue {
    pub value: Variant,
    pub status: StatusCode,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// A good value stamped with the current time.
    pub fn new(value: impl Into<Variant>) -> Self {
        let now = Utc::now();
        Self {
            value: value.into(),
            status: StatusCode::GOOD,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        }
    }

    /// A value-less data value carrying only a status.
    pub fn from_status(status: StatusCode) -> Self {
        Self {
            value: Variant::Empty,
            status,
            source_timestamp: None,
            server_timestamp: Some(Utc::now()),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_source_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.source_timestamp = Some(ts);
        self
    }
}
