//! Core data types for telemon
//!
//! This module contains the value objects that flow through every part of
//! the engine.
//!
//! # Main Types
//!
//! - [`Value`] - Tagged variant for a point's payload (number, string, angle, ...)
//! - [`Sample`] - A timestamped, possibly-null value for one point plus its alarm flag
//! - [`Timestamp`] / [`Period`] - chrono instants and spans used for all time math
//!
//! # Null Values
//!
//! A [`Sample`] whose value is `None` means "no valid data this cycle". It is
//! never confused with `Int(0)` or `Bool(false)`, and the descriptor treats it
//! as a skip signal for the buffer, archive and alarm registry.
//!
//! # Immutability
//!
//! Samples have private fields. Stages that only want to move the timestamp
//! or swap the value use the `with_*` builders, which return a fresh copy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Wall-clock instant used for sample timestamps and scheduling epochs
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Signed time span used for periods, windows and retry intervals
pub type Period = chrono::Duration;

/// Build a timestamp from microseconds since the Unix epoch
pub fn timestamp_from_micros(micros: i64) -> Timestamp {
    Timestamp::from_timestamp_micros(micros).unwrap_or(Timestamp::UNIX_EPOCH)
}

/// Build a timestamp from whole seconds since the Unix epoch
pub fn timestamp_from_secs(secs: i64) -> Timestamp {
    timestamp_from_micros(secs.saturating_mul(1_000_000))
}

/// Convert a floating point number of seconds to a [`Period`]
pub fn period_from_secs_f64(secs: f64) -> Period {
    Period::microseconds((secs * 1_000_000.0).round() as i64)
}

/// Seconds as `f64` for a [`Period`]
pub fn period_as_secs_f64(period: Period) -> f64 {
    period.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}

/// The payload of a sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Angle in radians
    Angle(f64),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Numeric view of the value. Angles yield radians.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Angle(a) => Some(*a),
            _ => None,
        }
    }

    /// True for `Int` and `Float` (angles are deliberately excluded)
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the variant, used in log messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Angle(_) => "angle",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Whether two values carry the same variant
    pub fn same_kind(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Angle(a) => write!(f, "{}", a),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Interpret a value as a boolean.
///
/// Booleans pass through, numbers are true when non-zero and the strings
/// `"true"`/`"false"` are accepted case-insensitively. Anything else is
/// rejected.
pub fn parse_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Int(i) => Some(*i != 0),
        Value::Float(f) => Some(*f != 0.0),
        Value::Str(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::Str(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// A single timestamped reading for a point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    name: String,
    timestamp: Timestamp,
    value: Option<Value>,
    alarm: bool,
}

impl Sample {
    /// Create a sample carrying a value
    pub fn new(name: impl Into<String>, timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            timestamp,
            value: Some(value.into()),
            alarm: false,
        }
    }

    /// Create a sample from an optional value
    pub fn from_option(name: impl Into<String>, timestamp: Timestamp, value: Option<Value>) -> Self {
        Self {
            name: name.into(),
            timestamp,
            value,
            alarm: false,
        }
    }

    /// Create a "no valid data" sample
    pub fn null(name: impl Into<String>, timestamp: Timestamp) -> Self {
        Self::from_option(name, timestamp, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn alarm(&self) -> bool {
        self.alarm
    }

    /// True when the sample carries a value
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_ref().and_then(Value::as_f64)
    }

    /// Consume the sample, returning its value
    pub fn into_value(self) -> Option<Value> {
        self.value
    }

    /// Copy with a different value; timestamp and alarm are kept
    pub fn with_value(&self, value: Option<Value>) -> Self {
        Self {
            name: self.name.clone(),
            timestamp: self.timestamp,
            value,
            alarm: self.alarm,
        }
    }

    /// Copy with a different timestamp
    pub fn with_timestamp(&self, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    /// Copy with the alarm flag set as given
    pub fn with_alarm(&self, alarm: bool) -> Self {
        Self {
            alarm,
            ..self.clone()
        }
    }

    /// Copy attributed to another point name
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{} @ {} = {}", self.name, self.timestamp, v)?,
            None => write!(f, "{} @ {} = null", self.name, self.timestamp)?,
        }
        if self.alarm {
            write!(f, " [ALARM]")?;
        }
        Ok(())
    }
}
