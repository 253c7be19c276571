//! Engine values and their conversion into caller-facing values
//!
//! Every field the engine hands back carries its own logical type tag ([`NativeValue`]).
//! Conversion is driven by that tag alone, never by the column's declared type, so loosely
//! typed columns convert the same way as strictly typed ones.

use chrono::{DateTime, NaiveDate, Utc};
use ducklet_common::BigIntMode;
use serde::Serialize;

/// Days between 0001-01-01 (CE day 1) and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// One field of an engine tuple, tagged with its logical type
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    /// Fixed-point number: `unscaled * 10^-scale`
    Decimal { unscaled: i128, scale: i8 },
    Double(f64),
    Varchar(String),
    /// Microseconds since the Unix epoch, UTC
    Timestamp(i64),
    /// Days since the Unix epoch
    Date(i32),
    /// Microseconds since midnight
    Time(i64),
}

/// A value handed to callers
///
/// Serializes to plain JSON: `null`, booleans, numbers, strings and RFC 3339 timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    /// Every integer width, decimals, doubles and times of day (milliseconds since midnight)
    Number(f64),
    /// 64-bit integers under [`BigIntMode::Exact`]
    BigInt(i64),
    String(String),
    /// Dates (at UTC midnight) and timestamps
    DateTime(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view; exact 64-bit integers are widened
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::BigInt(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

/// Convert one engine field into a caller value.
///
/// 64-bit integers become `f64` under [`BigIntMode::Lossy`]; values past 2^53 round to the
/// nearest representable double instead of failing. Out-of-range dates and timestamps (DuckDB's
/// `infinity`) clamp to the representable bounds.
pub fn coerce(value: NativeValue, bigint_mode: BigIntMode) -> Value {
    match value {
        NativeValue::Null => Value::Null,
        NativeValue::Boolean(b) => Value::Boolean(b),
        NativeValue::TinyInt(v) => Value::Number(f64::from(v)),
        NativeValue::SmallInt(v) => Value::Number(f64::from(v)),
        NativeValue::Integer(v) => Value::Number(f64::from(v)),
        NativeValue::BigInt(v) => match bigint_mode {
            BigIntMode::Lossy => Value::Number(v as f64),
            BigIntMode::Exact => Value::BigInt(v),
        },
        NativeValue::Decimal { unscaled, scale } => Value::Number(decimal_to_f64(unscaled, scale)),
        NativeValue::Double(v) => Value::Number(v),
        NativeValue::Varchar(s) => Value::String(s),
        NativeValue::Date(days) => Value::DateTime(date_to_utc(days)),
        NativeValue::Timestamp(micros) => Value::DateTime(timestamp_to_utc(micros)),
        NativeValue::Time(micros) => Value::Number(micros as f64 / 1000.0),
    }
}

/// Convert a whole tuple, preserving field order
pub fn coerce_row(values: Vec<NativeValue>, bigint_mode: BigIntMode) -> Vec<Value> {
    values
        .into_iter()
        .map(|value| coerce(value, bigint_mode))
        .collect()
}

/// Decimal to the nearest double, rounding once from the exact decimal text
fn decimal_to_f64(unscaled: i128, scale: i8) -> f64 {
    format!("{}e{}", unscaled, -i32::from(scale))
        .parse()
        .unwrap_or(f64::NAN)
}

fn date_to_utc(days: i32) -> DateTime<Utc> {
    days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .unwrap_or(if days < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

fn timestamp_to_utc(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(if micros < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}
