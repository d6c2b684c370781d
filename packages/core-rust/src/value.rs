//! Record values.
//!
//! A [`Record`] is an ordered map of field names to [`Value`]s. Relation fields
//! hold nested records (to-one) and every other field holds a scalar, an array
//! or `Null`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// A record: field name to value, iterated in key order.
pub type Record = BTreeMap<String, Value>;

/// Runtime value of a record field or a condition tree leaf.
///
/// Dates travel as ISO-8601 strings and are parsed on demand when compared
/// or bucketed. `Float` wraps `OrderedFloat` so values can be hashed and used
/// as grouping keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Value {
    /// Absent or SQL `NULL`.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(OrderedFloat<f64>),
    /// UTF-8 string (also used for dates, uuids and enum members).
    String(String),
    /// Raw binary payload.
    Bytes(Vec<u8>),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Nested record (to-one relation or JSON object).
    Record(Record),
}

static NULL: Value = Value::Null;

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Null, empty string, empty array and empty record all count as blank.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.is_empty(),
            Self::Array(items) => items.is_empty(),
            Self::Record(record) => record.is_empty(),
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float(f) if f.fract() == 0.0 => Some(f.0 as i64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(f.0),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    /// Parses a string value as a date-time.
    ///
    /// Accepts RFC 3339, naive date-times (read as UTC), and plain dates
    /// (midnight UTC).
    #[must_use]
    pub fn as_datetime(&self) -> Option<DateTime<FixedOffset>> {
        self.as_str().and_then(parse_datetime)
    }

    /// Partial comparison used by ordering operators and min/max.
    ///
    /// Numbers compare numerically across `Int`/`Float`. Strings that both
    /// parse as dates compare chronologically, other strings lexically.
    /// Values of unrelated kinds are incomparable.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (a, b) if a.is_number() && b.is_number() => {
                a.as_f64()?.partial_cmp(&b.as_f64()?)
            }
            (Self::String(a), Self::String(b)) => match (parse_datetime(a), parse_datetime(b)) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => Some(a.cmp(b)),
            },
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used by sorting: nulls first, then [`Value::compare`],
    /// then the structural order as a tie-breaker for unrelated kinds.
    #[must_use]
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.compare(other).unwrap_or_else(|| self.cmp(other)),
        }
    }

    /// Loose equality: `Int(1)` equals `Float(1.0)`, otherwise structural.
    #[must_use]
    pub fn loose_eq(&self, other: &Value) -> bool {
        if self.is_number() && other.is_number() {
            return self.compare(other) == Some(Ordering::Equal);
        }
        self == other
    }

    /// Human-readable rendering used in messages and context variable
    /// substitution.
    #[must_use]
    pub fn display(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.0.to_string(),
            Self::String(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }

    /// Converts to JSON. Bytes become base64 strings.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(f.0).map_or(Json::Null, Json::Number),
            Self::String(s) => Json::String(s.clone()),
            Self::Bytes(bytes) => Json::String(STANDARD.encode(bytes)),
            Self::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Self::Record(record) => Json::Object(
                record
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(OrderedFloat(n.as_f64().unwrap_or(f64::NAN))),
            },
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => Self::Record(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(OrderedFloat(f))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Self::Record(record)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

/// Builds a record from a JSON object. Non-objects yield an empty record.
#[must_use]
pub fn to_record(json: serde_json::Value) -> Record {
    match Value::from(json) {
        Value::Record(record) => record,
        _ => Record::new(),
    }
}

/// Reads a possibly relation-qualified path (`author:address:city`).
///
/// Missing fields and null relations read as [`Value::Null`].
#[must_use]
pub fn field_value<'a>(record: &'a Record, path: &str) -> &'a Value {
    match path.split_once(':') {
        None => record.get(path).unwrap_or(&NULL),
        Some((head, rest)) => match record.get(head) {
            Some(Value::Record(sub)) => field_value(sub, rest),
            _ => &NULL,
        },
    }
}

/// Writes a possibly relation-qualified path, creating intermediate records.
pub fn set_field_value(record: &mut Record, path: &str, value: Value) {
    match path.split_once(':') {
        None => {
            record.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = record
                .entry(head.to_string())
                .or_insert_with(|| Value::Record(Record::new()));
            if !matches!(entry, Value::Record(_)) {
                *entry = Value::Record(Record::new());
            }
            if let Value::Record(sub) = entry {
                set_field_value(sub, rest, value);
            }
        }
    }
}

/// Parses an ISO-8601 date or date-time string.
#[must_use]
pub fn parse_datetime(input: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt);
    }
    let utc = FixedOffset::east_opt(0)?;
    let trimmed = input.trim_end_matches('Z');
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return utc.from_local_datetime(&naive).single();
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return utc
            .from_local_datetime(&date.and_time(NaiveTime::MIN))
            .single();
    }
    None
}
