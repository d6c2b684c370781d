//! Grouped aggregation and its in-memory evaluation.
//!
//! [`Aggregation::apply`] summarizes records in a single pass: each record
//! is mapped to its group key, the matching [`Summary`] is created on first
//! sight and updated in place, and the summaries are formatted into
//! [`AggregateResult`] rows at the end.

use std::collections::HashMap;

use chrono::{Datelike, Duration, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ToolkitError};
use crate::projection::Projection;
use crate::value::{field_value, parse_datetime, Record, Value};

/// Aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateOperation {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

/// Date truncation applied to a group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DateOperation {
    Year,
    Month,
    /// Weeks start on Monday.
    Week,
    Day,
}

impl DateOperation {
    /// Truncates `date` to the start of its bucket.
    #[must_use]
    pub fn truncate(self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Year => date.with_day(1).and_then(|d| d.with_month(1)).unwrap_or(date),
            Self::Month => date.with_day(1).unwrap_or(date),
            Self::Week => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
            Self::Day => date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationGroup {
    pub field: String,
    #[serde(rename = "operation", default, skip_serializing_if = "Option::is_none")]
    pub date_operation: Option<DateOperation>,
}

impl AggregationGroup {
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into(), date_operation: None }
    }

    #[must_use]
    pub fn by_date(field: impl Into<String>, operation: DateOperation) -> Self {
        Self { field: field.into(), date_operation: Some(operation) }
    }
}

/// `{operation, field?, groups}`: what to compute and how to group it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregation {
    pub operation: AggregateOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default)]
    pub groups: Vec<AggregationGroup>,
}

/// One output row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub value: Value,
    pub group: Record,
}

impl AggregateResult {
    #[must_use]
    pub fn new(value: impl Into<Value>, group: Record) -> Self {
        Self { value: value.into(), group }
    }
}

/// Running accumulator for one group.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub group: Record,
    /// Every record of the group, null field values included.
    pub start_count: u64,
    /// Records with a non-null field value.
    pub count: u64,
    pub sum: Value,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

impl Summary {
    fn new(group: Record) -> Self {
        Self { group, start_count: 0, count: 0, sum: Value::Int(0), min: None, max: None }
    }

    fn update(&mut self, value: Option<&Value>) {
        self.start_count += 1;
        let Some(value) = value.filter(|value| !value.is_null()) else {
            return;
        };
        self.count += 1;
        if self.min.as_ref().map_or(true, |min| value.sort_cmp(min).is_lt()) {
            self.min = Some(value.clone());
        }
        if self.max.as_ref().map_or(true, |max| value.sort_cmp(max).is_gt()) {
            self.max = Some(value.clone());
        }
        self.sum = add(&self.sum, value);
    }
}

fn add(sum: &Value, value: &Value) -> Value {
    match (sum, value) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(*b)
            .map_or_else(|| Value::from(*a as f64 + *b as f64), Value::Int),
        (a, b) if b.is_number() => Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
        (a, _) => a.clone(),
    }
}

impl Aggregation {
    #[must_use]
    pub fn new(operation: AggregateOperation) -> Self {
        Self { operation, field: None, groups: Vec::new() }
    }

    /// Shorthand for a field-less count.
    #[must_use]
    pub fn count() -> Self {
        Self::new(AggregateOperation::Count)
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: AggregationGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Fields read by the aggregation: the aggregated field and the group
    /// fields.
    #[must_use]
    pub fn projection(&self) -> Projection {
        self.field
            .iter()
            .cloned()
            .chain(self.groups.iter().map(|group| group.field.clone()))
            .collect()
    }

    /// Rewrites the aggregated field and every group field.
    #[must_use]
    pub fn replace_fields(&self, mut handler: impl FnMut(&str) -> String) -> Aggregation {
        Aggregation {
            operation: self.operation,
            field: self.field.as_deref().map(&mut handler),
            groups: self
                .groups
                .iter()
                .map(|group| AggregationGroup {
                    field: handler(&group.field),
                    date_operation: group.date_operation,
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn nest(&self, prefix: &str) -> Aggregation {
        if prefix.is_empty() || (self.field.is_none() && self.groups.is_empty()) {
            return self.clone();
        }
        self.replace_fields(|field| format!("{prefix}:{field}"))
    }

    /// Computes the aggregation over in-memory records.
    ///
    /// Rows are ordered by value and truncated to `limit`. No records means
    /// no rows.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Unprocessable`] when a count does not fit in
    /// an `i64`.
    pub fn apply(&self, records: &[Record], timezone: FixedOffset, limit: Option<usize>) -> Result<Vec<AggregateResult>> {
        let mut rows = self.format_summaries(self.create_summaries(records, timezone))?;
        rows.sort_by(|a, b| a.value.sort_cmp(&b.value));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn create_summaries(&self, records: &[Record], timezone: FixedOffset) -> Vec<Summary> {
        let mut index: HashMap<Record, usize> = HashMap::new();
        let mut summaries: Vec<Summary> = Vec::new();
        for record in records {
            let group = self.create_group(record, timezone);
            let position = match index.get(&group) {
                Some(position) => *position,
                None => {
                    summaries.push(Summary::new(group.clone()));
                    index.insert(group, summaries.len() - 1);
                    summaries.len() - 1
                }
            };
            let value = self.field.as_deref().map(|field| field_value(record, field));
            summaries[position].update(value);
        }
        summaries
    }

    fn create_group(&self, record: &Record, timezone: FixedOffset) -> Record {
        self.groups
            .iter()
            .map(|group| {
                let value = field_value(record, &group.field);
                let value = match group.date_operation {
                    Some(operation) => bucket(value, operation, timezone),
                    None => value.clone(),
                };
                (group.field.clone(), value)
            })
            .collect()
    }

    fn format_summaries(&self, summaries: Vec<Summary>) -> Result<Vec<AggregateResult>> {
        let mut rows = Vec::with_capacity(summaries.len());
        for summary in summaries.into_iter().filter(|summary| summary.start_count > 0) {
            let value = match self.operation {
                AggregateOperation::Count if self.field.is_none() => count_value(summary.start_count)?,
                AggregateOperation::Count => count_value(summary.count)?,
                AggregateOperation::Sum => summary.sum,
                AggregateOperation::Avg => {
                    if summary.count == 0 {
                        continue;
                    }
                    Value::from(summary.sum.as_f64().unwrap_or(0.0) / summary.count as f64)
                }
                AggregateOperation::Min => summary.min.unwrap_or_default(),
                AggregateOperation::Max => summary.max.unwrap_or_default(),
            };
            rows.push(AggregateResult { value, group: summary.group });
        }
        Ok(rows)
    }
}

fn count_value(count: u64) -> Result<Value> {
    i64::try_from(count)
        .map(Value::Int)
        .map_err(|_| ToolkitError::Unprocessable(format!("count {count} does not fit in an integer")))
}

/// Truncates a date group value. Plain dates are taken as is, date-times are
/// first moved into `timezone`. Unparseable values are kept unchanged.
fn bucket(value: &Value, operation: DateOperation, timezone: FixedOffset) -> Value {
    let Some(text) = value.as_str() else {
        return value.clone();
    };
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(text).map(|dt| dt.with_timezone(&timezone).date_naive()));
    match date {
        Some(date) => Value::from(operation.truncate(date).format("%Y-%m-%d").to_string()),
        None => value.clone(),
    }
}
