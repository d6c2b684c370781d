//! Relative date operators expressed as `less_than` / `greater_than` bounds.
//!
//! Bounds are computed in the filter timezone. `Dateonly` columns receive
//! plain dates, `Date` columns receive UTC instants with second precision.
//! The comparison operators are strict, so lower bounds step back one unit
//! (a day or a second) to keep the period start inclusive.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Days, Duration, FixedOffset, Months, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};

use super::Alternative;
use crate::clock::TimeContext;
use crate::condition_tree::{ConditionTree, ConditionTreeLeaf};
use crate::error::{Result, ToolkitError};
use crate::schema::{ColumnType, Operator, PrimitiveType};
use crate::value::Value;

const DATE_TYPES: [PrimitiveType; 2] = [PrimitiveType::Date, PrimitiveType::Dateonly];

#[derive(Debug, Clone, Copy)]
enum Period {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Period {
    fn start_of(self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Day => date,
            Self::Week => date - Days::new(u64::from(date.weekday().num_days_from_monday())),
            Self::Month => date.with_day(1).unwrap_or(date),
            Self::Quarter => {
                let month = (date.month0() / 3) * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date)
            }
            Self::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        }
    }

    fn previous(self, start: NaiveDate) -> NaiveDate {
        let shifted = match self {
            Self::Day => start.checked_sub_days(Days::new(1)),
            Self::Week => start.checked_sub_days(Days::new(7)),
            Self::Month => start.checked_sub_months(Months::new(1)),
            Self::Quarter => start.checked_sub_months(Months::new(3)),
            Self::Year => start.checked_sub_months(Months::new(12)),
        };
        shifted.unwrap_or(start)
    }
}

#[derive(Debug, Clone, Copy)]
enum End {
    /// Midnight (local) at the start of this date, exclusive.
    StartOf(NaiveDate),
    Now,
}

fn is_date_only(column_type: &ColumnType) -> bool {
    column_type.as_primitive() == Some(PrimitiveType::Dateonly)
}

fn format_instant(instant: DateTime<FixedOffset>) -> Value {
    Value::from(instant.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn format_bound(instant: DateTime<FixedOffset>, column_type: &ColumnType) -> Value {
    if is_date_only(column_type) {
        Value::from(instant.date_naive().to_string())
    } else {
        format_instant(instant)
    }
}

fn local_midnight(date: NaiveDate, time: &TimeContext) -> Result<DateTime<FixedOffset>> {
    time.timezone
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .single()
        .ok_or_else(|| ToolkitError::condition_tree(format!("cannot resolve midnight of {date}")))
}

fn interval(
    leaf: &ConditionTreeLeaf,
    time: &TimeContext,
    column_type: &ColumnType,
    start: NaiveDate,
    end: End,
) -> Result<ConditionTree> {
    let (lower, upper) = if is_date_only(column_type) {
        let lower = start.checked_sub_days(Days::new(1)).unwrap_or(start);
        let upper = match end {
            End::StartOf(date) => date,
            End::Now => time.local_now().date_naive() + Days::new(1),
        };
        (Value::from(lower.to_string()), Value::from(upper.to_string()))
    } else {
        let lower = local_midnight(start, time)? - Duration::seconds(1);
        let upper = match end {
            End::StartOf(date) => local_midnight(date, time)?,
            End::Now => time.local_now(),
        };
        (format_instant(lower), format_instant(upper))
    };
    Ok(ConditionTree::and(vec![
        leaf.with(Operator::GreaterThan, lower).into(),
        leaf.with(Operator::LessThan, upper).into(),
    ]))
}

fn count(leaf: &ConditionTreeLeaf) -> Result<i64> {
    leaf.value
        .as_i64()
        .or_else(|| {
            #[allow(clippy::cast_possible_truncation)]
            leaf.value.as_f64().map(|value| value as i64)
        })
        .ok_or_else(|| {
            ToolkitError::condition_tree(format!(
                "operator '{}' on '{}' expects a number, got {}",
                leaf.operator,
                leaf.field,
                leaf.value.display()
            ))
        })
}

fn today(time: &TimeContext) -> NaiveDate {
    time.local_now().date_naive()
}

/// `previous_<period>`: the whole period before the current one.
fn previous_period(period: Period) -> Alternative {
    Alternative::new([Operator::LessThan, Operator::GreaterThan], move |leaf, time, column_type| {
        let current = period.start_of(today(time));
        interval(leaf, time, column_type, period.previous(current), End::StartOf(current))
    })
    .for_types(DATE_TYPES)
}

/// `previous_<period>_to_date`: the current period up to now.
fn period_to_date(period: Period) -> Alternative {
    Alternative::new([Operator::LessThan, Operator::GreaterThan], move |leaf, time, column_type| {
        interval(leaf, time, column_type, period.start_of(today(time)), End::Now)
    })
    .for_types(DATE_TYPES)
}

fn compare(
    operator: Operator,
    bound: impl Fn(&ConditionTreeLeaf, &TimeContext) -> Result<Value> + Send + Sync + 'static,
) -> Alternative {
    Alternative::new([operator], move |leaf, time, _| Ok(leaf.with(operator, bound(leaf, time)?).into()))
        .for_types(DATE_TYPES)
}

fn literal_date(leaf: &ConditionTreeLeaf) -> Result<Value> {
    match leaf.value.as_datetime() {
        Some(_) => Ok(leaf.value.clone()),
        None => Err(ToolkitError::condition_tree(format!(
            "operator '{}' on '{}' expects a date, got {}",
            leaf.operator,
            leaf.field,
            leaf.value.display()
        ))),
    }
}

fn hours_ago(leaf: &ConditionTreeLeaf, time: &TimeContext) -> Result<Value> {
    Ok(format_instant(time.local_now() - Duration::hours(count(leaf)?)))
}

pub(super) fn register(table: &mut HashMap<Operator, Vec<Alternative>>) {
    table.insert(Operator::Before, vec![compare(Operator::LessThan, |leaf, _| literal_date(leaf))]);
    table.insert(Operator::After, vec![compare(Operator::GreaterThan, |leaf, _| literal_date(leaf))]);
    table.insert(
        Operator::Past,
        vec![Alternative::new([Operator::LessThan], |leaf, time, column_type| {
            Ok(leaf.with(Operator::LessThan, format_bound(time.local_now(), column_type)).into())
        })
        .for_types(DATE_TYPES)],
    );
    table.insert(
        Operator::Future,
        vec![Alternative::new([Operator::GreaterThan], |leaf, time, column_type| {
            Ok(leaf.with(Operator::GreaterThan, format_bound(time.local_now(), column_type)).into())
        })
        .for_types(DATE_TYPES)],
    );
    table.insert(Operator::BeforeXHoursAgo, vec![compare(Operator::LessThan, hours_ago)]);
    table.insert(Operator::AfterXHoursAgo, vec![compare(Operator::GreaterThan, hours_ago)]);

    table.insert(Operator::Yesterday, vec![previous_period(Period::Day)]);
    table.insert(Operator::PreviousWeek, vec![previous_period(Period::Week)]);
    table.insert(Operator::PreviousMonth, vec![previous_period(Period::Month)]);
    table.insert(Operator::PreviousQuarter, vec![previous_period(Period::Quarter)]);
    table.insert(Operator::PreviousYear, vec![previous_period(Period::Year)]);
    table.insert(Operator::PreviousWeekToDate, vec![period_to_date(Period::Week)]);
    table.insert(Operator::PreviousMonthToDate, vec![period_to_date(Period::Month)]);
    table.insert(Operator::PreviousQuarterToDate, vec![period_to_date(Period::Quarter)]);
    table.insert(Operator::PreviousYearToDate, vec![period_to_date(Period::Year)]);

    table.insert(
        Operator::Today,
        vec![Alternative::new([Operator::LessThan, Operator::GreaterThan], |leaf, time, column_type| {
            let start = today(time);
            interval(leaf, time, column_type, start, End::StartOf(start + Days::new(1)))
        })
        .for_types(DATE_TYPES)],
    );
    table.insert(
        Operator::PreviousXDays,
        vec![Alternative::new([Operator::LessThan, Operator::GreaterThan], |leaf, time, column_type| {
            let days = u64::try_from(count(leaf)?).unwrap_or(0);
            let end = today(time);
            let start = end.checked_sub_days(Days::new(days)).unwrap_or(end);
            interval(leaf, time, column_type, start, End::StartOf(end))
        })
        .for_types(DATE_TYPES)],
    );
    table.insert(
        Operator::PreviousXDaysToDate,
        vec![Alternative::new([Operator::LessThan, Operator::GreaterThan], |leaf, time, column_type| {
            let days = u64::try_from(count(leaf)? - 1).unwrap_or(0);
            let today = today(time);
            let start = today.checked_sub_days(Days::new(days)).unwrap_or(today);
            interval(leaf, time, column_type, start, End::Now)
        })
        .for_types(DATE_TYPES)],
    );
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::condition_tree::transforms::alternatives;

    fn resolve(operator: Operator, value: Value, column_type: PrimitiveType, time: &TimeContext) -> String {
        let leaf = ConditionTreeLeaf::new("at", operator, value);
        let column_type = ColumnType::from(column_type);
        let alternative = &alternatives()[&operator][0];
        (alternative.replacer)(&leaf, time, &column_type).unwrap().to_string()
    }

    fn wednesday_noon(offset_hours: i32) -> TimeContext {
        let timezone = FixedOffset::east_opt(offset_hours * 3600).unwrap();
        TimeContext::new(timezone, Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap())
    }

    #[test]
    fn previous_month_on_dates() {
        let time = wednesday_noon(0);
        assert_eq!(
            resolve(Operator::PreviousMonth, Value::Null, PrimitiveType::Date, &time),
            "and(at greater_than 2024-03-31T23:59:59Z, at less_than 2024-05-01T00:00:00Z)"
        );
    }

    #[test]
    fn previous_week_starts_on_monday() {
        let time = wednesday_noon(0);
        assert_eq!(
            resolve(Operator::PreviousWeek, Value::Null, PrimitiveType::Dateonly, &time),
            "and(at greater_than 2024-05-05, at less_than 2024-05-13)"
        );
    }

    #[test]
    fn today_respects_timezone() {
        let time = wednesday_noon(-14);
        assert_eq!(
            resolve(Operator::Today, Value::Null, PrimitiveType::Date, &time),
            "and(at greater_than 2024-05-14T13:59:59Z, at less_than 2024-05-15T14:00:00Z)"
        );
    }

    #[test]
    fn previous_quarter_to_date_ends_now() {
        let time = wednesday_noon(0);
        assert_eq!(
            resolve(Operator::PreviousQuarterToDate, Value::Null, PrimitiveType::Date, &time),
            "and(at greater_than 2024-03-31T23:59:59Z, at less_than 2024-05-15T12:00:00Z)"
        );
    }

    #[test]
    fn previous_x_days_uses_leaf_value() {
        let time = wednesday_noon(0);
        assert_eq!(
            resolve(Operator::PreviousXDays, Value::from(3), PrimitiveType::Dateonly, &time),
            "and(at greater_than 2024-05-11, at less_than 2024-05-15)"
        );
    }

    #[test]
    fn hours_ago_counts_back_from_now() {
        let time = wednesday_noon(0);
        assert_eq!(
            resolve(Operator::BeforeXHoursAgo, Value::from(2), PrimitiveType::Date, &time),
            "at less_than 2024-05-15T10:00:00Z"
        );
        assert_eq!(
            resolve(Operator::AfterXHoursAgo, Value::from(2), PrimitiveType::Date, &time),
            "at greater_than 2024-05-15T10:00:00Z"
        );
    }

    #[test]
    fn before_rejects_non_dates() {
        let leaf = ConditionTreeLeaf::new("at", Operator::Before, "soon");
        let alternative = &alternatives()[&Operator::Before][0];
        let column_type = ColumnType::from(PrimitiveType::Date);
        assert!((alternative.replacer)(&leaf, &wednesday_noon(0), &column_type).is_err());
    }
}
