use std::cmp::Ordering;
use std::fmt;

use regex::RegexBuilder;

use super::{equivalence, ColumnTypeResolver, ConditionTree};
use crate::clock::TimeContext;
use crate::error::{Result, ToolkitError};
use crate::schema::Operator;
use crate::value::{field_value, Record, Value};

/// Operators [`ConditionTreeLeaf::matches`] evaluates directly. Every other
/// operator is first rewritten into these through the equivalence table.
const NATIVE_OPERATORS: [Operator; 20] = [
    Operator::Present,
    Operator::Blank,
    Operator::Missing,
    Operator::Equal,
    Operator::NotEqual,
    Operator::LessThan,
    Operator::GreaterThan,
    Operator::In,
    Operator::NotIn,
    Operator::Like,
    Operator::StartsWith,
    Operator::EndsWith,
    Operator::Contains,
    Operator::NotContains,
    Operator::Match,
    Operator::LongerThan,
    Operator::ShorterThan,
    Operator::IncludesAll,
    Operator::Before,
    Operator::After,
];

/// `field operator value`. Valueless operators carry [`Value::Null`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConditionTreeLeaf {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl ConditionTreeLeaf {
    #[must_use]
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self { field: field.into(), operator, value: value.into() }
    }

    #[must_use]
    pub fn override_field(&self, field: impl Into<String>) -> Self {
        Self { field: field.into(), ..self.clone() }
    }

    #[must_use]
    pub fn override_operator(&self, operator: Operator) -> Self {
        Self { operator, ..self.clone() }
    }

    #[must_use]
    pub fn override_value(&self, value: impl Into<Value>) -> Self {
        Self { value: value.into(), ..self.clone() }
    }

    #[must_use]
    pub fn with(&self, operator: Operator, value: impl Into<Value>) -> Self {
        Self { field: self.field.clone(), operator, value: value.into() }
    }

    /// Leaf with the opposite operator.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::ConditionTree`] when the operator has no inverse.
    pub fn inverse(&self) -> Result<ConditionTreeLeaf> {
        self.operator
            .inverse()
            .map(|operator| self.override_operator(operator))
            .ok_or_else(|| {
                ToolkitError::condition_tree(format!("operator '{}' cannot be inverted", self.operator))
            })
    }

    /// Leaf values as a list; a scalar counts as a one-element list.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        match &self.value {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }

    pub(super) fn matches(
        &self,
        record: &Record,
        columns: &dyn ColumnTypeResolver,
        time: &TimeContext,
    ) -> Result<bool> {
        let actual = field_value(record, &self.field);
        let expected = &self.value;
        let matched = match self.operator {
            Operator::Present => !actual.is_blank(),
            Operator::Blank => actual.is_blank(),
            Operator::Missing => actual.is_null(),
            Operator::Equal => actual.loose_eq(expected),
            Operator::NotEqual => !actual.loose_eq(expected),
            Operator::LessThan => actual.compare(expected) == Some(Ordering::Less),
            Operator::GreaterThan => actual.compare(expected) == Some(Ordering::Greater),
            Operator::Before => actual.compare(expected) == Some(Ordering::Less),
            Operator::After => actual.compare(expected) == Some(Ordering::Greater),
            Operator::In => self.values().iter().any(|value| actual.loose_eq(value)),
            Operator::NotIn => !self.values().iter().any(|value| actual.loose_eq(value)),
            Operator::Like => like(actual, expected)?,
            Operator::StartsWith => text_pair(actual, expected).is_some_and(|(a, e)| a.starts_with(e)),
            Operator::EndsWith => text_pair(actual, expected).is_some_and(|(a, e)| a.ends_with(e)),
            Operator::Contains => contains(actual, expected),
            Operator::NotContains => !contains(actual, expected),
            Operator::Match => regex_match(actual, expected)?,
            Operator::LongerThan => length(actual).zip(expected.as_i64()).is_some_and(|(len, n)| len > n),
            Operator::ShorterThan => length(actual).zip(expected.as_i64()).is_some_and(|(len, n)| len < n),
            Operator::IncludesAll => match actual.as_array() {
                Some(items) => self
                    .values()
                    .iter()
                    .all(|value| items.iter().any(|item| item.loose_eq(value))),
                None => false,
            },
            _ => return self.matches_through_equivalent(record, columns, time),
        };
        Ok(matched)
    }

    fn matches_through_equivalent(
        &self,
        record: &Record,
        columns: &dyn ColumnTypeResolver,
        time: &TimeContext,
    ) -> Result<bool> {
        let column_type = columns.column_type(&self.field).ok_or_else(|| {
            ToolkitError::condition_tree(format!("cannot evaluate '{self}': unknown column type"))
        })?;
        let native = NATIVE_OPERATORS.into_iter().collect();
        match equivalence::equivalent_tree(self, &native, &column_type, time)? {
            Some(tree) if tree != ConditionTree::Leaf(self.clone()) => tree.matches(record, columns, time),
            _ => Err(ToolkitError::condition_tree(format!(
                "operator '{}' cannot be evaluated on '{}'",
                self.operator, self.field
            ))),
        }
    }
}

impl fmt::Display for ConditionTreeLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_null() && self.operator.is_valueless() {
            write!(f, "{} {}", self.field, self.operator)
        } else {
            write!(f, "{} {} {}", self.field, self.operator, self.value.display())
        }
    }
}

fn text_pair<'a>(actual: &'a Value, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    actual.as_str().zip(expected.as_str())
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(text) => expected.as_str().is_some_and(|needle| text.contains(needle)),
        Value::Array(items) => items.iter().any(|item| item.loose_eq(expected)),
        _ => false,
    }
}

fn length(value: &Value) -> Option<i64> {
    let len = match value {
        Value::String(text) => text.chars().count(),
        Value::Array(items) => items.len(),
        _ => return None,
    };
    i64::try_from(len).ok()
}

/// SQL `LIKE`: `%` is any run of characters, `_` one character,
/// case-insensitive, anchored on both ends. Null never matches.
fn like(actual: &Value, pattern: &Value) -> Result<bool> {
    let (Some(text), Some(pattern)) = (actual.as_str(), pattern.as_str()) else {
        return Ok(false);
    };
    let translated = regex::escape(pattern).replace('%', ".*").replace('_', ".");
    let regex = RegexBuilder::new(&format!("^{translated}$"))
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|err| ToolkitError::condition_tree(format!("invalid like pattern: {err}")))?;
    Ok(regex.is_match(text))
}

fn regex_match(actual: &Value, pattern: &Value) -> Result<bool> {
    let (Some(text), Some(pattern)) = (actual.as_str(), pattern.as_str()) else {
        return Ok(false);
    };
    let regex = RegexBuilder::new(pattern)
        .build()
        .map_err(|err| ToolkitError::condition_tree(format!("invalid match pattern: {err}")))?;
    Ok(regex.is_match(text))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::clock::utc;
    use crate::schema::{CollectionSchema, ColumnSchema, PrimitiveType};
    use crate::value::to_record;

    fn schema() -> CollectionSchema {
        CollectionSchema::new()
            .with_field("title", ColumnSchema::new(PrimitiveType::String))
            .with_field("tags", ColumnSchema::new(crate::schema::ColumnType::Array(Box::new(
                PrimitiveType::String.into(),
            ))))
            .with_field("published", ColumnSchema::new(PrimitiveType::Date))
            .with_field("pages", ColumnSchema::new(PrimitiveType::Number))
    }

    fn time() -> TimeContext {
        TimeContext::new(utc(), Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap())
    }

    fn check(leaf: ConditionTreeLeaf, record: serde_json::Value) -> bool {
        leaf.matches(&to_record(record), &schema(), &time()).unwrap()
    }

    #[test]
    fn like_translates_wildcards_case_insensitively() {
        let leaf = ConditionTreeLeaf::new("title", Operator::Like, "found%");
        assert!(check(leaf.clone(), json!({"title": "Foundation"})));
        assert!(!check(leaf, json!({"title": "The Foundation"})));

        let single = ConditionTreeLeaf::new("title", Operator::Like, "a_c");
        assert!(check(single.clone(), json!({"title": "ABC"})));
        assert!(!check(single, json!({"title": "abbc"})));
    }

    #[test]
    fn like_escapes_regex_metacharacters() {
        let leaf = ConditionTreeLeaf::new("title", Operator::Like, "1+1=%");
        assert!(check(leaf.clone(), json!({"title": "1+1=2"})));
        assert!(!check(leaf, json!({"title": "11=2"})));
    }

    #[test]
    fn like_never_matches_null() {
        let leaf = ConditionTreeLeaf::new("title", Operator::Like, "%");
        assert!(!check(leaf, json!({"title": null})));
    }

    #[test]
    fn lengths_and_lists() {
        assert!(check(
            ConditionTreeLeaf::new("title", Operator::LongerThan, 3),
            json!({"title": "Dune!"})
        ));
        assert!(check(
            ConditionTreeLeaf::new("title", Operator::ShorterThan, 5),
            json!({"title": "Dune"})
        ));
        assert!(check(
            ConditionTreeLeaf::new("pages", Operator::In, vec![Value::from(1), Value::from(2.0)]),
            json!({"pages": 2})
        ));
        assert!(check(
            ConditionTreeLeaf::new("tags", Operator::IncludesAll, vec![Value::from("a"), Value::from("b")]),
            json!({"tags": ["b", "c", "a"]})
        ));
        assert!(!check(
            ConditionTreeLeaf::new("tags", Operator::IncludesAll, vec![Value::from("a"), Value::from("z")]),
            json!({"tags": ["a"]})
        ));
    }

    #[test]
    fn blank_present_missing() {
        assert!(check(ConditionTreeLeaf::new("title", Operator::Blank, Value::Null), json!({"title": ""})));
        assert!(check(ConditionTreeLeaf::new("title", Operator::Present, Value::Null), json!({"title": "x"})));
        assert!(!check(ConditionTreeLeaf::new("title", Operator::Missing, Value::Null), json!({"title": ""})));
    }

    #[test]
    fn relative_dates_go_through_equivalence() {
        let yesterday = ConditionTreeLeaf::new("published", Operator::Yesterday, Value::Null);
        assert!(check(yesterday.clone(), json!({"published": "2024-06-14T08:00:00Z"})));
        assert!(!check(yesterday, json!({"published": "2024-06-15T08:00:00Z"})));

        let past = ConditionTreeLeaf::new("published", Operator::Past, Value::Null);
        assert!(check(past, json!({"published": "2020-01-01T00:00:00Z"})));
    }

    #[test]
    fn unevaluable_operator_is_an_error() {
        let leaf = ConditionTreeLeaf::new("title", Operator::Yesterday, Value::Null);
        let err = leaf.matches(&to_record(json!({"title": "x"})), &schema(), &time()).unwrap_err();
        assert!(matches!(err, ToolkitError::ConditionTree(_)));
    }

    #[test]
    fn display_omits_null_for_valueless_operators() {
        assert_eq!(ConditionTreeLeaf::new("title", Operator::Present, Value::Null).to_string(), "title present");
        assert_eq!(ConditionTreeLeaf::new("id", Operator::Equal, 3).to_string(), "id equal 3");
    }
}
