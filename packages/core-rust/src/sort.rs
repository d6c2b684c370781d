//! Sort clauses and client-side sorting.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ToolkitError};
use crate::projection::Projection;
use crate::value::{field_value, Record};

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortClause {
    pub field: String,
    pub ascending: bool,
}

impl SortClause {
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), ascending: true }
    }

    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), ascending: false }
    }
}

/// Ordered list of sort clauses; earlier clauses take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sort(pub Vec<SortClause>);

impl Sort {
    #[must_use]
    pub fn new(clauses: Vec<SortClause>) -> Self {
        Self(clauses)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clauses(&self) -> impl Iterator<Item = &SortClause> {
        self.0.iter()
    }

    /// Fields the sort reads.
    #[must_use]
    pub fn projection(&self) -> Projection {
        self.0.iter().map(|clause| clause.field.clone()).collect()
    }

    /// Maps each clause to zero or more clauses.
    ///
    /// # Errors
    ///
    /// Propagates the first callback error.
    pub fn replace_clauses(
        &self,
        mut callback: impl FnMut(&SortClause) -> Result<Vec<SortClause>>,
    ) -> Result<Sort> {
        let mut clauses = Vec::with_capacity(self.0.len());
        for clause in &self.0 {
            clauses.extend(callback(clause)?);
        }
        Ok(Sort(clauses))
    }

    #[must_use]
    pub fn nest(&self, prefix: &str) -> Sort {
        if prefix.is_empty() {
            return self.clone();
        }
        Sort(
            self.0
                .iter()
                .map(|clause| SortClause {
                    field: format!("{prefix}:{}", clause.field),
                    ascending: clause.ascending,
                })
                .collect(),
        )
    }

    /// Strips the relation prefix shared by every clause.
    ///
    /// # Errors
    ///
    /// Fails when clauses do not share a single relation prefix.
    pub fn unnest(&self) -> Result<Sort> {
        let Some(first) = self.0.first() else {
            return Ok(Sort::default());
        };
        let prefix = first
            .field
            .split_once(':')
            .map(|(prefix, _)| format!("{prefix}:"))
            .ok_or_else(|| ToolkitError::schema("cannot unnest sort"))?;
        self.0
            .iter()
            .map(|clause| {
                clause
                    .field
                    .strip_prefix(prefix.as_str())
                    .map(|field| SortClause { field: field.to_string(), ascending: clause.ascending })
                    .ok_or_else(|| ToolkitError::schema("cannot unnest sort"))
            })
            .collect::<Result<Vec<_>>>()
            .map(Sort)
    }

    /// Flips the direction of every clause.
    #[must_use]
    pub fn inverse(&self) -> Sort {
        Sort(
            self.0
                .iter()
                .map(|clause| SortClause { field: clause.field.clone(), ascending: !clause.ascending })
                .collect(),
        )
    }

    /// Sorts records in place: stable, nulls first in ascending order.
    ///
    /// Clauses are applied last to first, so earlier clauses win and exact
    /// ties keep their input order.
    pub fn apply(&self, records: &mut [Record]) {
        for clause in self.0.iter().rev() {
            records.sort_by(|a, b| {
                let ordering = field_value(a, &clause.field).sort_cmp(field_value(b, &clause.field));
                if clause.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
    }
}

impl From<Vec<SortClause>> for Sort {
    fn from(clauses: Vec<SortClause>) -> Self {
        Self(clauses)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::value::{to_record, Value};

    fn titles(records: &[Record]) -> Vec<&Value> {
        records.iter().map(|record| &record["title"]).collect()
    }

    #[test]
    fn later_clauses_break_ties() {
        let mut records = vec![
            to_record(json!({"title": "b", "year": 2000})),
            to_record(json!({"title": "a", "year": 2001})),
            to_record(json!({"title": "c", "year": 2000})),
        ];
        Sort::new(vec![SortClause::asc("year"), SortClause::desc("title")]).apply(&mut records);
        assert_eq!(
            titles(&records),
            vec![&Value::from("c"), &Value::from("b"), &Value::from("a")]
        );
    }

    #[test]
    fn exact_ties_keep_input_order() {
        let mut records = vec![
            to_record(json!({"title": "first", "rank": 1})),
            to_record(json!({"title": "second", "rank": 1})),
        ];
        Sort::new(vec![SortClause::desc("rank")]).apply(&mut records);
        assert_eq!(titles(&records), vec![&Value::from("first"), &Value::from("second")]);
    }

    #[test]
    fn nulls_sort_first_ascending() {
        let mut records = vec![
            to_record(json!({"title": "x", "score": 3})),
            to_record(json!({"title": "y", "score": null})),
        ];
        Sort::new(vec![SortClause::asc("score")]).apply(&mut records);
        assert_eq!(titles(&records), vec![&Value::from("y"), &Value::from("x")]);
    }

    #[test]
    fn nest_unnest_inverse() {
        let sort = Sort::new(vec![SortClause::asc("name")]);
        let nested = sort.nest("author");
        assert_eq!(nested.0[0].field, "author:name");
        assert_eq!(nested.unnest().unwrap(), sort);
        assert!(!sort.inverse().0[0].ascending);
        assert!(sort.unnest().is_err());
    }
}
