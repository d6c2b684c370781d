//! Projection: the ordered set of field paths an operation returns.
//!
//! Paths are colon-separated (`author:address:city`). A projection splits
//! into its top-level columns and a map of relation name to the nested
//! projection requested on that relation.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Result, ToolkitError};
use crate::value::{Record, Value};

/// Ordered, duplicate-free list of field paths.
///
/// Equality ignores order.
#[derive(Debug, Clone, Default, Eq)]
pub struct Projection(Vec<String>);

impl Projection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.0.iter().any(|candidate| candidate == path)
    }

    /// Appends a path unless already present.
    pub fn push(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.contains(&path) {
            self.0.push(path);
        }
    }

    /// Top-level columns (paths without a relation prefix).
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        self.iter().filter(|path| !path.contains(':')).collect()
    }

    /// Relation name to nested projection, in first-seen order of relation.
    #[must_use]
    pub fn relations(&self) -> Vec<(String, Projection)> {
        let mut relations: Vec<(String, Projection)> = Vec::new();
        for path in &self.0 {
            if let Some((relation, rest)) = path.split_once(':') {
                match relations.iter_mut().find(|(name, _)| name == relation) {
                    Some((_, projection)) => projection.push(rest),
                    None => relations.push((relation.to_string(), Projection::from_iter([rest]))),
                }
            }
        }
        relations
    }

    /// Nested projection for one relation (empty when not requested).
    #[must_use]
    pub fn relation(&self, name: &str) -> Projection {
        let prefix = format!("{name}:");
        self.iter()
            .filter_map(|path| path.strip_prefix(prefix.as_str()))
            .collect()
    }

    /// Concatenation with duplicates removed, preserving first occurrence.
    #[must_use]
    pub fn union<'a>(&self, others: impl IntoIterator<Item = &'a Projection>) -> Projection {
        let mut result = self.clone();
        for other in others {
            for path in other.iter() {
                result.push(path);
            }
        }
        result
    }

    /// Maps every path to zero or more paths and unions the results.
    #[must_use]
    pub fn replace(&self, mut handler: impl FnMut(&str) -> Projection) -> Projection {
        let mut result = Projection::new();
        for path in self.iter() {
            for replaced in handler(path).0 {
                result.push(replaced);
            }
        }
        result
    }

    /// Fallible variant of [`Projection::replace`].
    ///
    /// # Errors
    ///
    /// Propagates the first handler error.
    pub fn try_replace(&self, mut handler: impl FnMut(&str) -> Result<Projection>) -> Result<Projection> {
        let mut result = Projection::new();
        for path in self.iter() {
            for replaced in handler(path)?.0 {
                result.push(replaced);
            }
        }
        Ok(result)
    }

    /// Prefixes every path with `prefix:`. An empty prefix is a no-op.
    #[must_use]
    pub fn nest(&self, prefix: &str) -> Projection {
        if prefix.is_empty() {
            return self.clone();
        }
        self.iter().map(|path| format!("{prefix}:{path}")).collect()
    }

    /// Strips the relation prefix shared by every path.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Projection`] when paths do not share a single
    /// relation prefix.
    pub fn unnest(&self) -> Result<Projection> {
        let Some(first) = self.0.first() else {
            return Ok(Projection::new());
        };
        let prefix = match first.split_once(':') {
            Some((prefix, _)) => format!("{prefix}:"),
            None => return Err(ToolkitError::Projection("cannot unnest projection".into())),
        };
        self.iter()
            .map(|path| {
                path.strip_prefix(prefix.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| ToolkitError::Projection("cannot unnest projection".into()))
            })
            .collect()
    }

    /// Re-projects records onto this projection, dropping unrequested fields.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Projection`] when a requested column is absent
    /// from a record.
    pub fn apply(&self, records: &[Record]) -> Result<Vec<Record>> {
        records.iter().map(|record| self.reproject(record)).collect()
    }

    fn reproject(&self, record: &Record) -> Result<Record> {
        let mut result = Record::new();
        for column in self.columns() {
            let value = record.get(column).ok_or_else(|| {
                ToolkitError::Projection(format!("the column '{column}' is missing in your record"))
            })?;
            result.insert(column.to_string(), value.clone());
        }
        for (relation, projection) in self.relations() {
            let value = match record.get(&relation) {
                Some(Value::Record(sub)) => Value::Record(projection.reproject(sub)?),
                _ => Value::Null,
            };
            result.insert(relation, value);
        }
        Ok(result)
    }
}

impl PartialEq for Projection {
    fn eq(&self, other: &Self) -> bool {
        let left: BTreeSet<&str> = self.iter().collect();
        let right: BTreeSet<&str> = other.iter().collect();
        left == right
    }
}

impl<S: Into<String>> FromIterator<S> for Projection {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut projection = Projection::new();
        for path in iter {
            projection.push(path);
        }
        projection
    }
}

impl<S: Into<String>> Extend<S> for Projection {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        for path in iter {
            self.push(path);
        }
    }
}

impl IntoIterator for Projection {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Parses the wire format: `"id,title,author:first_name"`.
impl From<&str> for Projection {
    fn from(wire: &str) -> Self {
        wire.split(',')
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .collect()
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::value::to_record;

    #[test]
    fn splits_columns_and_relations() {
        let projection = Projection::from("id,title,author:first_name,author:address:city");
        assert_eq!(projection.columns(), vec!["id", "title"]);
        let relations = projection.relations();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].0, "author");
        assert_eq!(relations[0].1, Projection::from("first_name,address:city"));
    }

    #[test]
    fn union_deduplicates_and_keeps_order() {
        let a = Projection::from("id,title");
        let b = Projection::from("title,author:id");
        assert_eq!(a.union([&b]).to_string(), "id,title,author:id");
    }

    #[test]
    fn equality_ignores_order() {
        assert_eq!(Projection::from("a,b"), Projection::from("b,a"));
        assert_ne!(Projection::from("a,b"), Projection::from("a"));
    }

    #[test]
    fn nest_and_unnest() {
        let nested = Projection::from("id,name").nest("author");
        assert_eq!(nested.to_string(), "author:id,author:name");
        assert_eq!(nested.unnest().unwrap(), Projection::from("id,name"));
        assert!(Projection::from("author:id,title").unnest().is_err());
    }

    #[test]
    fn apply_reprojects_and_keeps_null_relations() {
        let projection = Projection::from("id,author:name");
        let records = vec![
            to_record(json!({"id": 1, "title": "x", "author": {"name": "A", "age": 3}})),
            to_record(json!({"id": 2, "title": "y", "author": null})),
        ];
        let result = projection.apply(&records).unwrap();
        assert_eq!(
            Value::Array(result.into_iter().map(Value::Record).collect()).to_json(),
            json!([{"id": 1, "author": {"name": "A"}}, {"id": 2, "author": null}])
        );
    }

    #[test]
    fn apply_fails_on_missing_column() {
        let projection = Projection::from("id,title");
        let err = projection.apply(&[to_record(json!({"id": 1}))]).unwrap_err();
        assert!(matches!(err, ToolkitError::Projection(_)));
    }

    #[test]
    fn replace_expands_paths() {
        let projection = Projection::from("id,full_name");
        let replaced = projection.replace(|path| match path {
            "full_name" => Projection::from("first_name,last_name"),
            other => Projection::from_iter([other]),
        });
        assert_eq!(replaced.to_string(), "id,first_name,last_name");
    }
}
