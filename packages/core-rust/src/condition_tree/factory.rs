//! Builders for common condition trees.

use super::{Aggregator, ConditionTree, ConditionTreeBranch};
use crate::error::{Result, ToolkitError};
use crate::schema::{CollectionSchema, Operator};
use crate::value::{Record, Value};

pub use super::plain::from_plain_object;

/// A tree no record matches: an empty OR.
#[must_use]
pub fn match_none() -> ConditionTree {
    ConditionTree::or(Vec::new())
}

/// OR of the given trees, flattening nested ORs. A single tree is returned
/// as is; no tree at all yields [`match_none`].
#[must_use]
pub fn union(trees: impl IntoIterator<Item = ConditionTree>) -> ConditionTree {
    group(Aggregator::Or, trees)
}

/// AND of the given trees, flattening nested ANDs.
///
/// `None` means "no condition", which matches every record.
#[must_use]
pub fn intersect(trees: impl IntoIterator<Item = ConditionTree>) -> Option<ConditionTree> {
    match group(Aggregator::And, trees) {
        ConditionTree::Branch(ConditionTreeBranch { conditions, .. }) if conditions.is_empty() => None,
        tree => Some(tree),
    }
}

fn group(aggregator: Aggregator, trees: impl IntoIterator<Item = ConditionTree>) -> ConditionTree {
    let mut conditions = Vec::new();
    for tree in trees {
        match tree {
            ConditionTree::Branch(branch) if branch.aggregator == aggregator => {
                conditions.extend(branch.conditions);
            }
            other => conditions.push(other),
        }
    }
    if conditions.len() == 1 {
        if let Some(single) = conditions.pop() {
            return single;
        }
    }
    ConditionTree::branch(aggregator, conditions)
}

/// Primary key values of a record, in primary key order.
///
/// # Errors
///
/// Fails when the collection has no primary key or the record lacks one of
/// its values.
pub fn record_id(schema: &CollectionSchema, record: &Record) -> Result<Vec<Value>> {
    let primary_keys = schema.primary_keys();
    if primary_keys.is_empty() {
        return Err(ToolkitError::schema("collection must have at least one primary key"));
    }
    primary_keys
        .iter()
        .map(|key| {
            record
                .get(key)
                .cloned()
                .ok_or_else(|| ToolkitError::schema(format!("missing primary key value '{key}' in record")))
        })
        .collect()
}

/// Tree matching exactly the given records, by primary key.
///
/// # Errors
///
/// See [`record_id`] and [`match_ids`].
pub fn match_records(schema: &CollectionSchema, records: &[Record]) -> Result<ConditionTree> {
    let ids = records
        .iter()
        .map(|record| record_id(schema, record))
        .collect::<Result<Vec<_>>>()?;
    match_ids(schema, &ids)
}

/// Tree matching the given composite ids.
///
/// Composite keys are grouped by their leading value so the tree stays
/// compact: `(a=1 AND b IN [2,3]) OR (a=4 AND b=5)`.
///
/// # Errors
///
/// Fails when the collection has no primary key or a primary key column
/// supports neither `equal` nor `in`.
pub fn match_ids(schema: &CollectionSchema, ids: &[Vec<Value>]) -> Result<ConditionTree> {
    let primary_keys = schema.primary_keys();
    if primary_keys.is_empty() {
        return Err(ToolkitError::schema("collection must have at least one primary key"));
    }
    for key in &primary_keys {
        let operators = &schema.column(key)?.filter_operators;
        if !operators.contains(&Operator::Equal) && !operators.contains(&Operator::In) {
            return Err(ToolkitError::schema(format!(
                "field '{key}' must support operators: [equal, in]"
            )));
        }
    }
    Ok(match_fields(&primary_keys, ids))
}

fn match_fields(fields: &[String], values: &[Vec<Value>]) -> ConditionTree {
    let Some((first_field, other_fields)) = fields.split_first() else {
        return match_none();
    };
    if values.is_empty() {
        return match_none();
    }

    if other_fields.is_empty() {
        let mut distinct: Vec<Value> = Vec::new();
        for value in values.iter().filter_map(|id| id.first()) {
            if !distinct.contains(value) {
                distinct.push(value.clone());
            }
        }
        return match distinct.len() {
            0 => match_none(),
            1 => ConditionTree::leaf(first_field.clone(), Operator::Equal, distinct.remove(0)),
            _ => ConditionTree::leaf(first_field.clone(), Operator::In, distinct),
        };
    }

    let mut groups: Vec<(Value, Vec<Vec<Value>>)> = Vec::new();
    for id in values {
        let Some((first, rest)) = id.split_first() else {
            continue;
        };
        match groups.iter_mut().find(|(value, _)| value == first) {
            Some((_, rests)) => rests.push(rest.to_vec()),
            None => groups.push((first.clone(), vec![rest.to_vec()])),
        }
    }

    union(groups.into_iter().filter_map(|(first, rests)| {
        intersect([
            ConditionTree::leaf(first_field.clone(), Operator::Equal, first),
            match_fields(other_fields, &rests),
        ])
    }))
}
