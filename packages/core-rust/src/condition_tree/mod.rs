//! Condition trees: the predicate AST every filter is expressed in.
//!
//! A tree is either a [`ConditionTreeLeaf`] (`field operator value`) or a
//! [`ConditionTreeBranch`] combining sub-trees with AND/OR. Trees are
//! immutable values; every transformation returns a new tree.

pub mod equivalence;
pub mod factory;
mod leaf;
pub mod plain;
mod transforms;

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

pub use leaf::ConditionTreeLeaf;

use crate::clock::TimeContext;
use crate::error::{Result, ToolkitError};
use crate::projection::Projection;
use crate::schema::{CollectionSchema, ColumnType, Operator};
use crate::value::{Record, Value};

/// Resolves the column type behind a (possibly relation-qualified) path.
///
/// Client-side evaluation needs it to pick the equivalence transforms that
/// apply to a column type.
pub trait ColumnTypeResolver {
    fn column_type(&self, path: &str) -> Option<ColumnType>;
}

impl ColumnTypeResolver for CollectionSchema {
    fn column_type(&self, path: &str) -> Option<ColumnType> {
        self.fields
            .get(path)
            .and_then(|field| field.as_column())
            .map(|column| column.column_type.clone())
    }
}

/// Boolean combinator of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    And,
    Or,
}

impl Aggregator {
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::And => Self::Or,
            Self::Or => Self::And,
        }
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => f.write_str("and"),
            Self::Or => f.write_str("or"),
        }
    }
}

/// AND/OR over sub-trees. An empty OR never matches, an empty AND always does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionTreeBranch {
    pub aggregator: Aggregator,
    pub conditions: Vec<ConditionTree>,
}

/// Predicate AST node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionTree {
    Leaf(ConditionTreeLeaf),
    Branch(ConditionTreeBranch),
}

impl ConditionTree {
    #[must_use]
    pub fn leaf(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self::Leaf(ConditionTreeLeaf::new(field, operator, value))
    }

    #[must_use]
    pub fn branch(aggregator: Aggregator, conditions: Vec<ConditionTree>) -> Self {
        Self::Branch(ConditionTreeBranch { aggregator, conditions })
    }

    #[must_use]
    pub fn and(conditions: Vec<ConditionTree>) -> Self {
        Self::branch(Aggregator::And, conditions)
    }

    #[must_use]
    pub fn or(conditions: Vec<ConditionTree>) -> Self {
        Self::branch(Aggregator::Or, conditions)
    }

    #[must_use]
    pub fn as_leaf(&self) -> Option<&ConditionTreeLeaf> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Branch(_) => None,
        }
    }

    /// Every field path the tree reads.
    #[must_use]
    pub fn projection(&self) -> Projection {
        let mut projection = Projection::new();
        self.for_each_leaf(|leaf| projection.push(leaf.field.clone()));
        projection
    }

    /// Logical negation.
    ///
    /// Branches flip their aggregator and invert every child.
    ///
    /// # Errors
    ///
    /// Fails when a leaf operator has no inverse.
    pub fn inverse(&self) -> Result<ConditionTree> {
        match self {
            Self::Leaf(leaf) => leaf.inverse().map(Self::Leaf),
            Self::Branch(branch) => Ok(Self::branch(
                branch.aggregator.inverse(),
                branch
                    .conditions
                    .iter()
                    .map(ConditionTree::inverse)
                    .collect::<Result<_>>()?,
            )),
        }
    }

    /// Client-side evaluation against one record.
    ///
    /// # Errors
    ///
    /// Fails when a leaf uses an operator that cannot be evaluated for its
    /// column type.
    pub fn matches(
        &self,
        record: &Record,
        columns: &dyn ColumnTypeResolver,
        time: &TimeContext,
    ) -> Result<bool> {
        match self {
            Self::Leaf(leaf) => leaf.matches(record, columns, time),
            Self::Branch(branch) => {
                for condition in &branch.conditions {
                    let matched = condition.matches(record, columns, time)?;
                    match branch.aggregator {
                        Aggregator::And if !matched => return Ok(false),
                        Aggregator::Or if matched => return Ok(true),
                        _ => {}
                    }
                }
                Ok(branch.aggregator == Aggregator::And)
            }
        }
    }

    /// Keeps the records the tree matches, in input order.
    ///
    /// # Errors
    ///
    /// Propagates evaluation errors.
    pub fn filter_records(
        &self,
        records: Vec<Record>,
        columns: &dyn ColumnTypeResolver,
        time: &TimeContext,
    ) -> Result<Vec<Record>> {
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            if self.matches(&record, columns, time)? {
                kept.push(record);
            }
        }
        Ok(kept)
    }

    /// Visits leaves depth-first, left to right.
    pub fn for_each_leaf<'a>(&'a self, mut handler: impl FnMut(&'a ConditionTreeLeaf)) {
        self.visit(&mut handler);
    }

    fn visit<'a>(&'a self, handler: &mut impl FnMut(&'a ConditionTreeLeaf)) {
        match self {
            Self::Leaf(leaf) => handler(leaf),
            Self::Branch(branch) => {
                for condition in &branch.conditions {
                    condition.visit(handler);
                }
            }
        }
    }

    /// Leaves in visiting order.
    #[must_use]
    pub fn leaves(&self) -> Vec<&ConditionTreeLeaf> {
        let mut leaves = Vec::new();
        self.for_each_leaf(|leaf| leaves.push(leaf));
        leaves
    }

    #[must_use]
    pub fn some_leaf(&self, mut predicate: impl FnMut(&ConditionTreeLeaf) -> bool) -> bool {
        self.leaves().into_iter().any(|leaf| predicate(leaf))
    }

    #[must_use]
    pub fn every_leaf(&self, mut predicate: impl FnMut(&ConditionTreeLeaf) -> bool) -> bool {
        self.leaves().into_iter().all(|leaf| predicate(leaf))
    }

    /// Rebuilds the tree with each leaf replaced by the handler's tree.
    ///
    /// # Errors
    ///
    /// Propagates the first handler error.
    pub fn replace_leafs(
        &self,
        mut handler: impl FnMut(&ConditionTreeLeaf) -> Result<ConditionTree>,
    ) -> Result<ConditionTree> {
        self.rebuild(&mut handler)
    }

    fn rebuild(
        &self,
        handler: &mut impl FnMut(&ConditionTreeLeaf) -> Result<ConditionTree>,
    ) -> Result<ConditionTree> {
        match self {
            Self::Leaf(leaf) => handler(leaf),
            Self::Branch(branch) => Ok(Self::branch(
                branch.aggregator,
                branch
                    .conditions
                    .iter()
                    .map(|condition| condition.rebuild(handler))
                    .collect::<Result<_>>()?,
            )),
        }
    }

    /// Async variant of [`ConditionTree::replace_leafs`].
    ///
    /// Leaves are resolved sequentially, in visiting order.
    ///
    /// # Errors
    ///
    /// Propagates the first handler error.
    pub async fn replace_leafs_async<F, Fut>(&self, mut handler: F) -> Result<ConditionTree>
    where
        F: FnMut(ConditionTreeLeaf) -> Fut,
        Fut: Future<Output = Result<ConditionTree>>,
    {
        let mut replacements = Vec::new();
        for leaf in self.leaves() {
            replacements.push(handler(leaf.clone()).await?);
        }
        let mut replacements = replacements.into_iter();
        self.replace_leafs(|_| {
            replacements
                .next()
                .ok_or_else(|| ToolkitError::condition_tree("leaf count changed while replacing"))
        })
    }

    /// Maps every leaf field path.
    #[must_use]
    pub fn replace_fields(&self, mut handler: impl FnMut(&str) -> String) -> ConditionTree {
        self.map_leaves(&mut |leaf| leaf.override_field(handler(&leaf.field)))
    }

    fn map_leaves(&self, handler: &mut impl FnMut(&ConditionTreeLeaf) -> ConditionTreeLeaf) -> ConditionTree {
        match self {
            Self::Leaf(leaf) => Self::Leaf(handler(leaf)),
            Self::Branch(branch) => Self::branch(
                branch.aggregator,
                branch
                    .conditions
                    .iter()
                    .map(|condition| condition.map_leaves(handler))
                    .collect(),
            ),
        }
    }

    /// Prefixes every leaf field with `prefix:`.
    #[must_use]
    pub fn nest(&self, prefix: &str) -> ConditionTree {
        if prefix.is_empty() {
            return self.clone();
        }
        self.replace_fields(|field| format!("{prefix}:{field}"))
    }

    /// Strips the relation prefix shared by every leaf.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::ConditionTree`] unless every leaf is
    /// relation-qualified with the same single prefix.
    pub fn unnest(&self) -> Result<ConditionTree> {
        let mut prefixes: Vec<&str> = Vec::new();
        let mut unqualified = false;
        self.for_each_leaf(|leaf| match leaf.field.split_once(':') {
            Some((prefix, _)) if !prefixes.contains(&prefix) => prefixes.push(prefix),
            Some(_) => {}
            None => unqualified = true,
        });
        let [prefix] = prefixes.as_slice() else {
            return Err(ToolkitError::condition_tree("cannot unnest condition tree"));
        };
        if unqualified {
            return Err(ToolkitError::condition_tree("cannot unnest condition tree"));
        }
        let strip = format!("{prefix}:");
        Ok(self.replace_fields(|field| field.strip_prefix(strip.as_str()).unwrap_or(field).to_string()))
    }
}

impl From<ConditionTreeLeaf> for ConditionTree {
    fn from(leaf: ConditionTreeLeaf) -> Self {
        Self::Leaf(leaf)
    }
}

impl fmt::Display for ConditionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf(leaf) => write!(f, "{leaf}"),
            Self::Branch(branch) => {
                write!(f, "{}(", branch.aggregator)?;
                for (index, condition) in branch.conditions.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{condition}")?;
                }
                f.write_str(")")
            }
        }
    }
}
