//! JSON wire format of condition trees.
//!
//! Leaf: `{"field": "title", "operator": "equal", "value": "Foundation"}`.
//! Branch: `{"aggregator": "and", "conditions": [...]}`.

use serde::{Deserialize, Serialize};

use super::{Aggregator, ConditionTree, ConditionTreeLeaf};
use crate::error::{Result, ToolkitError};
use crate::schema::Operator;
use crate::value::Value;

/// Serde mirror of [`ConditionTree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlainConditionTree {
    Branch {
        aggregator: Aggregator,
        conditions: Vec<PlainConditionTree>,
    },
    Leaf {
        field: String,
        operator: Operator,
        #[serde(default)]
        value: Value,
    },
}

impl ConditionTree {
    #[must_use]
    pub fn to_plain_object(&self) -> PlainConditionTree {
        match self {
            Self::Leaf(leaf) => PlainConditionTree::Leaf {
                field: leaf.field.clone(),
                operator: leaf.operator,
                value: leaf.value.clone(),
            },
            Self::Branch(branch) => PlainConditionTree::Branch {
                aggregator: branch.aggregator,
                conditions: branch.conditions.iter().map(ConditionTree::to_plain_object).collect(),
            },
        }
    }

    /// The tree with every single-condition branch replaced by its
    /// condition. Parsing the plain form yields this shape.
    #[must_use]
    pub fn normalized(&self) -> ConditionTree {
        match self {
            Self::Leaf(_) => self.clone(),
            Self::Branch(branch) => {
                let mut conditions: Vec<ConditionTree> = branch.conditions.iter().map(Self::normalized).collect();
                if conditions.len() == 1 {
                    if let Some(single) = conditions.pop() {
                        return single;
                    }
                }
                ConditionTree::branch(branch.aggregator, conditions)
            }
        }
    }

    /// JSON rendering of [`ConditionTree::to_plain_object`].
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.to_plain_object()).unwrap_or(serde_json::Value::Null)
    }
}

impl From<PlainConditionTree> for ConditionTree {
    /// Branches with a single condition collapse into that condition.
    fn from(plain: PlainConditionTree) -> Self {
        match plain {
            PlainConditionTree::Leaf { field, operator, value } => {
                ConditionTree::Leaf(ConditionTreeLeaf { field, operator, value })
            }
            PlainConditionTree::Branch { aggregator, conditions } => {
                let mut conditions: Vec<ConditionTree> =
                    conditions.into_iter().map(ConditionTree::from).collect();
                if conditions.len() == 1 {
                    if let Some(single) = conditions.pop() {
                        return single;
                    }
                }
                ConditionTree::branch(aggregator, conditions)
            }
        }
    }
}

/// Parses the JSON wire format.
///
/// # Errors
///
/// Returns [`ToolkitError::ConditionTree`] when the JSON is neither a leaf
/// nor a branch, or names an unknown operator or aggregator.
pub fn from_plain_object(json: &serde_json::Value) -> Result<ConditionTree> {
    serde_json::from_value::<PlainConditionTree>(json.clone())
        .map(ConditionTree::from)
        .map_err(|err| {
            ToolkitError::condition_tree(format!("failed to instantiate condition tree from json: {err}"))
        })
}
