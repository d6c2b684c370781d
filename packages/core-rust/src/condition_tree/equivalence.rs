//! Operator equivalence: rewrite a leaf so it only uses a given set of
//! operators.
//!
//! The rewrite rules form a graph (`in` can be written with `equal`, `blank`
//! with `in` or `missing`, `yesterday` with `less_than` and `greater_than`, ...).
//! Resolution walks that graph depth-first, never reusing a rule already on
//! the current path.

use std::collections::BTreeSet;

use super::transforms::{alternatives, Alternative};
use super::{ConditionTree, ConditionTreeLeaf};
use crate::clock::TimeContext;
use crate::error::{Result, ToolkitError};
use crate::schema::{ColumnType, Operator};

enum Plan {
    Keep,
    Rewrite {
        alternative: &'static Alternative,
        dependencies: Vec<(Operator, Plan)>,
    },
}

fn plan(
    operator: Operator,
    allowed: &BTreeSet<Operator>,
    column_type: &ColumnType,
    path: &[(Operator, usize)],
) -> Option<Plan> {
    if allowed.contains(&operator) {
        return Some(Plan::Keep);
    }
    let candidates = alternatives().get(&operator)?;
    for (index, alternative) in candidates.iter().enumerate() {
        let step = (operator, index);
        if !alternative.applies_to(column_type) || path.contains(&step) {
            continue;
        }
        let mut next_path = path.to_vec();
        next_path.push(step);
        let dependencies: Option<Vec<(Operator, Plan)>> = alternative
            .depends_on
            .iter()
            .map(|dependency| {
                plan(*dependency, allowed, column_type, &next_path).map(|sub| (*dependency, sub))
            })
            .collect();
        match dependencies {
            Some(dependencies) if !dependencies.is_empty() => {
                return Some(Plan::Rewrite { alternative, dependencies });
            }
            _ => {}
        }
    }
    None
}

fn execute(
    plan: &Plan,
    leaf: &ConditionTreeLeaf,
    column_type: &ColumnType,
    time: &TimeContext,
) -> Result<ConditionTree> {
    match plan {
        Plan::Keep => Ok(ConditionTree::Leaf(leaf.clone())),
        Plan::Rewrite { alternative, dependencies } => {
            let rewritten = (alternative.replacer)(leaf, time, column_type)?;
            rewritten.replace_leafs(|sub_leaf| {
                let (_, sub_plan) = dependencies
                    .iter()
                    .find(|(operator, _)| *operator == sub_leaf.operator)
                    .ok_or_else(|| {
                        ToolkitError::condition_tree(format!(
                            "rewrite of '{}' produced unexpected operator '{}'",
                            leaf.operator, sub_leaf.operator
                        ))
                    })?;
                execute(sub_plan, sub_leaf, column_type, time)
            })
        }
    }
}

/// Rewrites `leaf` into an equivalent tree using only `operators`.
///
/// Returns `Ok(None)` when no chain of rules reaches the allowed set.
///
/// # Errors
///
/// Fails when a rule cannot be applied to the leaf value (a `contains` with a
/// null value, a `before` with something that is not a date, ...).
pub fn equivalent_tree(
    leaf: &ConditionTreeLeaf,
    operators: &BTreeSet<Operator>,
    column_type: &ColumnType,
    time: &TimeContext,
) -> Result<Option<ConditionTree>> {
    match plan(leaf.operator, operators, column_type, &[]) {
        Some(Plan::Keep) => Ok(Some(ConditionTree::Leaf(leaf.clone()))),
        Some(plan) => {
            let tree = execute(&plan, leaf, column_type, time)?;
            tracing::trace!(from = %leaf, to = %tree, "rewrote leaf with equivalent operators");
            Ok(Some(tree))
        }
        None => Ok(None),
    }
}

/// Whether `operator` can be expressed with `operators` on this column type.
#[must_use]
pub fn has_equivalent_tree(operator: Operator, operators: &BTreeSet<Operator>, column_type: &ColumnType) -> bool {
    plan(operator, operators, column_type, &[]).is_some()
}
