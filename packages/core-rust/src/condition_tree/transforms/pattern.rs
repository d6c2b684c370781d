use std::collections::HashMap;

use super::Alternative;
use crate::error::ToolkitError;
use crate::schema::{Operator, PrimitiveType};
use crate::value::Value;

fn like(pattern: fn(&str) -> String) -> Alternative {
    Alternative::new([Operator::Like], move |leaf, _, _| {
        let text = match &leaf.value {
            Value::Null => {
                return Err(ToolkitError::condition_tree(format!(
                    "unable to use like with a null value on '{}'",
                    leaf.field
                )))
            }
            other => other.display(),
        };
        Ok(leaf.with(Operator::Like, pattern(&text)).into())
    })
    .for_types([PrimitiveType::String])
}

pub(super) fn register(table: &mut HashMap<Operator, Vec<Alternative>>) {
    table.insert(Operator::Contains, vec![like(|value| format!("%{value}%"))]);
    table.insert(Operator::StartsWith, vec![like(|value| format!("{value}%"))]);
    table.insert(Operator::EndsWith, vec![like(|value| format!("%{value}"))]);
    table.insert(Operator::Like, vec![like(str::to_string)]);
}
