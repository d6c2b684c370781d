use std::collections::HashMap;

use super::Alternative;
use crate::condition_tree::factory;
use crate::condition_tree::ConditionTree;
use crate::schema::{Operator, PrimitiveType};
use crate::value::Value;

fn null_or_empty() -> Value {
    Value::Array(vec![Value::Null, Value::from("")])
}

pub(super) fn register(table: &mut HashMap<Operator, Vec<Alternative>>) {
    table.insert(
        Operator::Blank,
        vec![
            Alternative::new([Operator::In], |leaf, _, _| Ok(leaf.with(Operator::In, null_or_empty()).into()))
                .for_types([PrimitiveType::String]),
            Alternative::new([Operator::Missing], |leaf, _, _| {
                Ok(leaf.with(Operator::Missing, Value::Null).into())
            }),
        ],
    );
    table.insert(
        Operator::Missing,
        vec![Alternative::new([Operator::Equal], |leaf, _, _| {
            Ok(leaf.with(Operator::Equal, Value::Null).into())
        })],
    );
    table.insert(
        Operator::Present,
        vec![
            Alternative::new([Operator::NotIn], |leaf, _, _| {
                Ok(leaf.with(Operator::NotIn, null_or_empty()).into())
            })
            .for_types([PrimitiveType::String]),
            Alternative::new([Operator::NotEqual], |leaf, _, _| {
                Ok(leaf.with(Operator::NotEqual, Value::Null).into())
            }),
        ],
    );
    table.insert(
        Operator::Equal,
        vec![Alternative::new([Operator::In], |leaf, _, _| {
            Ok(leaf.with(Operator::In, vec![leaf.value.clone()]).into())
        })],
    );
    table.insert(
        Operator::NotEqual,
        vec![Alternative::new([Operator::NotIn], |leaf, _, _| {
            Ok(leaf.with(Operator::NotIn, vec![leaf.value.clone()]).into())
        })],
    );
    table.insert(
        Operator::In,
        vec![Alternative::new([Operator::Equal], |leaf, _, _| {
            Ok(factory::union(
                leaf.values()
                    .into_iter()
                    .map(|value| ConditionTree::from(leaf.with(Operator::Equal, value))),
            ))
        })],
    );
    table.insert(
        Operator::NotIn,
        vec![Alternative::new([Operator::NotEqual], |leaf, _, _| {
            let conditions: Vec<ConditionTree> = leaf
                .values()
                .into_iter()
                .map(|value| leaf.with(Operator::NotEqual, value).into())
                .collect();
            Ok(factory::intersect(conditions).unwrap_or_else(|| ConditionTree::and(Vec::new())))
        })],
    );
}
