//! Short-circuits operations whose filter provably matches nothing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use quarry_core::{
    AggregateResult, Aggregation, Aggregator, Caller, CollectionSchema, ConditionTree, ConditionTreeLeaf, Filter,
    Operator, PaginatedFilter, Projection, Record, Result, Value,
};
use tracing::debug;

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};

pub struct EmptyCollection {
    base: DecoratorBase<EmptyCollection>,
}

impl DecoratorFactory for EmptyCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource) }
    }
}

impl EmptyCollection {
    fn skips(&self, tree: Option<&ConditionTree>, operation: &str) -> bool {
        let empty = tree.is_some_and(returns_empty_set);
        if empty {
            debug!(collection = self.base.name(), operation, "filter matches nothing, backend skipped");
        }
        empty
    }
}

#[async_trait]
impl Collection for EmptyCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.child().schema()
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        if self.skips(filter.condition_tree(), "list") {
            return Ok(Vec::new());
        }
        self.base.child().list(caller, filter, projection).await
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        self.base.child().create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        if self.skips(filter.condition_tree.as_ref(), "update") {
            return Ok(());
        }
        self.base.child().update(caller, filter, patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        if self.skips(filter.condition_tree.as_ref(), "delete") {
            return Ok(());
        }
        self.base.child().delete(caller, filter).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        if self.skips(filter.condition_tree.as_ref(), "aggregate") {
            return Ok(Vec::new());
        }
        self.base.child().aggregate(caller, filter, aggregation, limit).await
    }
}

/// Conservative proof that `tree` matches no record. `false` means "maybe".
#[must_use]
pub fn returns_empty_set(tree: &ConditionTree) -> bool {
    match tree {
        ConditionTree::Leaf(leaf) => leaf_returns_empty_set(leaf),
        ConditionTree::Branch(branch) => match branch.aggregator {
            Aggregator::Or => branch.conditions.iter().all(returns_empty_set),
            Aggregator::And => and_returns_empty_set(&branch.conditions),
        },
    }
}

fn leaf_returns_empty_set(leaf: &ConditionTreeLeaf) -> bool {
    leaf.operator == Operator::In && leaf.values().is_empty()
}

fn and_returns_empty_set(conditions: &[ConditionTree]) -> bool {
    if conditions.iter().any(returns_empty_set) {
        return true;
    }

    // Naive scan for mutually exclusive equal/in leaves on one field.
    let mut candidates: HashMap<&str, Vec<Value>> = HashMap::new();
    for leaf in conditions.iter().filter_map(ConditionTree::as_leaf) {
        let values = match leaf.operator {
            Operator::Equal => vec![leaf.value.clone()],
            Operator::In => leaf.values(),
            _ => continue,
        };
        candidates
            .entry(leaf.field.as_str())
            .and_modify(|kept| kept.retain(|value| values.iter().any(|other| other.loose_eq(value))))
            .or_insert(values);
    }
    candidates.values().any(Vec::is_empty)
}
