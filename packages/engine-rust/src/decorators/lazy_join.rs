//! Skips many-to-one joins that only read the key the local record already
//! holds.
//!
//! `author:id` on a relation whose foreign key is `author_id` is served from
//! `author_id` alone, and rebuilt as `{author: {id}}` (or `author: null`).

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use quarry_core::schema::ManyToOneSchema;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ConditionTree, FieldSchema, Filter, PaginatedFilter,
    Projection, Record, Result, Value,
};

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};

pub struct LazyJoinCollection {
    base: DecoratorBase<LazyJoinCollection>,
}

impl DecoratorFactory for LazyJoinCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource) }
    }
}

impl LazyJoinCollection {
    /// The many-to-one `relation` when `projection` reads nothing but its
    /// key target.
    fn useless_join(&self, relation: &str, projection: &Projection) -> Option<ManyToOneSchema> {
        let schema = self.schema();
        let FieldSchema::ManyToOne(many) = schema.fields.get(relation)? else {
            return None;
        };
        let sub = projection.relation(relation);
        (sub.len() == 1 && sub.contains(&many.foreign_key_target)).then(|| many.clone())
    }

    /// Foreign key replacing `path`, when `path` goes through a useless join.
    fn foreign_key_for(&self, path: &str, projection: &Projection) -> Option<String> {
        let (relation, _) = path.split_once(':')?;
        self.useless_join(relation, projection).map(|many| many.foreign_key)
    }

    fn refine_tree(&self, tree: Option<&ConditionTree>) -> Option<ConditionTree> {
        let tree = tree?;
        let projection = tree.projection();
        Some(tree.replace_fields(|field| self.foreign_key_for(field, &projection).unwrap_or_else(|| field.to_string())))
    }

    fn refine_filter(&self, filter: Filter) -> Filter {
        let tree = self.refine_tree(filter.condition_tree.as_ref());
        filter.with_condition_tree(tree)
    }
}

#[async_trait]
impl Collection for LazyJoinCollection {
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
        let tree = self.refine_tree(filter.condition_tree());
        let filter = filter.with_condition_tree(tree);

        let mut joins: Vec<(String, ManyToOneSchema)> = Vec::new();
        for (relation, _) in projection.relations() {
            if let Some(many) = self.useless_join(&relation, &projection) {
                joins.push((relation, many));
            }
        }
        if joins.is_empty() {
            return self.base.child().list(caller, filter, projection).await;
        }

        let simplified = projection.replace(|path| match self.foreign_key_for(path, &projection) {
            Some(foreign_key) => Projection::from_iter([foreign_key]),
            None => Projection::from_iter([path]),
        });
        let mut records = self.base.child().list(caller, filter, simplified).await?;
        for record in &mut records {
            for (relation, many) in &joins {
                let key = record.get(&many.foreign_key).cloned().unwrap_or_default();
                let value = if key.is_null() {
                    Value::Null
                } else {
                    Value::Record(Record::from([(many.foreign_key_target.clone(), key)]))
                };
                record.insert(relation.clone(), value);
            }
        }
        projection.apply(&records)
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        self.base.child().create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        self.base.child().update(caller, self.refine_filter(filter), patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        self.base.child().delete(caller, self.refine_filter(filter)).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let projection = aggregation.projection();
        // Foreign key to the path it stands for.
        let mut replaced: BTreeMap<String, String> = BTreeMap::new();
        let simplified = aggregation.replace_fields(|field| match self.foreign_key_for(field, &projection) {
            Some(foreign_key) => {
                replaced.insert(foreign_key.clone(), field.to_string());
                foreign_key
            }
            None => field.to_string(),
        });

        let rows = self
            .base
            .child()
            .aggregate(caller, self.refine_filter(filter), simplified, limit)
            .await?;
        if replaced.is_empty() {
            return Ok(rows);
        }
        Ok(rows
            .into_iter()
            .map(|row| AggregateResult {
                value: row.value,
                group: row
                    .group
                    .into_iter()
                    .map(|(field, value)| (replaced.get(&field).cloned().unwrap_or(field), value))
                    .collect(),
            })
            .collect())
    }
}
