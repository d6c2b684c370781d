//! Updates with nested to-one patches: `{author: {name}}` updates the
//! authors of the targeted records, creating the missing ones.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use quarry_core::condition_tree::factory;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, FieldSchema, Filter, PaginatedFilter, Projection, Record,
    Result, Value,
};
use tracing::debug;

use crate::collection::{Collection, CollectionRef};
use crate::decorators::{DatasourceDecorator, DecoratorBase, DecoratorFactory};

pub struct UpdateRelationsCollection {
    base: DecoratorBase<UpdateRelationsCollection>,
}

impl DecoratorFactory for UpdateRelationsCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource) }
    }
}

impl UpdateRelationsCollection {
    /// Enough of the targeted records to tell which relations exist and to
    /// address them.
    fn relation_projection(&self, schema: &CollectionSchema, relations: &[(String, Record)]) -> Result<Projection> {
        let mut projection: Projection = schema.primary_keys().into_iter().collect();
        for (name, _) in relations {
            let field = schema.field(name)?;
            let foreign = self.base.collection(field.foreign_collection().unwrap_or_default())?;
            let mut nested: Projection = foreign.schema().primary_keys().into_iter().collect();
            match field {
                FieldSchema::ManyToOne(relation) => {
                    nested = nested.union([&Projection::from_iter([relation.foreign_key_target.as_str()])]);
                }
                FieldSchema::OneToOne(relation) => {
                    projection = projection.union([&Projection::from_iter([relation.origin_key_target.as_str()])]);
                }
                _ => {}
            }
            projection = projection.union([&nested.nest(name)]);
        }
        Ok(projection)
    }

    async fn create_or_update_relation(
        &self,
        caller: &Caller,
        records: &[Record],
        name: &str,
        patch: Record,
    ) -> Result<()> {
        let schema = self.schema();
        let field = schema.field(name)?;
        let foreign = self.base.collection(field.foreign_collection().unwrap_or_default())?;
        let (updates, creates): (Vec<&Record>, Vec<&Record>) =
            records.iter().partition(|record| matches!(record.get(name), Some(Value::Record(_))));

        if !creates.is_empty() {
            debug!(collection = self.name(), relation = name, count = creates.len(), "creating missing relations");
            match field {
                FieldSchema::ManyToOne(relation) => {
                    let created = foreign.create(caller, vec![patch.clone()]).await?;
                    let key = created
                        .first()
                        .and_then(|target| target.get(&relation.foreign_key_target))
                        .cloned()
                        .unwrap_or_default();
                    let owned: Vec<Record> = creates.into_iter().cloned().collect();
                    let tree = factory::match_records(&schema, &owned)?;
                    let parent_patch = Record::from([(relation.foreign_key.clone(), key)]);
                    self.base.child().update(caller, Filter::from_tree(tree), parent_patch).await?;
                }
                FieldSchema::OneToOne(relation) => {
                    let linked = creates
                        .into_iter()
                        .map(|parent| {
                            let mut sub = patch.clone();
                            let key = parent.get(&relation.origin_key_target).cloned().unwrap_or_default();
                            sub.insert(relation.origin_key.clone(), key);
                            sub
                        })
                        .collect();
                    foreign.create(caller, linked).await?;
                }
                _ => {}
            }
        }

        if !updates.is_empty() {
            let targets: Vec<Record> = updates.iter().filter_map(|record| record.get(name)?.as_record().cloned()).collect();
            let tree = factory::match_records(&foreign.schema(), &targets)?;
            foreign.update(caller, Filter::from_tree(tree), patch).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Collection for UpdateRelationsCollection {
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
        self.base.child().list(caller, filter, projection).await
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        self.base.child().create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let schema = self.schema();
        let mut columns = Record::new();
        let mut relations: Vec<(String, Record)> = Vec::new();
        for (key, value) in patch {
            match (schema.fields.get(&key), value) {
                (Some(FieldSchema::ManyToOne(_) | FieldSchema::OneToOne(_)), Value::Record(sub)) => {
                    relations.push((key, sub));
                }
                (_, value) => {
                    columns.insert(key, value);
                }
            }
        }

        if !columns.is_empty() {
            self.base.child().update(caller, filter.clone(), columns).await?;
        }
        if relations.is_empty() {
            return Ok(());
        }

        let projection = self.relation_projection(&schema, &relations)?;
        let records = self
            .base
            .child()
            .list(caller, PaginatedFilter::from_base_filter(filter), projection)
            .await?;
        for (name, sub_patch) in relations {
            self.create_or_update_relation(caller, &records, &name, sub_patch).await?;
        }
        Ok(())
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        self.base.child().delete(caller, filter).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        self.base.child().aggregate(caller, filter, aggregation, limit).await
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::schema::{ColumnSchema, ManyToOneSchema, PrimitiveType};
    use quarry_core::value::to_record;
    use quarry_core::{ConditionTree, Operator};
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::MemoryDatasource;

    fn library() -> MemoryDatasource {
        MemoryDatasource::new()
            .with_collection(
                "books",
                CollectionSchema::new()
                    .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                    .with_field("title", ColumnSchema::new(PrimitiveType::String))
                    .with_field("author_id", ColumnSchema::new(PrimitiveType::Number))
                    .with_field(
                        "author",
                        FieldSchema::ManyToOne(ManyToOneSchema {
                            foreign_collection: "persons".into(),
                            foreign_key: "author_id".into(),
                            foreign_key_target: "id".into(),
                        }),
                    ),
                vec![
                    to_record(json!({"id": 1, "title": "Foundation", "author_id": 1})),
                    to_record(json!({"id": 2, "title": "Anonymous", "author_id": null})),
                ],
            )
            .with_collection(
                "persons",
                CollectionSchema::new()
                    .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                    .with_field("name", ColumnSchema::new(PrimitiveType::String)),
                vec![to_record(json!({"id": 1, "name": "Asimov"}))],
            )
    }

    #[tokio::test]
    async fn existing_relations_are_updated_and_missing_ones_created() {
        let memory = Arc::new(library());
        let update =
            DatasourceDecorator::<UpdateRelationsCollection>::new(memory.clone(), Arc::new(EngineConfig::default()));
        let books = update.collection("books").unwrap();

        books
            .update(&Caller::default(), Filter::new(), to_record(json!({"title": "Same", "author": {"name": "X"}})))
            .await
            .unwrap();

        let mut persons = memory.table("persons").unwrap();
        persons.sort_by_key(|person| person["id"].clone());
        assert_eq!(
            persons,
            vec![to_record(json!({"id": 1, "name": "X"})), to_record(json!({"id": 2, "name": "X"}))]
        );
        let mut rows = memory.table("books").unwrap();
        rows.sort_by_key(|book| book["id"].clone());
        assert_eq!(rows[0], to_record(json!({"id": 1, "title": "Same", "author_id": 1})));
        assert_eq!(rows[1], to_record(json!({"id": 2, "title": "Same", "author_id": 2})));
    }

    #[tokio::test]
    async fn relation_only_patch_targets_the_filtered_records() {
        let memory = Arc::new(library());
        let update =
            DatasourceDecorator::<UpdateRelationsCollection>::new(memory.clone(), Arc::new(EngineConfig::default()));
        let books = update.collection("books").unwrap();

        books
            .update(
                &Caller::default(),
                Filter::from_tree(ConditionTree::leaf("id", Operator::Equal, 1)),
                to_record(json!({"author": {"name": "Isaac"}})),
            )
            .await
            .unwrap();
        assert_eq!(memory.table("persons").unwrap(), vec![to_record(json!({"id": 1, "name": "Isaac"}))]);
        assert_eq!(memory.table("books").unwrap().len(), 2);
    }
}
