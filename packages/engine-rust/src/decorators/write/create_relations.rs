//! Creates with nested to-one records: `{title, author: {name}}` creates or
//! updates the author and links it to the new book.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use quarry_core::schema::{ManyToOneSchema, OriginKeySchema};
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ConditionTree, FieldSchema, Filter, Operator,
    PaginatedFilter, Projection, Record, Result, Value,
};
use tracing::debug;

use crate::collection::{Collection, CollectionRef};
use crate::decorators::{DatasourceDecorator, DecoratorBase, DecoratorFactory};

pub struct CreateRelationsCollection {
    base: DecoratorBase<CreateRelationsCollection>,
}

impl DecoratorFactory for CreateRelationsCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource) }
    }
}

/// Nested to-one records of one incoming record, by relation name.
type NestedRecords = BTreeMap<String, Record>;

impl CreateRelationsCollection {
    /// Splits each record into its own columns and its nested to-one
    /// records.
    fn split(schema: &CollectionSchema, records: Vec<Record>) -> (Vec<Record>, Vec<NestedRecords>) {
        records
            .into_iter()
            .map(|record| {
                let mut columns = Record::new();
                let mut nested = NestedRecords::new();
                for (key, value) in record {
                    match (schema.fields.get(&key), value) {
                        (Some(FieldSchema::ManyToOne(_) | FieldSchema::OneToOne(_)), Value::Record(sub)) => {
                            nested.insert(key, sub);
                        }
                        (_, value) => {
                            columns.insert(key, value);
                        }
                    }
                }
                (columns, nested)
            })
            .unzip()
    }

    /// Creates the targets of records without a foreign key, updates the
    /// others, then writes the foreign keys into `columns`.
    async fn create_many_to_one(
        &self,
        caller: &Caller,
        name: &str,
        relation: &ManyToOneSchema,
        columns: &mut [Record],
        nested: &[NestedRecords],
    ) -> Result<()> {
        let foreign = self.base.collection(&relation.foreign_collection)?;
        let mut creates: Vec<(usize, Record)> = Vec::new();
        for (index, sub) in nested.iter().enumerate() {
            let Some(sub) = sub.get(name) else {
                continue;
            };
            match columns[index].get(&relation.foreign_key).filter(|key| !key.is_null()) {
                Some(key) => {
                    let tree = ConditionTree::leaf(relation.foreign_key_target.clone(), Operator::Equal, key.clone());
                    foreign.update(caller, Filter::from_tree(tree), sub.clone()).await?;
                }
                None => creates.push((index, sub.clone())),
            }
        }
        if creates.is_empty() {
            return Ok(());
        }

        let created = foreign.create(caller, creates.iter().map(|(_, sub)| sub.clone()).collect()).await?;
        debug!(collection = self.name(), relation = name, count = created.len(), "created many-to-one targets");
        for ((index, _), target) in creates.iter().zip(created) {
            let key = target.get(&relation.foreign_key_target).cloned().unwrap_or_default();
            columns[*index].insert(relation.foreign_key.clone(), key);
        }
        Ok(())
    }

    /// Creates the nested one-to-one records, linked to their parents.
    async fn create_one_to_one(
        &self,
        caller: &Caller,
        name: &str,
        relation: &OriginKeySchema,
        parents: &[Record],
        nested: &[NestedRecords],
    ) -> Result<()> {
        let records: Vec<Record> = parents
            .iter()
            .zip(nested)
            .filter_map(|(parent, sub)| {
                let mut sub = sub.get(name)?.clone();
                let key = parent.get(&relation.origin_key_target).cloned().unwrap_or_default();
                sub.insert(relation.origin_key.clone(), key);
                Some(sub)
            })
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        self.base.collection(&relation.foreign_collection)?.create(caller, records).await?;
        Ok(())
    }
}

#[async_trait]
impl Collection for CreateRelationsCollection {
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
        let schema = self.schema();
        let (mut columns, nested) = Self::split(&schema, records);
        let relations: BTreeSet<String> = nested.iter().flat_map(|sub| sub.keys().cloned()).collect();
        if relations.is_empty() {
            return self.base.child().create(caller, columns).await;
        }

        for name in &relations {
            if let Some(FieldSchema::ManyToOne(relation)) = schema.fields.get(name) {
                self.create_many_to_one(caller, name, relation, &mut columns, &nested).await?;
            }
        }
        let created = self.base.child().create(caller, columns).await?;
        for name in &relations {
            if let Some(FieldSchema::OneToOne(relation)) = schema.fields.get(name) {
                self.create_one_to_one(caller, name, relation, &created, &nested).await?;
            }
        }
        Ok(created)
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        self.base.child().update(caller, filter, patch).await
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
    use quarry_core::schema::{ColumnSchema, PrimitiveType};
    use quarry_core::value::to_record;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::{MemoryDatasource, RecordedCall, RecordingCollection};

    fn stack() -> (Arc<DatasourceDecorator<RecordingCollection>>, Arc<DatasourceDecorator<CreateRelationsCollection>>) {
        let memory = MemoryDatasource::new()
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
                Vec::new(),
            )
            .with_collection(
                "persons",
                CollectionSchema::new()
                    .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                    .with_field("name", ColumnSchema::new(PrimitiveType::String))
                    .with_field(
                        "passport",
                        FieldSchema::OneToOne(OriginKeySchema {
                            foreign_collection: "passports".into(),
                            origin_key: "person_id".into(),
                            origin_key_target: "id".into(),
                        }),
                    ),
                vec![to_record(json!({"id": 7, "name": "Frank Herbert"}))],
            )
            .with_collection(
                "passports",
                CollectionSchema::new()
                    .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                    .with_field("number", ColumnSchema::new(PrimitiveType::String))
                    .with_field("person_id", ColumnSchema::new(PrimitiveType::Number)),
                Vec::new(),
            );
        let config = Arc::new(EngineConfig::default());
        let recording = DatasourceDecorator::<RecordingCollection>::new(Arc::new(memory), config.clone());
        let create = DatasourceDecorator::<CreateRelationsCollection>::new(recording.clone(), config);
        (recording, create)
    }

    #[tokio::test]
    async fn nested_many_to_one_is_created_first_and_linked() {
        let (recording, create) = stack();
        let books = create.collection("books").unwrap();
        let created = books
            .create(&Caller::default(), vec![to_record(json!({"title": "Dune", "author": {"name": "Isaac Asimov"}}))])
            .await
            .unwrap();
        assert_eq!(created[0].get("author_id"), Some(&Value::Int(8)));

        assert_eq!(
            recording.collection("persons").unwrap().calls(),
            vec![RecordedCall::Create { records: vec![to_record(json!({"name": "Isaac Asimov"}))] }]
        );
        assert_eq!(
            recording.collection("books").unwrap().calls(),
            vec![RecordedCall::Create { records: vec![to_record(json!({"title": "Dune", "author_id": 8}))] }]
        );
    }

    #[tokio::test]
    async fn nested_many_to_one_with_a_key_updates_the_target() {
        let (recording, create) = stack();
        let books = create.collection("books").unwrap();
        books
            .create(
                &Caller::default(),
                vec![to_record(json!({"title": "Dune", "author_id": 7, "author": {"name": "F. Herbert"}}))],
            )
            .await
            .unwrap();
        assert_eq!(
            recording.collection("persons").unwrap().calls(),
            vec![RecordedCall::Update {
                filter: Filter::from_tree(ConditionTree::leaf("id", Operator::Equal, 7)),
                patch: to_record(json!({"name": "F. Herbert"})),
            }]
        );
    }

    #[tokio::test]
    async fn nested_one_to_one_is_created_after_its_parent() {
        let (recording, create) = stack();
        let persons = create.collection("persons").unwrap();
        persons
            .create(&Caller::default(), vec![to_record(json!({"name": "Ursula", "passport": {"number": "X1"}}))])
            .await
            .unwrap();
        assert_eq!(
            recording.collection("passports").unwrap().calls(),
            vec![RecordedCall::Create { records: vec![to_record(json!({"number": "X1", "person_id": 8}))] }]
        );
    }
}
