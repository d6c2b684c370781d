//! In-memory reference backend.
//!
//! Every collection stores its rows behind a `parking_lot::RwLock`; tables
//! are registered in a shared [`DashMap`] so to-one relations can be joined
//! natively on `list`. Used by tests and the playground binary.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use quarry_core::condition_tree::{factory, ColumnTypeResolver};
use quarry_core::schema::{ColumnType, FieldSchema, PrimitiveType};
use quarry_core::value::field_value;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, Filter, PaginatedFilter, Projection, Record, Result,
    ToolkitError, Value,
};
use tracing::{debug, warn};

use crate::collection::{Collection, CollectionRef};
use crate::datasource::{BaseDatasource, Datasource};
use crate::decorators::{DatasourceDecorator, DecoratorFactory};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct Table {
    schema: Arc<CollectionSchema>,
    rows: RwLock<Vec<Record>>,
}

#[derive(Default)]
struct MemoryStore {
    tables: DashMap<String, Arc<Table>>,
}

impl MemoryStore {
    fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).map(|entry| entry.value().clone())
    }

    /// Row plus the to-one relations `projection` asks for, joined
    /// recursively. Missing targets read as null.
    fn hydrate(&self, schema: &CollectionSchema, row: &Record, projection: &Projection) -> Record {
        let mut record = row.clone();
        for (relation, sub_projection) in projection.relations() {
            let joined = schema
                .fields
                .get(&relation)
                .and_then(|field| self.join(field, row, &sub_projection))
                .map_or(Value::Null, Value::Record);
            record.insert(relation, joined);
        }
        record
    }

    fn join(&self, field: &FieldSchema, row: &Record, projection: &Projection) -> Option<Record> {
        let present = |key: &str| row.get(key).filter(|value| !value.is_null()).cloned();
        let (collection, conditions): (String, Vec<(String, Value)>) = match field {
            FieldSchema::ManyToOne(relation) => (
                relation.foreign_collection.clone(),
                vec![(relation.foreign_key_target.clone(), present(&relation.foreign_key)?)],
            ),
            FieldSchema::OneToOne(relation) => (
                relation.foreign_collection.clone(),
                vec![(relation.origin_key.clone(), present(&relation.origin_key_target)?)],
            ),
            FieldSchema::PolymorphicManyToOne(relation) => {
                let collection = row.get(&relation.foreign_key_type_field)?.as_str()?.to_string();
                let target = relation.foreign_key_targets.get(&collection)?.clone();
                (collection, vec![(target, present(&relation.foreign_key)?)])
            }
            FieldSchema::PolymorphicOneToOne(relation) => (
                relation.foreign_collection.clone(),
                vec![
                    (relation.origin_key.clone(), present(&relation.origin_key_target)?),
                    (relation.origin_type_field.clone(), Value::from(relation.origin_type_value.as_str())),
                ],
            ),
            _ => return None,
        };
        let table = self.table(&collection)?;
        let found = table
            .rows
            .read()
            .iter()
            .find(|candidate| {
                conditions
                    .iter()
                    .all(|(field, expected)| field_value(candidate, field).loose_eq(expected))
            })
            .cloned()?;
        Some(self.hydrate(&table.schema, &found, projection))
    }
}

/// Column types along relation paths, read from the store's schemas.
struct StoreResolver<'a> {
    store: &'a MemoryStore,
    schema: &'a CollectionSchema,
}

impl ColumnTypeResolver for StoreResolver<'_> {
    fn column_type(&self, path: &str) -> Option<ColumnType> {
        match path.split_once(':') {
            None => self.schema.fields.get(path)?.as_column().map(|column| column.column_type.clone()),
            Some((head, rest)) => {
                let foreign = self.schema.fields.get(head)?.foreign_collection()?;
                let table = self.store.table(foreign)?;
                StoreResolver { store: self.store, schema: &table.schema }.column_type(rest)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryCollection
// ---------------------------------------------------------------------------

/// One table of a [`MemoryDatasource`].
pub struct MemoryCollection {
    name: String,
    table: Arc<Table>,
    store: Arc<MemoryStore>,
    sequence: AtomicI64,
}

impl MemoryCollection {
    /// Snapshot of the stored rows.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.table.rows.read().clone()
    }

    /// Hydrated rows matching `filter`.
    fn select(&self, caller: &Caller, filter: &Filter, projection: &Projection) -> Result<Vec<Record>> {
        let store = &self.store;
        let schema = &self.table.schema;
        let needed = match &filter.condition_tree {
            Some(tree) => projection.union([&tree.projection()]),
            None => projection.clone(),
        };
        let rows = self.table.rows.read().clone();
        let mut records: Vec<Record> = rows.iter().map(|row| store.hydrate(schema, row, &needed)).collect();

        if let Some(tree) = &filter.condition_tree {
            let resolver = StoreResolver { store, schema };
            records = tree.filter_records(records, &resolver, &caller.time_context_in(filter.timezone))?;
        }
        if let Some(search) = filter.search.as_deref().filter(|search| !search.is_empty()) {
            let needle = search.to_lowercase();
            records.retain(|record| {
                schema.fields.iter().filter(|(_, field)| field.is_column()).any(|(name, _)| {
                    record
                        .get(name)
                        .and_then(Value::as_str)
                        .is_some_and(|text| text.to_lowercase().contains(&needle))
                })
            });
        }
        Ok(records)
    }

    fn ids(&self, records: &[Record]) -> Result<BTreeSet<Vec<Value>>> {
        records.iter().map(|record| factory::record_id(&self.table.schema, record)).collect()
    }

    fn column_patch(&self, record: Record) -> Record {
        record
            .into_iter()
            .filter(|(name, _)| self.table.schema.fields.get(name).is_some_and(FieldSchema::is_column))
            .collect()
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.table.schema.clone()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        let sort_projection = filter.sort.as_ref().map(|sort| sort.projection()).unwrap_or_default();
        let mut records = self.select(caller, &filter.filter, &projection.union([&sort_projection]))?;
        if let Some(sort) = &filter.sort {
            sort.apply(&mut records);
        }
        if let Some(page) = filter.page {
            records = page.apply(records);
        }
        projection.apply(&records)
    }

    async fn create(&self, _caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        let schema = &self.table.schema;
        let generated = match schema.primary_keys().as_slice() {
            [key] if schema.column(key)?.column_type.as_primitive() == Some(PrimitiveType::Number) => Some(key.clone()),
            _ => None,
        };
        let mut created = Vec::with_capacity(records.len());
        let mut rows = self.table.rows.write();
        for record in records {
            let mut row = self.column_patch(record);
            for (name, field) in &schema.fields {
                if let Some(column) = field.as_column() {
                    row.entry(name.clone())
                        .or_insert_with(|| column.default_value.clone().unwrap_or_default());
                }
            }
            if let Some(key) = &generated {
                if row.get(key).map_or(true, Value::is_null) {
                    let highest = rows.iter().filter_map(|existing| existing.get(key)?.as_i64()).max().unwrap_or(0);
                    let next = self.sequence.load(Ordering::SeqCst).max(highest) + 1;
                    self.sequence.store(next, Ordering::SeqCst);
                    row.insert(key.clone(), Value::Int(next));
                }
            }
            rows.push(row.clone());
            created.push(row);
        }
        debug!(collection = %self.name, count = created.len(), "memory create");
        Ok(created)
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let targets = self.ids(&self.select(caller, &filter, &Projection::new())?)?;
        let patch = self.column_patch(patch);
        let schema = &self.table.schema;
        let mut rows = self.table.rows.write();
        for row in rows.iter_mut() {
            if targets.contains(&factory::record_id(schema, row)?) {
                row.extend(patch.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        let targets = self.ids(&self.select(caller, &filter, &Projection::new())?)?;
        let schema = &self.table.schema;
        self.table
            .rows
            .write()
            .retain(|row| factory::record_id(schema, row).map_or(true, |id| !targets.contains(&id)));
        Ok(())
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let timezone = filter.timezone.unwrap_or(caller.timezone);
        let projection = aggregation.projection();
        let records = self.select(caller, &filter, &projection)?;
        aggregation.apply(&records, timezone, limit)
    }
}

// ---------------------------------------------------------------------------
// MemoryDatasource
// ---------------------------------------------------------------------------

/// Datasource of [`MemoryCollection`]s sharing one store.
pub struct MemoryDatasource {
    store: Arc<MemoryStore>,
    registry: BaseDatasource,
}

impl MemoryDatasource {
    #[must_use]
    pub fn new() -> Self {
        Self { store: Arc::new(MemoryStore::default()), registry: BaseDatasource::new("memory") }
    }

    /// Adds a table seeded with `records`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Datasource`] when the name is taken.
    pub fn add_collection(
        &self,
        name: impl Into<String>,
        schema: CollectionSchema,
        records: Vec<Record>,
    ) -> Result<Arc<MemoryCollection>> {
        let name = name.into();
        let table = Arc::new(Table { schema: Arc::new(schema), rows: RwLock::new(records) });
        let collection = Arc::new(MemoryCollection {
            name: name.clone(),
            table: table.clone(),
            store: self.store.clone(),
            sequence: AtomicI64::new(0),
        });
        self.registry.add_collection(collection.clone())?;
        self.store.tables.insert(name, table);
        Ok(collection)
    }

    /// Builder form of [`MemoryDatasource::add_collection`]; duplicates are
    /// logged and skipped.
    #[must_use]
    pub fn with_collection(self, name: impl Into<String>, schema: CollectionSchema, records: Vec<Record>) -> Self {
        if let Err(err) = self.add_collection(name, schema, records) {
            warn!(error = %err, "collection skipped");
        }
        self
    }

    /// Typed access to a table.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Datasource`] for unknown names.
    pub fn table(&self, name: &str) -> Result<Vec<Record>> {
        let table = self
            .store
            .table(name)
            .ok_or_else(|| ToolkitError::datasource(format!("collection '{name}' not found")))?;
        let rows = table.rows.read().clone();
        Ok(rows)
    }
}

impl Default for MemoryDatasource {
    fn default() -> Self {
        Self::new()
    }
}

impl Datasource for MemoryDatasource {
    fn name(&self) -> &str {
        "memory"
    }

    fn collections(&self) -> Vec<CollectionRef> {
        self.registry.collections()
    }

    fn get_collection(&self, name: &str) -> Result<CollectionRef> {
        self.registry.get_collection(name)
    }
}

// ---------------------------------------------------------------------------
// RecordingCollection
// ---------------------------------------------------------------------------

/// One call seen by a [`RecordingCollection`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    List { filter: PaginatedFilter, projection: Projection },
    Create { records: Vec<Record> },
    Update { filter: Filter, patch: Record },
    Delete { filter: Filter },
    Aggregate { filter: Filter, aggregation: Aggregation, limit: Option<usize> },
}

/// Pass-through decorator logging every call, so tests can assert what
/// reached the backend.
pub struct RecordingCollection {
    child: CollectionRef,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingCollection {
    /// Calls seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// `list` calls seen so far.
    #[must_use]
    pub fn list_calls(&self) -> Vec<(PaginatedFilter, Projection)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                RecordedCall::List { filter, projection } => Some((filter.clone(), projection.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().push(call);
    }
}

impl DecoratorFactory for RecordingCollection {
    fn wrap(child: CollectionRef, _datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { child, calls: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Collection for RecordingCollection {
    fn name(&self) -> &str {
        self.child.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.child.schema()
    }

    fn schema_version(&self) -> u64 {
        self.child.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        self.record(RecordedCall::List { filter: filter.clone(), projection: projection.clone() });
        self.child.list(caller, filter, projection).await
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        self.record(RecordedCall::Create { records: records.clone() });
        self.child.create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        self.record(RecordedCall::Update { filter: filter.clone(), patch: patch.clone() });
        self.child.update(caller, filter, patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        self.record(RecordedCall::Delete { filter: filter.clone() });
        self.child.delete(caller, filter).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        self.record(RecordedCall::Aggregate { filter: filter.clone(), aggregation: aggregation.clone(), limit });
        self.child.aggregate(caller, filter, aggregation, limit).await
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::schema::{ColumnSchema, ManyToOneSchema};
    use quarry_core::value::to_record;
    use quarry_core::{ConditionTree, Operator, Page, Sort, SortClause};
    use serde_json::json;

    use super::*;

    fn library() -> MemoryDatasource {
        let books = CollectionSchema::new()
            .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
            .with_field("title", ColumnSchema::new(PrimitiveType::String))
            .with_field("author_id", ColumnSchema::new(PrimitiveType::Number))
            .with_field(
                "author",
                FieldSchema::ManyToOne(ManyToOneSchema {
                    foreign_collection: "authors".into(),
                    foreign_key: "author_id".into(),
                    foreign_key_target: "id".into(),
                }),
            );
        let authors = CollectionSchema::new()
            .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
            .with_field("name", ColumnSchema::new(PrimitiveType::String));
        MemoryDatasource::new()
            .with_collection(
                "books",
                books,
                vec![
                    to_record(json!({"id": 1, "title": "Foundation", "author_id": 1})),
                    to_record(json!({"id": 2, "title": "Dune", "author_id": 2})),
                    to_record(json!({"id": 3, "title": "Anonymous", "author_id": null})),
                ],
            )
            .with_collection(
                "authors",
                authors,
                vec![to_record(json!({"id": 1, "name": "Asimov"})), to_record(json!({"id": 2, "name": "Herbert"}))],
            )
    }

    #[tokio::test]
    async fn list_joins_filters_sorts_and_pages() {
        let datasource = library();
        let books = datasource.get_collection("books").unwrap();
        let caller = Caller::default();

        let records = books
            .list(
                &caller,
                PaginatedFilter::from_tree(ConditionTree::leaf("author:name", Operator::Equal, "Herbert")),
                Projection::from("title,author:name"),
            )
            .await
            .unwrap();
        assert_eq!(records, vec![to_record(json!({"title": "Dune", "author": {"name": "Herbert"}}))]);

        let sorted = books
            .list(
                &caller,
                PaginatedFilter::new()
                    .with_sort(Some(Sort::new(vec![SortClause::asc("title")])))
                    .with_page(Some(Page::new(1, Some(1)))),
                Projection::from("title,author:name"),
            )
            .await
            .unwrap();
        assert_eq!(sorted, vec![to_record(json!({"title": "Dune", "author": {"name": "Herbert"}}))]);

        let orphan = books
            .list(
                &caller,
                PaginatedFilter::from_tree(ConditionTree::leaf("id", Operator::Equal, 3)),
                Projection::from("author:name"),
            )
            .await
            .unwrap();
        assert_eq!(orphan, vec![to_record(json!({"author": null}))]);
    }

    #[tokio::test]
    async fn create_generates_keys_and_update_delete_target_filter() {
        let datasource = library();
        let books = datasource.get_collection("books").unwrap();
        let caller = Caller::default();

        let created = books.create(&caller, vec![to_record(json!({"title": "Hyperion"}))]).await.unwrap();
        assert_eq!(created[0].get("id"), Some(&Value::Int(4)));

        let filter = Filter::from_tree(ConditionTree::leaf("title", Operator::Equal, "Hyperion"));
        books.update(&caller, filter.clone(), to_record(json!({"author_id": 2}))).await.unwrap();
        let rows = datasource.table("books").unwrap();
        assert_eq!(rows.iter().find(|row| row["id"] == Value::Int(4)).unwrap()["author_id"], Value::Int(2));

        books.delete(&caller, filter).await.unwrap();
        assert_eq!(datasource.table("books").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn aggregate_groups_by_joined_field() {
        let datasource = library();
        let books = datasource.get_collection("books").unwrap();
        let rows = books
            .aggregate(
                &Caller::default(),
                Filter::new(),
                Aggregation::count().with_group(quarry_core::AggregationGroup::new("author:name")),
                None,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.value == Value::from(1)));
    }

    #[tokio::test]
    async fn recording_collection_logs_calls() {
        let layer = DatasourceDecorator::<RecordingCollection>::new(
            Arc::new(library()),
            Arc::new(crate::config::EngineConfig::default()),
        );
        let books = layer.collection("books").unwrap();
        books.list(&Caller::default(), PaginatedFilter::new(), Projection::from("id")).await.unwrap();
        assert_eq!(books.list_calls().len(), 1);
        assert_eq!(books.list_calls()[0].1, Projection::from("id"));
        books.clear();
        assert!(books.calls().is_empty());
    }
}
