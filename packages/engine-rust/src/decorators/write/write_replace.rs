//! Custom write handlers: writing a field may instead produce a patch on
//! other fields, which is expanded again until only plain writes remain.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, CycleKind, FieldSchema, Filter, PaginatedFilter,
    Projection, Record, Result, ToolkitError, Value,
};

use crate::collection::{Collection, CollectionRef};
use crate::decorators::{DatasourceDecorator, DecoratorBase, DecoratorFactory, Handler};
use crate::validators::{validate_field, validate_record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Create,
    Update,
}

impl fmt::Display for WriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
        }
    }
}

/// What a write handler receives besides the collection context.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Value written to the replaced field.
    pub value: Value,
    pub action: WriteAction,
    /// Whole patch (or record being created) the value comes from.
    pub record: Record,
    /// Target of an update.
    pub filter: Option<Filter>,
}

/// Returns the patch to write instead, `None` meaning "write nothing".
pub type WriteHandler = Handler<WriteRequest, Option<Record>>;

pub struct WriteReplaceCollection {
    base: DecoratorBase<WriteReplaceCollection>,
    /// `None` makes the field read-only.
    handlers: RwLock<BTreeMap<String, Option<WriteHandler>>>,
}

impl DecoratorFactory for WriteReplaceCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), handlers: RwLock::new(BTreeMap::new()) }
    }
}

/// Merges patches, recursing into nested records.
///
/// # Errors
///
/// Returns [`ToolkitError::Conflict`] when two patches write different
/// values to the same field.
pub fn deep_merge(patches: impl IntoIterator<Item = Record>) -> Result<Record> {
    let mut merged = Record::new();
    for patch in patches {
        for (key, value) in patch {
            let next = match merged.remove(&key) {
                None | Some(Value::Null) => value,
                Some(Value::Record(existing)) => match value {
                    Value::Record(incoming) => Value::Record(deep_merge([existing, incoming])?),
                    _ => return Err(ToolkitError::Conflict { field: key }),
                },
                Some(existing) if existing == value => existing,
                Some(_) => return Err(ToolkitError::Conflict { field: key }),
            };
            merged.insert(key, next);
        }
    }
    Ok(merged)
}

impl WriteReplaceCollection {
    /// Writes to `name` go through `handler`; `None` makes `name`
    /// read-only and rejects any write to it.
    ///
    /// # Errors
    ///
    /// Fails when `name` is not a column.
    pub fn replace_field_writing(&self, name: &str, handler: Option<WriteHandler>) -> Result<()> {
        validate_field(self.base.datasource()?.as_ref(), self, name, &[])?;
        self.handlers.write().insert(name.to_string(), handler);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    fn rewrite_patch<'a>(
        &'a self,
        caller: &'a Caller,
        action: WriteAction,
        patch: Record,
        used: Vec<String>,
        filter: Option<&'a Filter>,
    ) -> BoxFuture<'a, Result<Record>> {
        Box::pin(async move {
            let mut patches = Vec::with_capacity(patch.len());
            for key in patch.keys() {
                patches.push(self.rewrite_key(caller, action, &patch, key, &used, filter).await?);
            }
            let merged = deep_merge(patches)?;
            if !merged.is_empty() {
                validate_record(self.base.datasource()?.as_ref(), self, &merged)?;
            }
            Ok(merged)
        })
    }

    async fn rewrite_key(
        &self,
        caller: &Caller,
        action: WriteAction,
        record: &Record,
        key: &str,
        used: &[String],
        filter: Option<&Filter>,
    ) -> Result<Record> {
        if used.iter().any(|name| name == key) {
            let mut path = used.to_vec();
            path.push(key.to_string());
            return Err(ToolkitError::Cycle { kind: CycleKind::Write, path });
        }

        let value = record.get(key).cloned().unwrap_or_default();
        let schema = self.schema();
        match schema.fields.get(key) {
            Some(FieldSchema::Column(_)) => {
                let handler = match self.handlers.read().get(key).cloned() {
                    None => return Ok(Record::from([(key.to_string(), value)])),
                    Some(None) => {
                        return Err(ToolkitError::Forbidden(format!("{}.{key} is read-only", self.name())));
                    }
                    Some(Some(handler)) => handler,
                };
                let request = WriteRequest { value, action, record: record.clone(), filter: filter.cloned() };
                let mut field_patch = handler(request, self.base.context(caller)?).await?.unwrap_or_default();

                // Our own value is kept as is, the rest goes through the other handlers.
                let own = field_patch.remove(key);
                let mut path = used.to_vec();
                path.push(key.to_string());
                let rest = self.rewrite_patch(caller, action, field_patch, path, None).await?;
                match own {
                    Some(own) => deep_merge([Record::from([(key.to_string(), own)]), rest]),
                    None => Ok(rest),
                }
            }
            Some(field @ (FieldSchema::ManyToOne(_) | FieldSchema::OneToOne(_))) => {
                let Value::Record(sub) = value else {
                    return Ok(Record::from([(key.to_string(), value)]));
                };
                let foreign = field.foreign_collection().unwrap_or_default();
                let relation = self.base.collection(foreign)?;
                let rewritten = relation.rewrite_patch(caller, action, sub, Vec::new(), None).await?;
                Ok(Record::from([(key.to_string(), Value::Record(rewritten))]))
            }
            _ => Err(ToolkitError::schema(format!("unknown field: {}.{key}", self.name()))),
        }
    }
}

#[async_trait]
impl Collection for WriteReplaceCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            for (name, handler) in self.handlers.read().iter() {
                if let Some(column) = schema.fields.get_mut(name).and_then(FieldSchema::as_column_mut) {
                    column.is_read_only = handler.is_none();
                }
            }
            schema
        })
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        self.base.child().list(caller, filter, projection).await
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut rewritten = Vec::with_capacity(records.len());
        for record in records {
            rewritten.push(self.rewrite_patch(caller, WriteAction::Create, record, Vec::new(), None).await?);
        }
        self.base.child().create(caller, rewritten).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let patch = self.rewrite_patch(caller, WriteAction::Update, patch, Vec::new(), Some(&filter)).await?;
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
    use crate::decorators::handler;
    use crate::memory::{MemoryDatasource, RecordedCall, RecordingCollection};

    fn stack() -> (Arc<DatasourceDecorator<RecordingCollection>>, Arc<DatasourceDecorator<WriteReplaceCollection>>) {
        let memory = MemoryDatasource::new().with_collection(
            "items",
            CollectionSchema::new()
                .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                .with_field("name", ColumnSchema::new(PrimitiveType::String))
                .with_field("age", ColumnSchema::new(PrimitiveType::Number))
                .with_field("price", ColumnSchema::new(PrimitiveType::Number)),
            vec![to_record(json!({"id": 1, "name": "x", "age": 1, "price": 1}))],
        );
        let config = Arc::new(EngineConfig::default());
        let recording = DatasourceDecorator::<RecordingCollection>::new(Arc::new(memory), config.clone());
        let write = DatasourceDecorator::<WriteReplaceCollection>::new(recording.clone(), config);
        (recording, write)
    }

    fn writes(target: &'static str, value: i64) -> Option<WriteHandler> {
        Some(handler(move |_request: WriteRequest, _context| async move {
            Ok(Some(Record::from([(target.to_string(), Value::from(value))])))
        }))
    }

    #[tokio::test]
    async fn chained_handlers_resolve_to_plain_writes() {
        let (recording, write) = stack();
        let items = write.collection("items").unwrap();
        items.replace_field_writing("name", writes("age", 30)).unwrap();
        items.replace_field_writing("age", writes("price", 12)).unwrap();

        items.update(&Caller::default(), Filter::new(), to_record(json!({"name": "a"}))).await.unwrap();
        assert_eq!(
            recording.collection("items").unwrap().calls(),
            vec![RecordedCall::Update { filter: Filter::new(), patch: to_record(json!({"price": 12})) }]
        );
    }

    #[tokio::test]
    async fn write_cycles_report_their_path() {
        let (recording, write) = stack();
        let items = write.collection("items").unwrap();
        items.replace_field_writing("name", writes("age", 30)).unwrap();
        items.replace_field_writing("age", writes("price", 12)).unwrap();
        items
            .replace_field_writing("price", Some(handler(|_request: WriteRequest, _context| async move {
                Ok(Some(to_record(json!({"name": "again"}))))
            })))
            .unwrap();

        let err = items.update(&Caller::default(), Filter::new(), to_record(json!({"name": "a"}))).await.unwrap_err();
        assert_eq!(err.to_string(), "write cycle detected: name -> age -> price -> name");
        assert!(recording.collection("items").unwrap().calls().is_empty());
    }

    #[tokio::test]
    async fn diverging_values_conflict() {
        let (_, write) = stack();
        let items = write.collection("items").unwrap();
        items.replace_field_writing("name", writes("price", 1)).unwrap();
        items.replace_field_writing("age", writes("price", 2)).unwrap();

        let err = items
            .create(&Caller::default(), vec![to_record(json!({"name": "a", "age": 3}))])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolkitError::Conflict { ref field } if field == "price"));
    }

    #[tokio::test]
    async fn handler_sees_the_write_request_and_may_keep_its_value() {
        let (recording, write) = stack();
        let items = write.collection("items").unwrap();
        items
            .replace_field_writing(
                "name",
                Some(handler(|request: WriteRequest, _context| async move {
                    assert_eq!(request.action, WriteAction::Create);
                    let upper = request.value.display().to_uppercase();
                    Ok(Some(Record::from([("name".to_string(), Value::from(upper))])))
                })),
            )
            .unwrap();
        items.replace_field_writing("age", None).unwrap();
        assert!(items.schema().column("age").unwrap().is_read_only);

        items.create(&Caller::default(), vec![to_record(json!({"name": "dune"}))]).await.unwrap();
        let calls = recording.collection("items").unwrap().calls();
        assert!(matches!(&calls[0], RecordedCall::Create { records } if records[0] == to_record(json!({"name": "DUNE"}))));
    }

    #[tokio::test]
    async fn read_only_fields_reject_writes() {
        let (recording, write) = stack();
        let items = write.collection("items").unwrap();
        items.replace_field_writing("age", None).unwrap();

        let err = items.update(&Caller::default(), Filter::new(), to_record(json!({"age": 5}))).await.unwrap_err();
        assert!(matches!(err, ToolkitError::Forbidden(ref message) if message == "items.age is read-only"));

        let err = items
            .create(&Caller::default(), vec![to_record(json!({"name": "a", "age": 5}))])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolkitError::Forbidden(_)));
        assert!(recording.collection("items").unwrap().calls().is_empty());
    }

    #[tokio::test]
    async fn read_only_fields_leave_other_writes_alone() {
        let (recording, write) = stack();
        let items = write.collection("items").unwrap();
        items.replace_field_writing("age", None).unwrap();
        items.replace_field_writing("name", writes("price", 3)).unwrap();

        items.update(&Caller::default(), Filter::new(), to_record(json!({"name": "a"}))).await.unwrap();
        assert_eq!(
            recording.collection("items").unwrap().calls(),
            vec![RecordedCall::Update { filter: Filter::new(), patch: to_record(json!({"price": 3})) }]
        );
    }

    #[test]
    fn merge_accepts_equal_values_and_nested_records() {
        let merged = deep_merge([
            to_record(json!({"a": 1, "author": {"name": "x"}})),
            to_record(json!({"a": 1, "author": {"age": 2}})),
        ])
        .unwrap();
        assert_eq!(merged, to_record(json!({"a": 1, "author": {"name": "x", "age": 2}})));
    }
}
