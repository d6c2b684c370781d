//! Replaces writes with customer handlers. Unset handlers fall through to
//! the wrapped collection.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, Filter, PaginatedFilter, Projection, Record, Result,
};
use tracing::debug;

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory, Handler};
use crate::collection::{Collection, CollectionRef};

pub type CreateOverride = Handler<Vec<Record>, Vec<Record>>;
pub type UpdateOverride = Handler<(Filter, Record), ()>;
pub type DeleteOverride = Handler<Filter, ()>;

#[derive(Default, Clone)]
struct Overrides {
    create: Option<CreateOverride>,
    update: Option<UpdateOverride>,
    delete: Option<DeleteOverride>,
}

pub struct OverrideCollection {
    base: DecoratorBase<OverrideCollection>,
    overrides: RwLock<Overrides>,
}

impl DecoratorFactory for OverrideCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), overrides: RwLock::new(Overrides::default()) }
    }
}

impl OverrideCollection {
    pub fn add_create_handler(&self, handler: CreateOverride) {
        self.overrides.write().create = Some(handler);
    }

    pub fn add_update_handler(&self, handler: UpdateOverride) {
        self.overrides.write().update = Some(handler);
    }

    pub fn add_delete_handler(&self, handler: DeleteOverride) {
        self.overrides.write().delete = Some(handler);
    }
}

#[async_trait]
impl Collection for OverrideCollection {
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
        let handler = self.overrides.read().create.clone();
        match handler {
            Some(handler) => {
                debug!(collection = self.name(), "create overridden");
                handler(records, self.base.child_context(caller)?).await
            }
            None => self.base.child().create(caller, records).await,
        }
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let handler = self.overrides.read().update.clone();
        match handler {
            Some(handler) => {
                debug!(collection = self.name(), "update overridden");
                handler((filter, patch), self.base.child_context(caller)?).await
            }
            None => self.base.child().update(caller, filter, patch).await,
        }
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        let handler = self.overrides.read().delete.clone();
        match handler {
            Some(handler) => {
                debug!(collection = self.name(), "delete overridden");
                handler(filter, self.base.child_context(caller)?).await
            }
            None => self.base.child().delete(caller, filter).await,
        }
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

    fn stack() -> (Arc<DatasourceDecorator<RecordingCollection>>, Arc<DatasourceDecorator<OverrideCollection>>) {
        let memory = MemoryDatasource::new().with_collection(
            "books",
            CollectionSchema::new()
                .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                .with_field("title", ColumnSchema::new(PrimitiveType::String)),
            Vec::new(),
        );
        let config = Arc::new(EngineConfig::default());
        let recording = DatasourceDecorator::<RecordingCollection>::new(Arc::new(memory), config.clone());
        let overrides = DatasourceDecorator::<OverrideCollection>::new(recording.clone(), config);
        (recording, overrides)
    }

    #[tokio::test]
    async fn unset_handlers_fall_through() {
        let (recording, overrides) = stack();
        let books = overrides.collection("books").unwrap();
        books.delete(&Caller::default(), Filter::new()).await.unwrap();
        assert_eq!(recording.collection("books").unwrap().calls(), vec![RecordedCall::Delete { filter: Filter::new() }]);
    }

    #[tokio::test]
    async fn create_handler_replaces_the_call_and_can_reach_the_child() {
        let (recording, overrides) = stack();
        let books = overrides.collection("books").unwrap();
        books.add_create_handler(handler(|records: Vec<Record>, context| async move {
            let titled = records
                .into_iter()
                .map(|mut record| {
                    record.insert("title".into(), "Untitled".into());
                    record
                })
                .collect();
            context.collection()?.create(&context.caller, titled).await
        }));

        let created = books.create(&Caller::default(), vec![Record::new()]).await.unwrap();
        assert_eq!(created, vec![to_record(json!({"id": 1, "title": "Untitled"}))]);
        assert_eq!(
            recording.collection("books").unwrap().calls(),
            vec![RecordedCall::Create { records: vec![to_record(json!({"title": "Untitled"}))] }]
        );
    }
}
