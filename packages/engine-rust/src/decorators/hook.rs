//! Before/after callbacks around each operation.
//!
//! A before hook aborts the operation by returning an error, typically
//! [`ToolkitError::InvalidRequest`], [`ToolkitError::Forbidden`] or
//! [`ToolkitError::Unprocessable`]. After hooks see the result but cannot
//! change it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, Filter, PaginatedFilter, Projection, Record, Result,
};

use super::{CollectionContext, DatasourceDecorator, DecoratorBase, DecoratorFactory, Handler};
use crate::collection::{Collection, CollectionRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookPosition {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CrudMethod {
    List,
    Create,
    Update,
    Delete,
    Aggregate,
}

impl fmt::Display for CrudMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Aggregate => "aggregate",
        })
    }
}

/// Arguments of the hooked call. Results are only set for after hooks.
#[derive(Debug, Clone)]
pub enum HookPayload {
    List { filter: PaginatedFilter, projection: Projection, records: Option<Vec<Record>> },
    Create { records: Vec<Record>, created: Option<Vec<Record>> },
    Update { filter: Filter, patch: Record },
    Delete { filter: Filter },
    Aggregate { filter: Filter, aggregation: Aggregation, limit: Option<usize>, rows: Option<Vec<AggregateResult>> },
}

pub type HookHandler = Handler<HookPayload, ()>;

pub struct HookCollection {
    base: DecoratorBase<HookCollection>,
    hooks: RwLock<BTreeMap<(CrudMethod, HookPosition), Vec<HookHandler>>>,
}

impl DecoratorFactory for HookCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), hooks: RwLock::new(BTreeMap::new()) }
    }
}

impl HookCollection {
    /// Hooks run in registration order.
    pub fn add_hook(&self, position: HookPosition, method: CrudMethod, hook: HookHandler) {
        self.hooks.write().entry((method, position)).or_default().push(hook);
    }

    async fn run(&self, caller: &Caller, method: CrudMethod, position: HookPosition, payload: &HookPayload) -> Result<()> {
        let hooks = self.hooks.read().get(&(method, position)).cloned().unwrap_or_default();
        if hooks.is_empty() {
            return Ok(());
        }
        let context: CollectionContext = self.base.child_context(caller)?;
        for hook in hooks {
            hook(payload.clone(), context.clone()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Collection for HookCollection {
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
        let mut payload = HookPayload::List { filter: filter.clone(), projection: projection.clone(), records: None };
        self.run(caller, CrudMethod::List, HookPosition::Before, &payload).await?;
        let records = self.base.child().list(caller, filter, projection).await?;
        if let HookPayload::List { records: slot, .. } = &mut payload {
            *slot = Some(records.clone());
        }
        self.run(caller, CrudMethod::List, HookPosition::After, &payload).await?;
        Ok(records)
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut payload = HookPayload::Create { records: records.clone(), created: None };
        self.run(caller, CrudMethod::Create, HookPosition::Before, &payload).await?;
        let created = self.base.child().create(caller, records).await?;
        if let HookPayload::Create { created: slot, .. } = &mut payload {
            *slot = Some(created.clone());
        }
        self.run(caller, CrudMethod::Create, HookPosition::After, &payload).await?;
        Ok(created)
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let payload = HookPayload::Update { filter: filter.clone(), patch: patch.clone() };
        self.run(caller, CrudMethod::Update, HookPosition::Before, &payload).await?;
        self.base.child().update(caller, filter, patch).await?;
        self.run(caller, CrudMethod::Update, HookPosition::After, &payload).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        let payload = HookPayload::Delete { filter: filter.clone() };
        self.run(caller, CrudMethod::Delete, HookPosition::Before, &payload).await?;
        self.base.child().delete(caller, filter).await?;
        self.run(caller, CrudMethod::Delete, HookPosition::After, &payload).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let mut payload =
            HookPayload::Aggregate { filter: filter.clone(), aggregation: aggregation.clone(), limit, rows: None };
        self.run(caller, CrudMethod::Aggregate, HookPosition::Before, &payload).await?;
        let rows = self.base.child().aggregate(caller, filter, aggregation, limit).await?;
        if let HookPayload::Aggregate { rows: slot, .. } = &mut payload {
            *slot = Some(rows.clone());
        }
        self.run(caller, CrudMethod::Aggregate, HookPosition::After, &payload).await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use quarry_core::schema::{ColumnSchema, PrimitiveType};
    use quarry_core::value::to_record;
    use quarry_core::ToolkitError;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::decorators::handler;
    use crate::memory::{MemoryDatasource, RecordingCollection};

    fn stack() -> (Arc<DatasourceDecorator<RecordingCollection>>, Arc<DatasourceDecorator<HookCollection>>) {
        let memory = MemoryDatasource::new().with_collection(
            "books",
            CollectionSchema::new()
                .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                .with_field("title", ColumnSchema::new(PrimitiveType::String)),
            vec![to_record(json!({"id": 1, "title": "Dune"}))],
        );
        let config = Arc::new(EngineConfig::default());
        let recording = DatasourceDecorator::<RecordingCollection>::new(Arc::new(memory), config.clone());
        let hooks = DatasourceDecorator::<HookCollection>::new(recording.clone(), config);
        (recording, hooks)
    }

    #[tokio::test]
    async fn before_hook_aborts_the_call() {
        let (recording, hooks) = stack();
        let books = hooks.collection("books").unwrap();
        books.add_hook(
            HookPosition::Before,
            CrudMethod::Delete,
            handler(|_payload: HookPayload, _context| async move {
                Err(ToolkitError::Forbidden("books cannot be deleted".into()))
            }),
        );

        let err = books.delete(&Caller::default(), Filter::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "forbidden: books cannot be deleted");
        assert!(recording.collection("books").unwrap().calls().is_empty());
    }

    #[tokio::test]
    async fn hooks_run_in_order_and_after_hooks_see_the_result() {
        let (_, hooks) = stack();
        let books = hooks.collection("books").unwrap();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();

        for position in [HookPosition::Before, HookPosition::After] {
            let seen = seen.clone();
            books.add_hook(
                position,
                CrudMethod::List,
                handler(move |payload: HookPayload, context| {
                    let seen = seen.clone();
                    async move {
                        if let HookPayload::List { records, .. } = payload {
                            let count = records.map_or(0, |records| records.len());
                            seen.lock().push(format!("{position:?} {} {count}", context.collection_name()));
                        }
                        Ok(())
                    }
                }),
            );
        }

        let records = books.list(&Caller::default(), PaginatedFilter::new(), Projection::from("id")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(*seen.lock(), vec!["Before books 0".to_string(), "After books 1".to_string()]);
    }
}
