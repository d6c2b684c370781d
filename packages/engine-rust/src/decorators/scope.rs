//! Permission scopes: a condition tree, with `{{currentUser.*}}` and request
//! placeholders, ANDed into every read and write filter.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ConditionTree, ContextVariables, Filter, PaginatedFilter,
    Projection, Record, Result,
};
use tracing::trace;

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};
use crate::validators::validate_field;

pub struct ScopeCollection {
    base: DecoratorBase<ScopeCollection>,
    scope: RwLock<Option<ConditionTree>>,
}

impl DecoratorFactory for ScopeCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), scope: RwLock::new(None) }
    }
}

impl ScopeCollection {
    /// Restricts every operation to the records matching `scope`; `None`
    /// lifts the restriction.
    ///
    /// # Errors
    ///
    /// Fails when the tree references unknown fields. Placeholder values are
    /// only checked once injected.
    pub fn set_scope(&self, scope: Option<ConditionTree>) -> Result<()> {
        if let Some(tree) = &scope {
            let datasource = self.base.datasource()?;
            for field in tree.projection().iter() {
                validate_field(datasource.as_ref(), self, field, &[])?;
            }
        }
        *self.scope.write() = scope;
        Ok(())
    }

    /// The scope of `caller`, placeholders resolved.
    fn scope_for(&self, caller: &Caller) -> Result<Option<ConditionTree>> {
        let scope = self.scope.read().clone();
        let Some(scope) = scope else {
            return Ok(None);
        };
        let tree = ContextVariables::from_caller(caller).inject_in_tree(&scope)?;
        trace!(collection = self.name(), caller = caller.id, scope = %tree, "scope applied");
        Ok(Some(tree))
    }
}

#[async_trait]
impl Collection for ScopeCollection {
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
        let filter = filter.intersect_with(self.scope_for(caller)?);
        self.base.child().list(caller, filter, projection).await
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        self.base.child().create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let filter = filter.intersect_with(self.scope_for(caller)?);
        self.base.child().update(caller, filter, patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        let filter = filter.intersect_with(self.scope_for(caller)?);
        self.base.child().delete(caller, filter).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let filter = filter.intersect_with(self.scope_for(caller)?);
        self.base.child().aggregate(caller, filter, aggregation, limit).await
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::schema::{ColumnSchema, PrimitiveType};
    use quarry_core::value::to_record;
    use quarry_core::{Operator, Value};
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::{MemoryDatasource, RecordingCollection};

    fn stack() -> (Arc<DatasourceDecorator<RecordingCollection>>, Arc<DatasourceDecorator<ScopeCollection>>) {
        let memory = MemoryDatasource::new().with_collection(
            "books",
            CollectionSchema::new()
                .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                .with_field("owner_id", ColumnSchema::new(PrimitiveType::Number)),
            vec![to_record(json!({"id": 1, "owner_id": 42})), to_record(json!({"id": 2, "owner_id": 7}))],
        );
        let config = Arc::new(EngineConfig::default());
        let recording = DatasourceDecorator::<RecordingCollection>::new(Arc::new(memory), config.clone());
        let scope = DatasourceDecorator::<ScopeCollection>::new(recording.clone(), config);
        (recording, scope)
    }

    #[tokio::test]
    async fn scope_is_injected_per_caller_and_intersected() {
        let (recording, scope) = stack();
        let books = scope.collection("books").unwrap();
        books
            .set_scope(Some(ConditionTree::leaf("owner_id", Operator::Equal, "{{currentUser.id}}")))
            .unwrap();

        let caller = Caller::new(42, "ada@example.com");
        let filter = PaginatedFilter::from_tree(ConditionTree::leaf("id", Operator::GreaterThan, 0));
        let records = books.list(&caller, filter, Projection::from("id")).await.unwrap();
        assert_eq!(records, vec![to_record(json!({"id": 1}))]);

        let calls = recording.collection("books").unwrap().list_calls();
        assert_eq!(
            calls[0].0.condition_tree(),
            Some(&ConditionTree::and(vec![
                ConditionTree::leaf("id", Operator::GreaterThan, 0),
                ConditionTree::leaf("owner_id", Operator::Equal, Value::Int(42)),
            ]))
        );
    }

    #[tokio::test]
    async fn writes_are_scoped_too() {
        let (recording, scope) = stack();
        let books = scope.collection("books").unwrap();
        books.set_scope(Some(ConditionTree::leaf("owner_id", Operator::Equal, 7))).unwrap();
        books.delete(&Caller::default(), Filter::new()).await.unwrap();
        assert_eq!(
            recording.collection("books").unwrap().calls(),
            vec![crate::memory::RecordedCall::Delete {
                filter: Filter::from_tree(ConditionTree::leaf("owner_id", Operator::Equal, 7))
            }]
        );
    }

    #[test]
    fn unknown_scope_fields_are_rejected() {
        let (_, scope) = stack();
        let books = scope.collection("books").unwrap();
        assert!(books.set_scope(Some(ConditionTree::leaf("isbn", Operator::Present, Value::Null))).is_err());
    }
}
