//! Advertises every operator that can be rewritten into natively supported
//! ones, and performs that rewrite on incoming filters.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use quarry_core::condition_tree::equivalence::{equivalent_tree, has_equivalent_tree};
use quarry_core::schema::{ColumnSchema, FieldSchema};
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ConditionTree, Filter, Operator, PaginatedFilter,
    Projection, Record, Result, ToolkitError,
};

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};

pub struct OperatorsEquivalenceCollection {
    base: DecoratorBase<OperatorsEquivalenceCollection>,
}

impl DecoratorFactory for OperatorsEquivalenceCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource) }
    }
}

impl OperatorsEquivalenceCollection {
    /// Column behind `path` as the layer below exposes it.
    fn native_column(&self, path: &str) -> Result<Option<ColumnSchema>> {
        let schema = self.base.child().schema();
        match path.split_once(':') {
            None => Ok(schema.fields.get(path).and_then(FieldSchema::as_column).cloned()),
            Some((head, rest)) => {
                let foreign = schema
                    .field(head)?
                    .foreign_collection()
                    .ok_or_else(|| ToolkitError::schema(format!("'{head}' is not a relation")))?;
                self.base.collection(foreign)?.native_column(rest)
            }
        }
    }

    fn refine_tree(&self, caller: &Caller, filter: &Filter) -> Result<Option<ConditionTree>> {
        let Some(tree) = &filter.condition_tree else {
            return Ok(None);
        };
        let time = caller.time_context_in(filter.timezone);
        tree.replace_leafs(|leaf| {
            if let Some(column) = self.native_column(&leaf.field)? {
                if let Some(rewritten) =
                    equivalent_tree(leaf, &column.filter_operators, &column.column_type, &time)?
                {
                    return Ok(rewritten);
                }
            }
            Ok(ConditionTree::Leaf(leaf.clone()))
        })
        .map(Some)
    }

    fn refine_filter(&self, caller: &Caller, filter: Filter) -> Result<Filter> {
        let tree = self.refine_tree(caller, &filter)?;
        Ok(filter.with_condition_tree(tree))
    }
}

#[async_trait]
impl Collection for OperatorsEquivalenceCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            for field in schema.fields.values_mut() {
                if let Some(column) = field.as_column_mut() {
                    let operators: BTreeSet<Operator> = Operator::ALL
                        .iter()
                        .copied()
                        .filter(|operator| has_equivalent_tree(*operator, &column.filter_operators, &column.column_type))
                        .collect();
                    column.filter_operators = operators;
                }
            }
            schema
        })
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        let tree = self.refine_tree(caller, &filter.filter)?;
        self.base.child().list(caller, filter.with_condition_tree(tree), projection).await
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        self.base.child().create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let filter = self.refine_filter(caller, filter)?;
        self.base.child().update(caller, filter, patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        let filter = self.refine_filter(caller, filter)?;
        self.base.child().delete(caller, filter).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let filter = self.refine_filter(caller, filter)?;
        self.base.child().aggregate(caller, filter, aggregation, limit).await
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::schema::PrimitiveType;
    use quarry_core::value::to_record;
    use quarry_core::Value;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::datasource::Datasource;
    use crate::memory::{MemoryDatasource, RecordingCollection};

    fn stack() -> (Arc<DatasourceDecorator<RecordingCollection>>, Arc<DatasourceDecorator<OperatorsEquivalenceCollection>>) {
        let memory = MemoryDatasource::new().with_collection(
            "books",
            CollectionSchema::new()
                .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key().operators([Operator::Equal, Operator::In]))
                .with_field("title", ColumnSchema::new(PrimitiveType::String).operators([Operator::Equal, Operator::In])),
            vec![
                to_record(json!({"id": 1, "title": "Foundation"})),
                to_record(json!({"id": 2, "title": ""})),
            ],
        );
        let config = Arc::new(EngineConfig::default());
        let recording = DatasourceDecorator::<RecordingCollection>::new(Arc::new(memory), config.clone());
        let equivalence = DatasourceDecorator::<OperatorsEquivalenceCollection>::new(recording.clone(), config);
        (recording, equivalence)
    }

    #[test]
    fn schema_advertises_reachable_operators() {
        let (_, equivalence) = stack();
        let schema = equivalence.get_collection("books").unwrap().schema();
        let operators = &schema.column("title").unwrap().filter_operators;
        assert!(operators.contains(&Operator::Blank));
        assert!(operators.contains(&Operator::Missing));
        assert!(!operators.contains(&Operator::NotEqual));
        assert!(!operators.contains(&Operator::Contains));
    }

    #[tokio::test]
    async fn filters_reach_the_backend_with_native_operators_only() {
        let (recording, equivalence) = stack();
        let books = equivalence.get_collection("books").unwrap();
        let records = books
            .list(
                &Caller::default(),
                PaginatedFilter::from_tree(ConditionTree::leaf("title", Operator::Blank, Value::Null)),
                Projection::from("id"),
            )
            .await
            .unwrap();
        assert_eq!(records, vec![to_record(json!({"id": 2}))]);

        let calls = recording.collection("books").unwrap().list_calls();
        let tree = calls[0].0.condition_tree().unwrap();
        assert!(tree.every_leaf(|leaf| matches!(leaf.operator, Operator::Equal | Operator::In)));
    }

    #[tokio::test]
    async fn leaves_without_equivalent_are_forwarded_unchanged() {
        let (recording, equivalence) = stack();
        let books = equivalence.get_collection("books").unwrap();
        let tree = ConditionTree::leaf("title", Operator::Contains, "Found");
        books.delete(&Caller::default(), Filter::from_tree(tree.clone())).await.unwrap();
        let calls = recording.collection("books").unwrap().calls();
        assert_eq!(
            calls,
            vec![crate::memory::RecordedCall::Delete { filter: Filter::from_tree(tree) }]
        );
    }
}
