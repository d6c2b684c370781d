//! Operators the backend lacks, provided either by a caller-supplied rewrite
//! or by client-side evaluation over the whole collection.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use quarry_core::condition_tree::factory;
use quarry_core::schema::FieldSchema;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ConditionTree, ConditionTreeLeaf, CycleKind, Filter,
    Operator, PaginatedFilter, Projection, Record, Result, ToolkitError, Value,
};
use tracing::{debug, warn};

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory, Handler};
use crate::collection::{Collection, CollectionRef};
use crate::utils::{projection_with_pks, FieldResolver};
use crate::validators::{validate_condition_tree, validate_field};

/// Rewrite of one operator on one field. `None` means full emulation.
type Replacement = Option<Handler<Value, ConditionTree>>;

pub struct OperatorsEmulateCollection {
    base: DecoratorBase<OperatorsEmulateCollection>,
    fields: RwLock<BTreeMap<String, BTreeMap<Operator, Replacement>>>,
}

impl DecoratorFactory for OperatorsEmulateCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), fields: RwLock::new(BTreeMap::new()) }
    }
}

impl OperatorsEmulateCollection {
    /// Evaluates `operator` on `name` in memory.
    ///
    /// # Errors
    ///
    /// See [`OperatorsEmulateCollection::replace_field_operator`].
    pub fn emulate_field_operator(&self, name: &str, operator: Operator) -> Result<()> {
        self.register(name, operator, None)
    }

    /// Rewrites `operator` on `name` with `replace_by(value, context)`.
    ///
    /// # Errors
    ///
    /// Fails when the primary keys do not support `equal` and `in`, when the
    /// field is not a column of this collection, or when the operator makes
    /// no sense for the column type.
    pub fn replace_field_operator(
        &self,
        name: &str,
        operator: Operator,
        replace_by: Handler<Value, ConditionTree>,
    ) -> Result<()> {
        self.register(name, operator, Some(replace_by))
    }

    fn register(&self, name: &str, operator: Operator, replacement: Replacement) -> Result<()> {
        let child_schema = self.base.child().schema();
        for key in child_schema.primary_keys() {
            let operators = &child_schema.column(&key)?.filter_operators;
            if !operators.contains(&Operator::Equal) || !operators.contains(&Operator::In) {
                return Err(ToolkitError::schema(format!(
                    "cannot override operators on collection '{}': the primary key columns must support 'equal' and 'in' operators",
                    self.name()
                )));
            }
        }

        validate_field(self.base.datasource()?.as_ref(), self, name, &[])?;
        let column = child_schema
            .fields
            .get(name)
            .and_then(FieldSchema::as_column)
            .ok_or_else(|| ToolkitError::schema(format!("cannot replace operator for relation on field '{name}'")))?;
        let allowed = column.column_type.as_primitive().map(Operator::allowed_for).unwrap_or_default();
        if !allowed.contains(&operator) {
            return Err(ToolkitError::schema(format!(
                "cannot replace operator '{operator}' on field type '{:?}' for field '{name}'",
                column.column_type
            )));
        }

        self.fields.write().entry(name.to_string()).or_default().insert(operator, replacement);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    async fn refine_tree(&self, caller: &Caller, tree: Option<ConditionTree>) -> Result<Option<ConditionTree>> {
        match tree {
            Some(tree) => {
                let tree = tree.replace_leafs_async(|leaf| self.replace_leaf(caller, leaf, Vec::new())).await?;
                Ok(Some(tree))
            }
            None => Ok(None),
        }
    }

    async fn refine_filter(&self, caller: &Caller, mut filter: Filter) -> Result<Filter> {
        filter.condition_tree = self.refine_tree(caller, filter.condition_tree.take()).await?;
        Ok(filter)
    }

    fn replace_leaf<'a>(
        &'a self,
        caller: &'a Caller,
        leaf: ConditionTreeLeaf,
        path: Vec<String>,
    ) -> BoxFuture<'a, Result<ConditionTree>> {
        Box::pin(async move {
            if let Some((prefix, rest)) = leaf.field.split_once(':') {
                let schema = self.schema();
                let foreign = schema
                    .field(prefix)?
                    .foreign_collection()
                    .ok_or_else(|| ToolkitError::schema(format!("'{prefix}' is not a relation")))?
                    .to_string();
                let association = self.base.collection(&foreign)?;
                let tree = association.replace_leaf(caller, leaf.override_field(rest), path).await?;
                return Ok(tree.nest(prefix));
            }

            let registered = self
                .fields
                .read()
                .get(&leaf.field)
                .and_then(|operators| operators.get(&leaf.operator).cloned());
            match registered {
                Some(replacement) => self.compute_equivalent(caller, leaf, replacement, path).await,
                None => Ok(ConditionTree::Leaf(leaf)),
            }
        })
    }

    async fn compute_equivalent(
        &self,
        caller: &Caller,
        leaf: ConditionTreeLeaf,
        replacement: Replacement,
        path: Vec<String>,
    ) -> Result<ConditionTree> {
        let Some(replace_by) = replacement else {
            return self.emulate(caller, &leaf).await;
        };

        let step = format!("{}.{}[{}]", self.name(), leaf.field, leaf.operator);
        let mut sub_path = path;
        let cycle = sub_path.contains(&step);
        sub_path.push(step);
        if cycle {
            return Err(ToolkitError::Cycle { kind: CycleKind::Operator, path: sub_path });
        }

        let equivalent = replace_by(leaf.value.clone(), self.base.context(caller)?).await?;
        let equivalent = equivalent
            .replace_leafs_async(|sub_leaf| self.replace_leaf(caller, sub_leaf, sub_path.clone()))
            .await?;
        validate_condition_tree(self.base.datasource()?.as_ref(), self, &equivalent)?;
        Ok(equivalent)
    }

    /// Lists every record, evaluates `leaf` in memory and returns a tree
    /// matching the survivors by primary key.
    async fn emulate(&self, caller: &Caller, leaf: &ConditionTreeLeaf) -> Result<ConditionTree> {
        if self.base.config().warn_on_full_scan {
            warn!(collection = self.name(), field = %leaf.field, operator = %leaf.operator, "emulating operator with a full scan");
        } else {
            debug!(collection = self.name(), field = %leaf.field, operator = %leaf.operator, "emulating operator with a full scan");
        }
        let layer = self.base.datasource()?;
        let projection = projection_with_pks(layer.as_ref(), self, &Projection::from_iter([leaf.field.clone()]))?;
        let records = self.list(caller, PaginatedFilter::new(), projection).await?;
        let resolver = FieldResolver::new(layer.as_ref(), self);
        let matched = ConditionTree::Leaf(leaf.clone()).filter_records(records, &resolver, &caller.time_context())?;
        factory::match_records(&self.schema(), &matched)
    }
}

#[async_trait]
impl Collection for OperatorsEmulateCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            for (name, operators) in self.fields.read().iter() {
                if let Some(column) = schema.fields.get_mut(name).and_then(FieldSchema::as_column_mut) {
                    column.filter_operators.extend(operators.keys().copied());
                }
            }
            schema
        })
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, mut filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        filter.filter = self.refine_filter(caller, filter.filter).await?;
        self.base.child().list(caller, filter, projection).await
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        self.base.child().create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let filter = self.refine_filter(caller, filter).await?;
        self.base.child().update(caller, filter, patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        let filter = self.refine_filter(caller, filter).await?;
        self.base.child().delete(caller, filter).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let filter = self.refine_filter(caller, filter).await?;
        self.base.child().aggregate(caller, filter, aggregation, limit).await
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::schema::{ColumnSchema, ManyToOneSchema, PrimitiveType};
    use quarry_core::value::to_record;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::datasource::Datasource;
    use crate::decorators::handler;
    use crate::memory::{MemoryDatasource, RecordingCollection};

    fn stack() -> (Arc<DatasourceDecorator<RecordingCollection>>, Arc<DatasourceDecorator<OperatorsEmulateCollection>>) {
        let keys = [Operator::Equal, Operator::In];
        let memory = MemoryDatasource::new()
            .with_collection(
                "books",
                CollectionSchema::new()
                    .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key().operators(keys))
                    .with_field("title", ColumnSchema::new(PrimitiveType::String).operators([Operator::StartsWith]))
                    .with_field("author_id", ColumnSchema::new(PrimitiveType::Number).operators(keys))
                    .with_field(
                        "author",
                        FieldSchema::ManyToOne(ManyToOneSchema {
                            foreign_collection: "persons".into(),
                            foreign_key: "author_id".into(),
                            foreign_key_target: "id".into(),
                        }),
                    ),
                vec![
                    to_record(json!({"id": 1, "title": "Beat the dealer", "author_id": 1})),
                    to_record(json!({"id": 2, "title": "Foundation", "author_id": 2})),
                    to_record(json!({"id": 3, "title": "Papillon", "author_id": 3})),
                ],
            )
            .with_collection(
                "persons",
                CollectionSchema::new()
                    .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key().operators(keys))
                    .with_field("first_name", ColumnSchema::new(PrimitiveType::String).operators([Operator::Equal])),
                vec![
                    to_record(json!({"id": 1, "first_name": "Edward"})),
                    to_record(json!({"id": 2, "first_name": "Isaac"})),
                    to_record(json!({"id": 3, "first_name": "Henri"})),
                ],
            );
        let config = Arc::new(EngineConfig::default());
        let recording = DatasourceDecorator::<RecordingCollection>::new(Arc::new(memory), config.clone());
        let emulate = DatasourceDecorator::<OperatorsEmulateCollection>::new(recording.clone(), config);
        (recording, emulate)
    }

    fn titles(records: &[Record]) -> Vec<String> {
        records.iter().filter_map(|record| record.get("title")?.as_str().map(str::to_string)).collect()
    }

    #[test]
    fn registration_is_checked_and_extends_schema() {
        let (_, emulate) = stack();
        let books = emulate.collection("books").unwrap();
        assert!(books.emulate_field_operator("isbn", Operator::Equal).is_err());
        assert!(books.emulate_field_operator("author", Operator::Equal).is_err());
        assert!(books.emulate_field_operator("author:first_name", Operator::Equal).is_err());
        assert!(books.emulate_field_operator("id", Operator::Like).is_err());

        books.emulate_field_operator("title", Operator::Contains).unwrap();
        let operators = books.schema().column("title").unwrap().filter_operators.clone();
        assert_eq!(operators, [Operator::StartsWith, Operator::Contains].into_iter().collect());
    }

    #[tokio::test]
    async fn replacement_chains_down_to_emulated_operators() {
        let (recording, emulate) = stack();
        let books = emulate.collection("books").unwrap();
        books.emulate_field_operator("title", Operator::ShorterThan).unwrap();
        books.emulate_field_operator("title", Operator::Contains).unwrap();
        books
            .replace_field_operator(
                "title",
                Operator::Equal,
                handler(|value: Value, _context| async move {
                    let length = value.display().chars().count() + 1;
                    Ok(ConditionTree::and(vec![
                        ConditionTree::leaf("title", Operator::Contains, value),
                        ConditionTree::leaf("title", Operator::ShorterThan, length),
                    ]))
                }),
            )
            .unwrap();

        let records = books
            .list(
                &Caller::default(),
                PaginatedFilter::from_tree(ConditionTree::leaf("title", Operator::Equal, "Foundation")),
                Projection::from("id,title"),
            )
            .await
            .unwrap();
        assert_eq!(titles(&records), vec!["Foundation"]);

        let calls = recording.collection("books").unwrap().list_calls();
        let (last_filter, _) = calls.last().unwrap();
        assert!(last_filter.condition_tree().unwrap().every_leaf(|leaf| leaf.field == "id"));
    }

    #[tokio::test]
    async fn replacement_cycles_are_reported_with_their_path() {
        let (_, emulate) = stack();
        let books = emulate.collection("books").unwrap();
        books
            .replace_field_operator(
                "title",
                Operator::StartsWith,
                handler(|value: Value, _context| async move {
                    Ok(ConditionTree::leaf("title", Operator::Like, format!("{}%", value.display())))
                }),
            )
            .unwrap();
        books
            .replace_field_operator(
                "title",
                Operator::Like,
                handler(|value: Value, _context| async move {
                    Ok(ConditionTree::leaf("title", Operator::StartsWith, value))
                }),
            )
            .unwrap();

        let err = books
            .list(
                &Caller::default(),
                PaginatedFilter::from_tree(ConditionTree::leaf("title", Operator::StartsWith, "Found")),
                Projection::from("id"),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "operator replacement cycle detected: books.title[starts_with] -> books.title[like] -> books.title[starts_with]"
        );
    }

    #[tokio::test]
    async fn leaves_through_relations_are_emulated_on_the_related_collection() {
        let (recording, emulate) = stack();
        emulate.collection("persons").unwrap().emulate_field_operator("first_name", Operator::StartsWith).unwrap();
        let books = emulate.collection("books").unwrap();

        let records = books
            .list(
                &Caller::default(),
                PaginatedFilter::from_tree(ConditionTree::leaf("author:first_name", Operator::StartsWith, "Isaa")),
                Projection::from("title"),
            )
            .await
            .unwrap();
        assert_eq!(titles(&records), vec!["Foundation"]);

        let calls = recording.collection("books").unwrap().list_calls();
        assert_eq!(
            calls[0].0.condition_tree(),
            Some(&ConditionTree::leaf("author:id", Operator::Equal, 2))
        );
    }

    #[tokio::test]
    async fn unregistered_operators_pass_through() {
        let (recording, emulate) = stack();
        let books = emulate.collection("books").unwrap();
        let tree = ConditionTree::leaf("title", Operator::StartsWith, "Pap");
        books.delete(&Caller::default(), Filter::from_tree(tree.clone())).await.unwrap();
        assert_eq!(
            recording.collection("books").unwrap().calls(),
            vec![crate::memory::RecordedCall::Delete { filter: Filter::from_tree(tree) }]
        );
    }
}
