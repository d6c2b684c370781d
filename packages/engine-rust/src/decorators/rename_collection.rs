//! Collection renaming. Relations of every collection of the layer are
//! rewritten to point at the new names.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, FieldSchema, Filter, PaginatedFilter, Projection, Record,
    Result, ToolkitError,
};
use tracing::debug;

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};
use crate::datasource::Datasource;

pub struct RenamedCollection {
    base: DecoratorBase<RenamedCollection>,
    renamed: OnceLock<String>,
}

impl DecoratorFactory for RenamedCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), renamed: OnceLock::new() }
    }
}

impl RenamedCollection {
    /// Exposed name of the collection called `child_name` below this layer.
    fn exposed_name(&self, child_name: &str) -> String {
        self.base
            .datasource()
            .ok()
            .and_then(|layer| layer.decorators().into_iter().find(|sibling| sibling.base.name() == child_name))
            .map_or_else(|| child_name.to_string(), |sibling| sibling.name().to_string())
    }
}

impl DatasourceDecorator<RenamedCollection> {
    /// Exposes collection `current` as `new`. Renaming to the same name is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Fails when `current` is unknown, when `new` is already taken, when
    /// the collection was renamed before, and when the collection is the
    /// target of a polymorphic relation.
    pub fn rename_collection(&self, current: &str, new: &str) -> Result<()> {
        let collection = self.collection(current)?;
        if current == new {
            return Ok(());
        }
        if self.collection_names().iter().any(|name| name == new) {
            return Err(ToolkitError::datasource(format!(
                "the new collection name '{new}' is already defined in the datasource"
            )));
        }
        let original = collection.base.name().to_string();
        if collection.renamed.get().is_some() {
            return Err(ToolkitError::datasource(format!(
                "cannot rename a collection twice: {original}->{current}->{new}"
            )));
        }
        let schema = collection.base.child().schema();
        let polymorphic = schema.fields.values().find_map(|field| match field {
            FieldSchema::PolymorphicOneToOne(relation) | FieldSchema::PolymorphicOneToMany(relation) => {
                Some(relation.foreign_collection.clone())
            }
            _ => None,
        });
        if let Some(origin) = polymorphic {
            return Err(ToolkitError::datasource(format!(
                "cannot rename collection '{current}' because it is the target of a polymorphic relation of '{origin}'"
            )));
        }
        collection.renamed.set(new.to_string()).map_err(|_| {
            ToolkitError::datasource(format!("cannot rename a collection twice: {original}->{current}->{new}"))
        })?;

        for sibling in self.decorators() {
            sibling.base.mark_schema_as_dirty();
        }
        debug!(from = current, to = new, "collection renamed");
        Ok(())
    }

    /// Applies every `(current, new)` rename in order.
    ///
    /// # Errors
    ///
    /// Stops at the first rename [`Self::rename_collection`] rejects.
    pub fn rename_collections<'a>(&self, renames: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<()> {
        renames.into_iter().try_for_each(|(current, new)| self.rename_collection(current, new))
    }
}

#[async_trait]
impl Collection for RenamedCollection {
    fn name(&self) -> &str {
        self.renamed.get().map_or_else(|| self.base.name(), String::as_str)
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            for field in schema.fields.values_mut() {
                match field {
                    FieldSchema::ManyToOne(relation) => {
                        relation.foreign_collection = self.exposed_name(&relation.foreign_collection);
                    }
                    FieldSchema::OneToOne(relation) | FieldSchema::OneToMany(relation) => {
                        relation.foreign_collection = self.exposed_name(&relation.foreign_collection);
                    }
                    FieldSchema::PolymorphicOneToOne(relation) | FieldSchema::PolymorphicOneToMany(relation) => {
                        relation.foreign_collection = self.exposed_name(&relation.foreign_collection);
                    }
                    FieldSchema::ManyToMany(relation) => {
                        relation.foreign_collection = self.exposed_name(&relation.foreign_collection);
                        relation.through_collection = self.exposed_name(&relation.through_collection);
                    }
                    FieldSchema::Column(_) | FieldSchema::PolymorphicManyToOne(_) => {}
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
        self.base.child().create(caller, records).await
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
    use quarry_core::{ConditionTree, Operator};
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::decorators::{RelationCollection, RelationDefinition, ScopeCollection};
    use crate::memory::MemoryDatasource;

    fn library() -> Arc<MemoryDatasource> {
        Arc::new(
            MemoryDatasource::new()
                .with_collection(
                    "books",
                    CollectionSchema::new()
                        .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                        .with_field("title", ColumnSchema::new(PrimitiveType::String))
                        .with_field("author_id", ColumnSchema::new(PrimitiveType::Number)),
                    vec![
                        to_record(json!({"id": 1, "title": "Foundation", "author_id": 1})),
                        to_record(json!({"id": 2, "title": "Dune", "author_id": 2})),
                    ],
                )
                .with_collection(
                    "persons",
                    CollectionSchema::new()
                        .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                        .with_field("last_name", ColumnSchema::new(PrimitiveType::String)),
                    vec![
                        to_record(json!({"id": 1, "last_name": "Asimov"})),
                        to_record(json!({"id": 2, "last_name": "Herbert"})),
                    ],
                ),
        )
    }

    fn stack() -> Arc<DatasourceDecorator<RenamedCollection>> {
        let config = Arc::new(EngineConfig::default());
        let relation = DatasourceDecorator::<RelationCollection>::new(library(), config.clone());
        relation
            .collection("books")
            .unwrap()
            .add_relation("author", RelationDefinition::many_to_one("persons", "author_id"))
            .unwrap();
        DatasourceDecorator::<RenamedCollection>::new(relation, config)
    }

    #[tokio::test]
    async fn renamed_collections_answer_to_their_new_name() {
        let renamed = stack();
        renamed.rename_collections([("books", "volumes"), ("persons", "writers")]).unwrap();

        assert_eq!(renamed.collection_names(), vec!["volumes", "writers"]);
        let volumes = renamed.get_collection("volumes").unwrap();
        assert_eq!(volumes.schema().fields["author"].foreign_collection(), Some("writers"));

        let filter = PaginatedFilter::from_tree(ConditionTree::leaf("author:last_name", Operator::Equal, "Herbert"));
        let records = volumes.list(&Caller::default(), filter, Projection::from("title")).await.unwrap();
        assert_eq!(records, vec![to_record(json!({"title": "Dune"}))]);
    }

    #[test]
    fn old_names_point_at_the_new_one() {
        let renamed = stack();
        renamed.rename_collection("books", "volumes").unwrap();
        let err = renamed.collection("books").err().unwrap();
        assert_eq!(err.to_string(), ToolkitError::datasource("collection 'books' has been renamed to 'volumes'").to_string());
    }

    #[test]
    fn conflicting_and_repeated_renames_are_rejected() {
        let renamed = stack();
        assert!(renamed.rename_collection("books", "persons").is_err());
        assert!(renamed.rename_collection("authors", "writers").is_err());

        renamed.rename_collection("books", "volumes").unwrap();
        let twice = renamed.rename_collection("volumes", "tomes").err().unwrap();
        assert!(twice.to_string().contains("books->volumes->tomes"));

        renamed.rename_collection("persons", "persons").unwrap();
        assert_eq!(renamed.collection("persons").unwrap().name(), "persons");
    }

    #[test]
    fn layers_above_follow_the_rename() {
        let renamed = stack();
        let scope = DatasourceDecorator::<ScopeCollection>::new(renamed.clone(), renamed.config().clone());
        renamed.rename_collection("persons", "writers").unwrap();

        let writers = scope.collection("writers").unwrap();
        assert_eq!(writers.name(), "writers");
        assert!(scope.collection("persons").is_err());
        assert_eq!(
            scope.collection("books").unwrap().schema().fields["author"].foreign_collection(),
            Some("writers")
        );
    }
}
