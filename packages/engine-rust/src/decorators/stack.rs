//! The decorator layers, in order, over one datasource.

use std::sync::Arc;

use quarry_core::Result;
use tracing::debug;

use super::{
    BinaryCollection, ComputedCollection, ComputedDefinition, CreateRelationsCollection, DatasourceDecorator,
    EmptyCollection, HookCollection, InstrumentedCollection, LazyJoinCollection, OperatorsEmulateCollection,
    OperatorsEquivalenceCollection, OverrideCollection, PublicationCollection, RelationCollection, RenameCollection,
    RenamedCollection, SchemaOverrideCollection, ScopeCollection, SearchCollection, SegmentCollection,
    SortEmulateCollection, UpdateRelationsCollection, ValidationCollection, WriteReplaceCollection,
};
use crate::config::EngineConfig;
use crate::datasource::DatasourceRef;
use crate::validators::validate_field;

type Layer<C> = Arc<DatasourceDecorator<C>>;

/// Every layer is public so customizations can be registered on the stage
/// that owns them; [`DecoratorStack::datasource`] is what callers query.
pub struct DecoratorStack {
    /// Short-circuits filters that cannot match.
    pub empty: Layer<EmptyCollection>,

    // Computed, relation, computed sandwich: emulated relations may read
    // computed fields and computed fields may read relations.
    pub early_computed: Layer<ComputedCollection>,
    pub early_op_emulate: Layer<OperatorsEmulateCollection>,
    pub early_op_equivalence: Layer<OperatorsEquivalenceCollection>,
    pub relation: Layer<RelationCollection>,
    pub late_computed: Layer<ComputedCollection>,
    pub late_op_emulate: Layer<OperatorsEmulateCollection>,
    pub late_op_equivalence: Layer<OperatorsEquivalenceCollection>,
    pub lazy_join: Layer<LazyJoinCollection>,

    // Need every field, emulated ones included.
    pub search: Layer<SearchCollection>,
    pub segment: Layer<SegmentCollection>,
    pub sort_emulate: Layer<SortEmulateCollection>,
    pub schema: Layer<SchemaOverrideCollection>,
    pub create_relations: Layer<CreateRelationsCollection>,
    pub update_relations: Layer<UpdateRelationsCollection>,
    pub write: Layer<WriteReplaceCollection>,
    pub overrides: Layer<OverrideCollection>,
    pub hook: Layer<HookCollection>,
    pub validation: Layer<ValidationCollection>,
    pub binary: Layer<BinaryCollection>,

    // Renaming stays last so customer code sees consistent names.
    pub publication: Layer<PublicationCollection>,
    pub rename: Layer<RenameCollection>,
    pub rename_collection: Layer<RenamedCollection>,

    pub scope: Layer<ScopeCollection>,
    pub instrument: Layer<InstrumentedCollection>,

    config: Arc<EngineConfig>,
}

impl DecoratorStack {
    #[must_use]
    pub fn new(datasource: DatasourceRef, config: EngineConfig) -> Self {
        let config = Arc::new(config);

        let empty = DatasourceDecorator::<EmptyCollection>::new(datasource, config.clone());
        let early_computed = DatasourceDecorator::<ComputedCollection>::new(empty.clone(), config.clone());
        let early_op_emulate = DatasourceDecorator::<OperatorsEmulateCollection>::new(early_computed.clone(), config.clone());
        let early_op_equivalence =
            DatasourceDecorator::<OperatorsEquivalenceCollection>::new(early_op_emulate.clone(), config.clone());
        let relation = DatasourceDecorator::<RelationCollection>::new(early_op_equivalence.clone(), config.clone());
        let late_computed = DatasourceDecorator::<ComputedCollection>::new(relation.clone(), config.clone());
        let late_op_emulate = DatasourceDecorator::<OperatorsEmulateCollection>::new(late_computed.clone(), config.clone());
        let late_op_equivalence =
            DatasourceDecorator::<OperatorsEquivalenceCollection>::new(late_op_emulate.clone(), config.clone());
        let lazy_join = DatasourceDecorator::<LazyJoinCollection>::new(late_op_equivalence.clone(), config.clone());

        let search = DatasourceDecorator::<SearchCollection>::new(lazy_join.clone(), config.clone());
        let segment = DatasourceDecorator::<SegmentCollection>::new(search.clone(), config.clone());
        let sort_emulate = DatasourceDecorator::<SortEmulateCollection>::new(segment.clone(), config.clone());
        let schema = DatasourceDecorator::<SchemaOverrideCollection>::new(sort_emulate.clone(), config.clone());
        let create_relations = DatasourceDecorator::<CreateRelationsCollection>::new(schema.clone(), config.clone());
        let update_relations =
            DatasourceDecorator::<UpdateRelationsCollection>::new(create_relations.clone(), config.clone());
        let write = DatasourceDecorator::<WriteReplaceCollection>::new(update_relations.clone(), config.clone());
        let overrides = DatasourceDecorator::<OverrideCollection>::new(write.clone(), config.clone());
        let hook = DatasourceDecorator::<HookCollection>::new(overrides.clone(), config.clone());
        let validation = DatasourceDecorator::<ValidationCollection>::new(hook.clone(), config.clone());
        let binary = DatasourceDecorator::<BinaryCollection>::new(validation.clone(), config.clone());

        let publication = DatasourceDecorator::<PublicationCollection>::new(binary.clone(), config.clone());
        let rename = DatasourceDecorator::<RenameCollection>::new(publication.clone(), config.clone());
        let rename_collection = DatasourceDecorator::<RenamedCollection>::new(rename.clone(), config.clone());

        let scope = DatasourceDecorator::<ScopeCollection>::new(rename_collection.clone(), config.clone());
        let instrument = DatasourceDecorator::<InstrumentedCollection>::new(scope.clone(), config.clone());

        Self {
            empty,
            early_computed,
            early_op_emulate,
            early_op_equivalence,
            relation,
            late_computed,
            late_op_emulate,
            late_op_equivalence,
            lazy_join,
            search,
            segment,
            sort_emulate,
            schema,
            create_relations,
            update_relations,
            write,
            overrides,
            hook,
            validation,
            binary,
            publication,
            rename,
            rename_collection,
            scope,
            instrument,
            config,
        }
    }

    /// The fully decorated datasource.
    #[must_use]
    pub fn datasource(&self) -> DatasourceRef {
        self.instrument.clone()
    }

    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Registers a computed field below the relation layer when every
    /// dependency already exists there, above it otherwise.
    ///
    /// # Errors
    ///
    /// Fails when a dependency resolves in neither layer.
    pub fn add_computed_field(&self, collection: &str, name: &str, definition: ComputedDefinition) -> Result<()> {
        let early = self.early_computed.collection(collection)?;
        let resolves_early = definition
            .dependencies
            .iter()
            .all(|dependency| validate_field(self.early_computed.as_ref(), early.as_ref(), dependency, &[]).is_ok());
        if resolves_early {
            debug!(collection, field = name, "computed field registered early");
            early.register_computed(name, definition)
        } else {
            debug!(collection, field = name, "computed field registered late");
            self.late_computed.collection(collection)?.register_computed(name, definition)
        }
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::schema::{ColumnSchema, PrimitiveType};
    use quarry_core::value::{field_value, to_record};
    use quarry_core::{
        Caller, CollectionSchema, ConditionTree, Filter, Operator, PaginatedFilter, Projection, Sort, SortClause, Value,
    };
    use serde_json::json;

    use super::*;
    use crate::collection::Collection;
    use crate::datasource::Datasource;
    use crate::decorators::{handler, handler_sync, CollectionContext, RelationDefinition};
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
                        .with_field("first_name", ColumnSchema::new(PrimitiveType::String))
                        .with_field("last_name", ColumnSchema::new(PrimitiveType::String)),
                    vec![
                        to_record(json!({"id": 1, "first_name": "Isaac", "last_name": "Asimov"})),
                        to_record(json!({"id": 2, "first_name": "Frank", "last_name": "Herbert"})),
                    ],
                ),
        )
    }

    fn concat(paths: &'static [&'static str]) -> ComputedDefinition {
        ComputedDefinition::new(
            PrimitiveType::String,
            paths.iter().copied().collect::<Projection>(),
            handler(move |records: Vec<quarry_core::Record>, _context| async move {
                Ok(records
                    .iter()
                    .map(|record| {
                        let parts: Vec<String> = paths.iter().map(|path| field_value(record, path).display()).collect();
                        Value::from(parts.join(" "))
                    })
                    .collect())
            }),
        )
    }

    fn customized() -> DecoratorStack {
        let stack = DecoratorStack::new(library(), EngineConfig::default());
        stack
            .relation
            .collection("books")
            .unwrap()
            .add_relation("author", RelationDefinition::many_to_one("persons", "author_id"))
            .unwrap();
        stack.add_computed_field("persons", "full_name", concat(&["first_name", "last_name"])).unwrap();
        stack.add_computed_field("books", "byline", concat(&["title", "author:full_name"])).unwrap();
        stack
    }

    #[test]
    fn computed_fields_land_on_the_layer_their_dependencies_need() {
        let stack = customized();
        assert!(stack.early_computed.collection("persons").unwrap().is_computed("full_name"));
        assert!(!stack.early_computed.collection("books").unwrap().is_computed("byline"));
        assert!(stack.late_computed.collection("books").unwrap().is_computed("byline"));

        let books = stack.datasource().get_collection("books").unwrap();
        let schema = books.schema();
        assert!(schema.fields.contains_key("author"));
        assert!(schema.column("byline").unwrap().is_read_only);
    }

    #[tokio::test]
    async fn emulated_relation_and_computed_fields_compose() {
        let stack = customized();
        stack.rename.collection("books").unwrap().rename_field("byline", "credits").unwrap();

        let books = stack.datasource().get_collection("books").unwrap();
        let filter = PaginatedFilter::from_tree(ConditionTree::leaf("author:last_name", Operator::Equal, "Herbert"))
            .with_sort(Some(Sort::new(vec![SortClause::asc("id")])));
        let records = books.list(&Caller::default(), filter, Projection::from("id,credits")).await.unwrap();
        assert_eq!(records, vec![to_record(json!({"id": 2, "credits": "Dune Frank Herbert"}))]);
    }

    #[tokio::test]
    async fn segments_search_and_collection_renames_compose() {
        let stack = customized();
        stack.segment.collection("books").unwrap().add_segment(
            "by_herbert",
            handler_sync(|(), _context: &CollectionContext| {
                Ok(ConditionTree::leaf("author:last_name", Operator::Equal, "Herbert"))
            }),
        );
        stack.rename_collection.rename_collection("books", "volumes").unwrap();

        let volumes = stack.datasource().get_collection("volumes").unwrap();
        let schema = volumes.schema();
        assert!(schema.searchable);
        assert_eq!(schema.segments, vec!["by_herbert".to_string()]);
        assert!(stack.datasource().get_collection("books").is_err());

        let caller = Caller::default();
        let segmented = PaginatedFilter::from_base_filter(Filter::new().with_segment("by_herbert"));
        let records = volumes.list(&caller, segmented, Projection::from("title")).await.unwrap();
        assert_eq!(records, vec![to_record(json!({"title": "Dune"}))]);

        let searched = PaginatedFilter::from_base_filter(Filter::new().with_search("Asimov", true));
        let records = volumes.list(&caller, searched, Projection::from("title")).await.unwrap();
        assert_eq!(records, vec![to_record(json!({"title": "Foundation"}))]);
    }

    #[tokio::test]
    async fn nested_writes_go_through_the_whole_stack() {
        let memory = library();
        let stack = DecoratorStack::new(memory.clone(), EngineConfig::default());
        stack
            .relation
            .collection("books")
            .unwrap()
            .add_relation("author", RelationDefinition::many_to_one("persons", "author_id"))
            .unwrap();

        let books = stack.datasource().get_collection("books").unwrap();
        let caller = Caller::default();
        books
            .create(&caller, vec![to_record(json!({"title": "Emma", "author": {"first_name": "Jane", "last_name": "Austen"}}))])
            .await
            .unwrap();

        let created = books
            .list(
                &caller,
                PaginatedFilter::from_tree(ConditionTree::leaf("title", Operator::Equal, "Emma")),
                Projection::from("title,author:last_name"),
            )
            .await
            .unwrap();
        assert_eq!(created, vec![to_record(json!({"title": "Emma", "author": {"last_name": "Austen"}}))]);

        books.delete(&caller, Filter::from_tree(ConditionTree::leaf("id", Operator::In, Vec::<Value>::new()))).await.unwrap();
        assert_eq!(memory.table("books").unwrap().len(), 3);
    }
}
