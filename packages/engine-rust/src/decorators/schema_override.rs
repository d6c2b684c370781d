//! Overrides of collection-level schema flags, such as turning counting off
//! for a backend where it is expensive.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, Filter, PaginatedFilter, Projection, Record, Result,
};

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};

/// Collection attributes to force; `None` keeps the child's value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaOverride {
    pub countable: Option<bool>,
    pub searchable: Option<bool>,
    pub segments: Option<Vec<String>>,
}

pub struct SchemaOverrideCollection {
    base: DecoratorBase<SchemaOverrideCollection>,
    overrides: RwLock<SchemaOverride>,
}

impl DecoratorFactory for SchemaOverrideCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), overrides: RwLock::new(SchemaOverride::default()) }
    }
}

impl SchemaOverrideCollection {
    /// Merges `overrides` into the ones already registered.
    pub fn override_schema(&self, overrides: SchemaOverride) {
        {
            let mut current = self.overrides.write();
            if overrides.countable.is_some() {
                current.countable = overrides.countable;
            }
            if overrides.searchable.is_some() {
                current.searchable = overrides.searchable;
            }
            if overrides.segments.is_some() {
                current.segments = overrides.segments;
            }
        }
        self.base.mark_schema_as_dirty();
    }

    pub fn disable_count(&self) {
        self.override_schema(SchemaOverride { countable: Some(false), ..SchemaOverride::default() });
    }
}

#[async_trait]
impl Collection for SchemaOverrideCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let overrides = self.overrides.read();
            let mut schema = child.clone();
            if let Some(countable) = overrides.countable {
                schema.countable = countable;
            }
            if let Some(searchable) = overrides.searchable {
                schema.searchable = searchable;
            }
            if let Some(segments) = &overrides.segments {
                schema.segments.clone_from(segments);
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

    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::MemoryDatasource;

    fn layer() -> Arc<DatasourceDecorator<SchemaOverrideCollection>> {
        let mut schema =
            CollectionSchema::new().with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key());
        schema.countable = true;
        schema.segments = vec!["recent".to_string()];
        let memory = MemoryDatasource::new().with_collection("books", schema, Vec::new());
        DatasourceDecorator::<SchemaOverrideCollection>::new(Arc::new(memory), Arc::new(EngineConfig::default()))
    }

    #[test]
    fn overrides_merge_and_leave_other_flags_alone() {
        let books = layer().collection("books").unwrap();
        books.disable_count();
        books.override_schema(SchemaOverride { searchable: Some(true), ..SchemaOverride::default() });

        let schema = books.schema();
        assert!(!schema.countable);
        assert!(schema.searchable);
        assert_eq!(schema.segments, vec!["recent".to_string()]);
        assert!(schema.fields.contains_key("id"));
    }

    #[test]
    fn overriding_segments_replaces_the_list() {
        let books = layer().collection("books").unwrap();
        books.override_schema(SchemaOverride { segments: Some(Vec::new()), ..SchemaOverride::default() });
        assert!(books.schema().segments.is_empty());
        assert!(books.schema().countable);
    }
}
