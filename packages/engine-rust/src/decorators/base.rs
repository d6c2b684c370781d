//! State shared by every collection decorator: the child collection, a
//! handle on the enclosing layer, and the cached refined schema.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use quarry_core::{Caller, CollectionSchema, Result, ToolkitError};
use tracing::trace;

use super::context::CollectionContext;
use super::datasource_decorator::{DatasourceDecorator, DecoratorFactory};
use crate::collection::CollectionRef;
use crate::config::EngineConfig;
use crate::datasource::DatasourceRef;

struct CachedSchema {
    version: u64,
    schema: Arc<CollectionSchema>,
}

/// Child collection plus schema cache.
///
/// The cache is keyed by [`DecoratorBase::schema_version`]: this level's own
/// dirty counter plus the child's version. Any `mark_schema_as_dirty` below
/// changes the sum, so every decorator above rebuilds lazily on its next
/// schema read.
pub struct DecoratorBase<C> {
    child: CollectionRef,
    datasource: Weak<DatasourceDecorator<C>>,
    version: AtomicU64,
    cache: ArcSwapOption<CachedSchema>,
}

impl<C: DecoratorFactory> DecoratorBase<C> {
    #[must_use]
    pub fn new(child: CollectionRef, datasource: Weak<DatasourceDecorator<C>>) -> Self {
        Self {
            child,
            datasource,
            version: AtomicU64::new(0),
            cache: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn child(&self) -> &CollectionRef {
        &self.child
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.child.name()
    }

    /// The enclosing layer.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Datasource`] once the layer has been dropped.
    pub fn datasource(&self) -> Result<Arc<DatasourceDecorator<C>>> {
        self.datasource
            .upgrade()
            .ok_or_else(|| ToolkitError::datasource(format!("datasource of '{}' was dropped", self.name())))
    }

    /// The enclosing layer as a plain datasource.
    ///
    /// # Errors
    ///
    /// See [`DecoratorBase::datasource`].
    pub fn datasource_ref(&self) -> Result<DatasourceRef> {
        self.datasource().map(|layer| layer as DatasourceRef)
    }

    /// Sibling decorator of the same layer.
    ///
    /// # Errors
    ///
    /// Fails for unknown collections or once the layer has been dropped.
    pub fn collection(&self, name: &str) -> Result<Arc<C>> {
        self.datasource()?.collection(name)
    }

    /// Configuration of the enclosing layer, or defaults once it is gone.
    #[must_use]
    pub fn config(&self) -> Arc<EngineConfig> {
        self.datasource
            .upgrade()
            .map_or_else(|| Arc::new(EngineConfig::default()), |layer| layer.config().clone())
    }

    /// Context handed to customer handlers registered on this decorator.
    ///
    /// # Errors
    ///
    /// See [`DecoratorBase::datasource`].
    pub fn context(&self, caller: &Caller) -> Result<CollectionContext> {
        Ok(CollectionContext::new(caller.clone(), self.datasource_ref()?, self.name()))
    }

    /// Context bound to the layer below, for handlers that replace or wrap
    /// an operation and must reach the undecorated collection.
    ///
    /// # Errors
    ///
    /// See [`DecoratorBase::datasource`].
    pub fn child_context(&self, caller: &Caller) -> Result<CollectionContext> {
        Ok(CollectionContext::new(caller.clone(), self.datasource()?.child().clone(), self.name()))
    }

    #[must_use]
    pub fn schema_version(&self) -> u64 {
        self.version.load(Ordering::Acquire) + self.child.schema_version()
    }

    /// Invalidates the cached schema of this level and of every level above.
    pub fn mark_schema_as_dirty(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Refined schema, rebuilt with `refine` only when the version moved.
    pub fn schema_with(&self, refine: impl FnOnce(&CollectionSchema) -> CollectionSchema) -> Arc<CollectionSchema> {
        let version = self.schema_version();
        if let Some(cached) = self.cache.load_full() {
            if cached.version == version {
                return cached.schema.clone();
            }
        }
        let schema = Arc::new(refine(&self.child.schema()));
        trace!(collection = self.name(), version, "schema rebuilt");
        self.cache.store(Some(Arc::new(CachedSchema { version, schema: schema.clone() })));
        schema
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use quarry_core::schema::{ColumnSchema, PrimitiveType};
    use quarry_core::{
        AggregateResult, Aggregation, Filter, PaginatedFilter, Projection, Record,
    };

    use super::*;
    use crate::collection::Collection;
    use crate::datasource::Datasource;
    use crate::memory::MemoryDatasource;

    /// Decorator counting how many times it refines its schema.
    struct Counting {
        base: DecoratorBase<Counting>,
        refinements: AtomicUsize,
    }

    impl DecoratorFactory for Counting {
        fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
            Self { base: DecoratorBase::new(child, datasource), refinements: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Collection for Counting {
        fn name(&self) -> &str {
            self.base.name()
        }

        fn schema(&self) -> Arc<CollectionSchema> {
            self.base.schema_with(|schema| {
                self.refinements.fetch_add(1, Ordering::SeqCst);
                schema.clone()
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

    fn stack() -> (Arc<DatasourceDecorator<Counting>>, Arc<DatasourceDecorator<Counting>>) {
        let memory = MemoryDatasource::new().with_collection(
            "books",
            CollectionSchema::new().with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key()),
            Vec::new(),
        );
        let config = Arc::new(EngineConfig::default());
        let lower = DatasourceDecorator::<Counting>::new(Arc::new(memory), config.clone());
        let upper = DatasourceDecorator::<Counting>::new(lower.clone(), config);
        (lower, upper)
    }

    #[test]
    fn schema_is_cached_until_marked_dirty() {
        let (lower, upper) = stack();
        let top = upper.collection("books").unwrap();
        let bottom = lower.collection("books").unwrap();

        top.schema();
        top.schema();
        assert_eq!(top.refinements.load(Ordering::SeqCst), 1);
        assert_eq!(bottom.refinements.load(Ordering::SeqCst), 1);

        bottom.base.mark_schema_as_dirty();
        top.schema();
        assert_eq!(top.refinements.load(Ordering::SeqCst), 2);
        assert_eq!(bottom.refinements.load(Ordering::SeqCst), 2);

        top.base.mark_schema_as_dirty();
        top.schema();
        assert_eq!(top.refinements.load(Ordering::SeqCst), 3);
        assert_eq!(bottom.refinements.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn siblings_are_reachable_through_the_layer() {
        let (_lower, upper) = stack();
        let books = upper.collection("books").unwrap();
        assert_eq!(books.base.collection("books").unwrap().name(), "books");
        assert!(books.base.collection("authors").is_err());
        assert_eq!(upper.collection_names(), vec!["books"]);
    }
}
