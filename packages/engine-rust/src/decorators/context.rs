use std::sync::Arc;

use futures_util::future::BoxFuture;
use quarry_core::{Caller, Result};

use crate::collection::CollectionRef;
use crate::datasource::DatasourceRef;

/// What a customer handler sees of the engine: the caller, and the layer
/// the handler was registered on.
#[derive(Clone)]
pub struct CollectionContext {
    pub caller: Caller,
    pub datasource: DatasourceRef,
    collection_name: String,
}

impl CollectionContext {
    #[must_use]
    pub fn new(caller: Caller, datasource: DatasourceRef, collection_name: impl Into<String>) -> Self {
        Self { caller, datasource, collection_name: collection_name.into() }
    }

    #[must_use]
    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    /// The collection the handler is attached to, as seen from its layer.
    ///
    /// # Errors
    ///
    /// Fails when the collection is no longer part of the layer.
    pub fn collection(&self) -> Result<CollectionRef> {
        self.datasource.get_collection(&self.collection_name)
    }
}

impl std::fmt::Debug for CollectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionContext")
            .field("caller", &self.caller.id)
            .field("collection", &self.collection_name)
            .finish_non_exhaustive()
    }
}

/// Async customer callback: `(input, context) -> output`.
pub type Handler<I, O> = Arc<dyn Fn(I, CollectionContext) -> BoxFuture<'static, Result<O>> + Send + Sync>;

/// Wraps an async closure into a [`Handler`].
pub fn handler<I, O, F, Fut>(f: F) -> Handler<I, O>
where
    F: Fn(I, CollectionContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<O>> + Send + 'static,
{
    Arc::new(move |input, context| Box::pin(f(input, context)))
}

/// Wraps a synchronous closure into a [`Handler`]; it runs when the handler
/// is called and its result is returned as a ready future.
pub fn handler_sync<I, O, F>(f: F) -> Handler<I, O>
where
    F: Fn(I, &CollectionContext) -> Result<O> + Send + Sync + 'static,
    O: Send + 'static,
{
    Arc::new(move |input, context| Box::pin(futures_util::future::ready(f(input, &context))))
}
