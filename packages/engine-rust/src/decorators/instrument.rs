//! Per-operation tracing spans.
//!
//! Collection calls are reified as [`CollectionOperation`]s and driven
//! through a tower stack, so [`InstrumentLayer`] composes with any other
//! tower middleware.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, Filter, PaginatedFilter, Projection, Record, Result,
    ToolkitError,
};
use tower::{Layer, Service, ServiceExt};
use tracing::{info_span, Instrument};

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// One collection call, owned so it can cross a service boundary.
#[derive(Debug, Clone)]
pub enum CollectionOperation {
    List { caller: Caller, filter: PaginatedFilter, projection: Projection },
    Create { caller: Caller, records: Vec<Record> },
    Update { caller: Caller, filter: Filter, patch: Record },
    Delete { caller: Caller, filter: Filter },
    Aggregate { caller: Caller, filter: Filter, aggregation: Aggregation, limit: Option<usize> },
}

impl CollectionOperation {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::List { .. } => "list",
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Aggregate { .. } => "aggregate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionResponse {
    Records(Vec<Record>),
    Rows(Vec<AggregateResult>),
    Done,
}

type BoxedResponse = Pin<Box<dyn Future<Output = Result<CollectionResponse>> + Send>>;

fn unexpected(operation: &str) -> ToolkitError {
    ToolkitError::datasource(format!("unexpected response to {operation}"))
}

// ---------------------------------------------------------------------------
// CollectionService
// ---------------------------------------------------------------------------

/// Innermost service: runs the operation against a collection.
#[derive(Clone)]
pub struct CollectionService {
    collection: CollectionRef,
}

impl CollectionService {
    #[must_use]
    pub fn new(collection: CollectionRef) -> Self {
        Self { collection }
    }
}

impl Service<CollectionOperation> for CollectionService {
    type Response = CollectionResponse;
    type Error = ToolkitError;
    type Future = BoxedResponse;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, operation: CollectionOperation) -> Self::Future {
        let collection = self.collection.clone();
        Box::pin(async move {
            match operation {
                CollectionOperation::List { caller, filter, projection } => {
                    collection.list(&caller, filter, projection).await.map(CollectionResponse::Records)
                }
                CollectionOperation::Create { caller, records } => {
                    collection.create(&caller, records).await.map(CollectionResponse::Records)
                }
                CollectionOperation::Update { caller, filter, patch } => {
                    collection.update(&caller, filter, patch).await.map(|()| CollectionResponse::Done)
                }
                CollectionOperation::Delete { caller, filter } => {
                    collection.delete(&caller, filter).await.map(|()| CollectionResponse::Done)
                }
                CollectionOperation::Aggregate { caller, filter, aggregation, limit } => collection
                    .aggregate(&caller, filter, aggregation, limit)
                    .await
                    .map(CollectionResponse::Rows),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// InstrumentLayer
// ---------------------------------------------------------------------------

/// Tower layer wrapping each operation in an `info_span!` that records its
/// duration and outcome.
#[derive(Debug, Clone)]
pub struct InstrumentLayer {
    collection: String,
}

impl InstrumentLayer {
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self { collection: collection.into() }
    }
}

impl<S> Layer<S> for InstrumentLayer {
    type Service = InstrumentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentService { inner, collection: self.collection.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentService<S> {
    inner: S,
    collection: String,
}

impl<S> Service<CollectionOperation> for InstrumentService<S>
where
    S: Service<CollectionOperation, Response = CollectionResponse, Error = ToolkitError> + Send,
    S::Future: Send + 'static,
{
    type Response = CollectionResponse;
    type Error = ToolkitError;
    type Future = BoxedResponse;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, operation: CollectionOperation) -> Self::Future {
        let kind = operation.kind();
        let span = info_span!(
            "collection_operation",
            collection = %self.collection,
            operation = kind,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let future = self.inner.call(operation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = future.await;
                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let outcome = if result.is_ok() { "ok" } else { "error" };

                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);
                tracing::info!(operation = kind, duration_ms, outcome, "operation complete");
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// InstrumentedCollection
// ---------------------------------------------------------------------------

/// Outermost decorator: routes every call through [`InstrumentLayer`] when
/// `EngineConfig::instrument` is set.
pub struct InstrumentedCollection {
    base: DecoratorBase<InstrumentedCollection>,
}

impl DecoratorFactory for InstrumentedCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource) }
    }
}

impl InstrumentedCollection {
    async fn dispatch(&self, operation: CollectionOperation) -> Result<CollectionResponse> {
        let inner = CollectionService::new(self.base.child().clone());
        if self.base.config().instrument {
            InstrumentLayer::new(self.name()).layer(inner).oneshot(operation).await
        } else {
            inner.oneshot(operation).await
        }
    }
}

#[async_trait]
impl Collection for InstrumentedCollection {
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
        match self.dispatch(CollectionOperation::List { caller: caller.clone(), filter, projection }).await? {
            CollectionResponse::Records(records) => Ok(records),
            _ => Err(unexpected("list")),
        }
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        match self.dispatch(CollectionOperation::Create { caller: caller.clone(), records }).await? {
            CollectionResponse::Records(records) => Ok(records),
            _ => Err(unexpected("create")),
        }
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        self.dispatch(CollectionOperation::Update { caller: caller.clone(), filter, patch }).await?;
        Ok(())
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        self.dispatch(CollectionOperation::Delete { caller: caller.clone(), filter }).await?;
        Ok(())
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let operation = CollectionOperation::Aggregate { caller: caller.clone(), filter, aggregation, limit };
        match self.dispatch(operation).await? {
            CollectionResponse::Rows(rows) => Ok(rows),
            _ => Err(unexpected("aggregate")),
        }
    }
}
