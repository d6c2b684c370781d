//! The collection contract every backend and every decorator implements.

use std::sync::Arc;

use async_trait::async_trait;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, Filter, PaginatedFilter, Projection, Record, Result,
};

/// Shared handle to a collection.
pub type CollectionRef = Arc<dyn Collection>;

/// A named, schema-described set of records.
///
/// Backends implement the five operations natively; decorators implement them
/// by rewriting their inputs and outputs around a child collection.
/// A filter without condition tree targets every record.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Collection name, unique within its datasource.
    fn name(&self) -> &str;

    /// Current schema. Decorators cache it until marked dirty.
    fn schema(&self) -> Arc<CollectionSchema>;

    /// Monotonic counter bumped whenever this collection or anything below
    /// it changes its schema. Static backends keep the default.
    fn schema_version(&self) -> u64 {
        0
    }

    /// Records matching `filter`, restricted to `projection`.
    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>>;

    /// Inserts records and returns them as stored (generated keys included).
    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>>;

    /// Applies `patch` to every record matching `filter`.
    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()>;

    /// Deletes every record matching `filter`.
    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()>;

    /// Grouped summary of the records matching `filter`.
    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>>;
}
