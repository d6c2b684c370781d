//! Quarry Core: records, collection schemas, condition trees, projections,
//! filters and aggregations.
//!
//! Everything here is synchronous and backend-agnostic. The async
//! collection contract and the decorators built on top of these types live
//! in `quarry-engine`.

pub mod aggregation;
pub mod caller;
pub mod clock;
pub mod condition_tree;
pub mod context_variables;
pub mod error;
pub mod filter;
pub mod page;
pub mod projection;
pub mod schema;
pub mod sort;
pub mod value;

pub use aggregation::{AggregateOperation, AggregateResult, Aggregation, AggregationGroup, DateOperation};
pub use caller::Caller;
pub use clock::{Clock, ClockSource, FixedClock, SystemClock, TimeContext};
pub use condition_tree::{Aggregator, ConditionTree, ConditionTreeBranch, ConditionTreeLeaf};
pub use context_variables::ContextVariables;
pub use error::{CycleKind, Result, ToolkitError};
pub use filter::{Filter, PaginatedFilter};
pub use page::Page;
pub use projection::Projection;
pub use schema::{CollectionSchema, ColumnSchema, ColumnType, FieldSchema, Operator, PrimitiveType};
pub use sort::{Sort, SortClause};
pub use value::{Record, Value};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
