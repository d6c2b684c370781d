//! Collection decorators and the stack composing them.
//!
//! Each decorator wraps one collection and implements the same
//! [`Collection`](crate::collection::Collection) contract, rewriting inputs
//! on the way down and outputs on the way up. [`DatasourceDecorator`] applies
//! one decorator kind to every collection of a datasource, and
//! [`DecoratorStack`] chains the layers in their fixed order.
//!
//! - Query capabilities: [`empty`], [`lazy_join`], [`operators_emulate`],
//!   [`operators_equivalence`], [`sort_emulate`], [`search`], [`segment`]
//! - Schema shaping: [`computed`], [`relation`], [`publication`], [`rename`],
//!   [`rename_collection`], [`schema_override`], [`binary`]
//! - Writes and callbacks: [`write`], [`validation`], [`hook`], [`overrides`]
//! - Access and observability: [`scope`], [`instrument`]

pub mod base;
pub mod binary;
pub mod computed;
pub mod context;
pub mod datasource_decorator;
pub mod empty;
pub mod hook;
pub mod instrument;
pub mod lazy_join;
pub mod operators_emulate;
pub mod operators_equivalence;
pub mod overrides;
pub mod publication;
pub mod relation;
pub mod rename;
pub mod rename_collection;
pub mod schema_override;
pub mod scope;
pub mod search;
pub mod segment;
pub mod sort_emulate;
pub mod stack;
pub mod validation;
pub mod write;

pub use base::DecoratorBase;
pub use binary::{BinaryCollection, BinaryMode};
pub use computed::{ComputedCollection, ComputedDefinition};
pub use context::{handler, handler_sync, CollectionContext, Handler};
pub use datasource_decorator::{DatasourceDecorator, DecoratorFactory};
pub use empty::EmptyCollection;
pub use hook::{CrudMethod, HookCollection, HookHandler, HookPayload, HookPosition};
pub use instrument::{InstrumentLayer, InstrumentedCollection};
pub use lazy_join::LazyJoinCollection;
pub use operators_emulate::OperatorsEmulateCollection;
pub use operators_equivalence::OperatorsEquivalenceCollection;
pub use overrides::{CreateOverride, DeleteOverride, OverrideCollection, UpdateOverride};
pub use publication::PublicationCollection;
pub use relation::{RelationCollection, RelationDefinition};
pub use rename::RenameCollection;
pub use rename_collection::RenamedCollection;
pub use schema_override::{SchemaOverride, SchemaOverrideCollection};
pub use scope::ScopeCollection;
pub use search::{SearchCollection, SearchHandler, SearchRequest};
pub use segment::{SegmentCollection, SegmentHandler};
pub use sort_emulate::SortEmulateCollection;
pub use stack::DecoratorStack;
pub use validation::ValidationCollection;
pub use write::{
    CreateRelationsCollection, UpdateRelationsCollection, WriteAction, WriteHandler, WriteReplaceCollection,
    WriteRequest,
};
