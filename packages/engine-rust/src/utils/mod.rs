//! Schema navigation and relation helpers shared by backends and decorators.

pub mod relations;
pub mod schema;

pub use relations::{
    aggregate_relation, get_inverse_relation, get_value, list_relation, make_foreign_filter, make_through_filter,
};
pub use schema::{field_schema, projection_with_pks, FieldResolver};
