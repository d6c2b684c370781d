//! Checks run on caller input before it is dispatched: field paths, condition
//! trees, record payloads, projections and sorts.

mod condition_tree;
mod field;
mod projection;
mod record;

pub use condition_tree::validate_condition_tree;
pub use field::{validate_field, validate_value};
pub use projection::{validate_projection, validate_sort};
pub use record::validate_record;
