//! Write customization, as three stacked layers: nested creates at the
//! bottom, nested updates above them and write handlers on top.

mod create_relations;
mod update_relations;
mod write_replace;

pub use create_relations::CreateRelationsCollection;
pub use update_relations::UpdateRelationsCollection;
pub use write_replace::{deep_merge, WriteAction, WriteHandler, WriteReplaceCollection, WriteRequest};
