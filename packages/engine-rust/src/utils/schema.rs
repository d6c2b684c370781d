//! Following relation paths (`author:address:city`) across a datasource.

use quarry_core::condition_tree::ColumnTypeResolver;
use quarry_core::schema::{ColumnType, FieldSchema};
use quarry_core::{Projection, Result, ToolkitError};

use crate::collection::Collection;
use crate::datasource::Datasource;

/// Schema of the field at `path`, following to-one relations.
///
/// # Errors
///
/// Returns [`ToolkitError::Schema`] when a segment is unknown, or when an
/// intermediate segment is not a (non-polymorphic) to-one relation.
pub fn field_schema(datasource: &dyn Datasource, collection: &dyn Collection, path: &str) -> Result<FieldSchema> {
    let schema = collection.schema();
    let (head, rest) = match path.split_once(':') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let Some(field) = schema.fields.get(head) else {
        let kind = if rest.is_some() { "relation" } else { "column" };
        let names: Vec<&str> = schema.fields.keys().map(String::as_str).collect();
        return Err(ToolkitError::schema(format!(
            "{kind} not found {}.{head}, fields are {}",
            collection.name(),
            names.join(",")
        )));
    };
    let Some(rest) = rest else {
        return Ok(field.clone());
    };
    match field {
        FieldSchema::ManyToOne(_) | FieldSchema::OneToOne(_) => {
            let foreign = field.foreign_collection().unwrap_or_default();
            let foreign = datasource.get_collection(foreign)?;
            field_schema(datasource, foreign.as_ref(), rest)
        }
        other => Err(ToolkitError::schema(format!(
            "unexpected field type {}: {}.{head}",
            other.kind(),
            collection.name()
        ))),
    }
}

/// [`ColumnTypeResolver`] that follows relation paths through a datasource.
pub struct FieldResolver<'a> {
    datasource: &'a dyn Datasource,
    collection: &'a dyn Collection,
}

impl<'a> FieldResolver<'a> {
    #[must_use]
    pub fn new(datasource: &'a dyn Datasource, collection: &'a dyn Collection) -> Self {
        Self { datasource, collection }
    }
}

impl ColumnTypeResolver for FieldResolver<'_> {
    fn column_type(&self, path: &str) -> Option<ColumnType> {
        match field_schema(self.datasource, self.collection, path) {
            Ok(FieldSchema::Column(column)) => Some(column.column_type),
            _ => None,
        }
    }
}

/// `projection` plus the primary keys of the collection and of every
/// relation it traverses.
///
/// # Errors
///
/// Fails when the projection names an unknown relation.
pub fn projection_with_pks(
    datasource: &dyn Datasource,
    collection: &dyn Collection,
    projection: &Projection,
) -> Result<Projection> {
    let schema = collection.schema();
    let mut result = projection.clone();
    for key in schema.primary_keys() {
        result.push(key);
    }
    for (relation, sub_projection) in projection.relations() {
        let field = schema.field(&relation)?;
        let Some(foreign) = field.foreign_collection() else {
            continue;
        };
        let foreign = datasource.get_collection(foreign)?;
        let nested = projection_with_pks(datasource, foreign.as_ref(), &sub_projection)?.nest(&relation);
        result.extend(nested);
    }
    Ok(result)
}
