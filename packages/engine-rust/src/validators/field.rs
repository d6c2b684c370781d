use quarry_core::schema::{ColumnSchema, ColumnType, FieldSchema, PrimitiveType};
use quarry_core::{Result, ToolkitError, Value};

use crate::collection::Collection;
use crate::datasource::Datasource;

/// Checks that `path` names a column, possibly behind to-one relations, and
/// that every value in `values` fits it.
///
/// # Errors
///
/// Returns [`ToolkitError::Schema`] for unknown fields, relations used as
/// columns, traversal of to-many relations and ill-typed values.
pub fn validate_field(
    datasource: &dyn Datasource,
    collection: &dyn Collection,
    path: &str,
    values: &[Value],
) -> Result<()> {
    let schema = collection.schema();
    let (head, rest) = match path.split_once(':') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let field = schema
        .fields
        .get(head)
        .ok_or_else(|| ToolkitError::schema(format!("column not found: {}.{head}", collection.name())))?;

    match (field, rest) {
        (FieldSchema::Column(column), None) => values.iter().try_for_each(|value| validate_value(head, column, value)),
        (_, None) => Err(ToolkitError::schema(format!(
            "unexpected field type: {}.{head} (found {} expected Column)",
            collection.name(),
            field.kind()
        ))),
        (FieldSchema::ManyToOne(_) | FieldSchema::OneToOne(_), Some(rest)) => {
            let foreign = datasource.get_collection(field.foreign_collection().unwrap_or_default())?;
            validate_field(datasource, foreign.as_ref(), rest, values)
        }
        (_, Some(_)) => Err(ToolkitError::schema(format!(
            "unexpected field type {}: {}.{head}",
            field.kind(),
            collection.name()
        ))),
    }
}

/// Checks one value against a column's type and enum members. Null always
/// passes.
///
/// # Errors
///
/// Returns [`ToolkitError::Schema`] describing the mismatch.
pub fn validate_value(field: &str, column: &ColumnSchema, value: &Value) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    if !column.column_type.accepts(value) {
        return Err(ToolkitError::schema(format!(
            "wrong type for \"{field}\": {}. Expects {}",
            value.display(),
            describe(&column.column_type)
        )));
    }
    if column.column_type == ColumnType::Primitive(PrimitiveType::Enum) {
        let members = column.enum_values.as_deref().unwrap_or_default();
        if let Some(text) = value.as_str() {
            if !members.iter().any(|member| member == text) {
                return Err(ToolkitError::schema(format!(
                    "the given enum value '{text}' is not listed in [{}]",
                    members.join(", ")
                )));
            }
        }
    }
    Ok(())
}

fn describe(column_type: &ColumnType) -> String {
    match column_type {
        ColumnType::Primitive(primitive) => format!("{primitive:?}"),
        ColumnType::Array(inner) => format!("[{}]", describe(inner)),
        ColumnType::Object(_) => "Object".to_string(),
    }
}
