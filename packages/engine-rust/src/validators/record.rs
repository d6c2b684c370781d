use quarry_core::schema::FieldSchema;
use quarry_core::{Record, Result, ToolkitError, Value};

use super::field::validate_field;
use crate::collection::Collection;
use crate::datasource::Datasource;

/// Checks a create/update payload: known fields only, columns well typed,
/// nested to-one records valid against their own collection.
///
/// # Errors
///
/// Returns [`ToolkitError::Schema`] for the first offending field.
pub fn validate_record(datasource: &dyn Datasource, collection: &dyn Collection, record: &Record) -> Result<()> {
    if record.is_empty() {
        return Err(ToolkitError::schema("the record data is empty"));
    }
    let schema = collection.schema();
    for (name, value) in record {
        let field = schema
            .fields
            .get(name)
            .ok_or_else(|| ToolkitError::schema(format!("unknown field \"{name}\"")))?;
        match field {
            FieldSchema::Column(_) => validate_field(datasource, collection, name, std::slice::from_ref(value))?,
            FieldSchema::ManyToOne(_) | FieldSchema::OneToOne(_) => {
                let foreign = datasource.get_collection(field.foreign_collection().unwrap_or_default())?;
                match value {
                    Value::Record(nested) => validate_record(datasource, foreign.as_ref(), nested)?,
                    Value::Null => {}
                    other => {
                        return Err(ToolkitError::schema(format!(
                            "expected a record for relation \"{name}\", got {}",
                            other.display()
                        )))
                    }
                }
            }
            other => {
                return Err(ToolkitError::schema(format!(
                    "unexpected schema type {} while traversing record",
                    other.kind()
                )))
            }
        }
    }
    Ok(())
}
