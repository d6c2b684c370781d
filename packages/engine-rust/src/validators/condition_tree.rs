use quarry_core::schema::{ColumnSchema, ColumnType, FieldSchema, PrimitiveType};
use quarry_core::{ConditionTree, ConditionTreeLeaf, Operator, Result, ToolkitError, Value};

use super::field::validate_value;
use crate::collection::Collection;
use crate::datasource::Datasource;
use crate::utils::field_schema;

/// Checks every leaf of `tree` against the collection schema: the field must
/// be a column supporting the operator, and the value must have the shape the
/// operator expects.
///
/// # Errors
///
/// Returns [`ToolkitError::ConditionTree`] for the first invalid leaf, or
/// [`ToolkitError::Schema`] when a field path does not resolve.
pub fn validate_condition_tree(
    datasource: &dyn Datasource,
    collection: &dyn Collection,
    tree: &ConditionTree,
) -> Result<()> {
    for leaf in tree.leaves() {
        let FieldSchema::Column(column) = field_schema(datasource, collection, &leaf.field)? else {
            return Err(ToolkitError::condition_tree(format!(
                "unable to apply condition on relation field '{}'",
                leaf.field
            )));
        };
        validate_leaf(leaf, &column)?;
    }
    Ok(())
}

fn validate_leaf(leaf: &ConditionTreeLeaf, column: &ColumnSchema) -> Result<()> {
    if column.filter_operators.is_empty() {
        return Err(ToolkitError::condition_tree(format!(
            "the given operator '{}' is not supported by the column '{}': the column is not filterable",
            leaf.operator, leaf.field
        )));
    }
    if !column.filter_operators.contains(&leaf.operator) {
        let allowed: Vec<&str> = column.filter_operators.iter().map(|operator| operator.as_str()).collect();
        return Err(ToolkitError::condition_tree(format!(
            "the given operator '{}' is not supported by the column '{}', the allowed operators are [{}]",
            leaf.operator,
            leaf.field,
            allowed.join(", ")
        )));
    }
    if let Some(primitive) = column.column_type.as_primitive() {
        if !Operator::allowed_for(primitive).contains(&leaf.operator) {
            return Err(ToolkitError::condition_tree(format!(
                "the given operator '{}' is not allowed with the column type {primitive:?}",
                leaf.operator
            )));
        }
    }
    validate_value_for_operator(leaf, column)
}

fn validate_value_for_operator(leaf: &ConditionTreeLeaf, column: &ColumnSchema) -> Result<()> {
    let operator = leaf.operator;
    let unexpected = |expected: &str| {
        Err(ToolkitError::condition_tree(format!(
            "the given value '{}' has an unexpected value for the operator '{operator}' on '{}': {expected}",
            leaf.value.display(),
            leaf.field
        )))
    };

    if operator.is_valueless() {
        return if leaf.value.is_null() { Ok(()) } else { unexpected("the value must be empty") };
    }
    if operator.takes_number() {
        return if leaf.value.is_number() { Ok(()) } else { unexpected("expected a number") };
    }
    if operator == Operator::Match {
        return if leaf.value.as_str().is_some() { Ok(()) } else { unexpected("expected a regular expression") };
    }
    if operator.takes_list() {
        // Array columns take whole arrays as list members.
        if matches!(column.column_type, ColumnType::Array(_)) {
            return Ok(());
        }
        return leaf.values().iter().try_for_each(|value| validate_value(&leaf.field, column, value));
    }
    if column.column_type == ColumnType::Primitive(PrimitiveType::String) || leaf.value.is_null() {
        return validate_value(&leaf.field, column, &leaf.value);
    }
    if matches!(operator, Operator::Like | Operator::StartsWith | Operator::EndsWith | Operator::Contains | Operator::NotContains)
    {
        return match &leaf.value {
            Value::String(_) => Ok(()),
            _ => unexpected("expected a string"),
        };
    }
    validate_value(&leaf.field, column, &leaf.value)
}

#[cfg(test)]
mod tests {
    use quarry_core::CollectionSchema;

    use super::*;
    use crate::memory::MemoryDatasource;

    fn books() -> MemoryDatasource {
        MemoryDatasource::new().with_collection(
            "books",
            CollectionSchema::new()
                .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                .with_field("title", ColumnSchema::new(PrimitiveType::String))
                .with_field("published", ColumnSchema::new(PrimitiveType::Date)),
            Vec::new(),
        )
    }

    fn check(tree: ConditionTree) -> Result<()> {
        let datasource = books();
        let collection = datasource.get_collection("books")?;
        validate_condition_tree(&datasource, collection.as_ref(), &tree)
    }

    #[test]
    fn accepts_well_formed_trees() {
        check(ConditionTree::and(vec![
            ConditionTree::leaf("title", Operator::Contains, "Found"),
            ConditionTree::leaf("id", Operator::In, Value::Array(vec![Value::from(1), Value::from(2)])),
            ConditionTree::leaf("title", Operator::Present, Value::Null),
        ]))
        .unwrap();
    }

    #[test]
    fn rejects_unsupported_operators_and_bad_values() {
        assert!(check(ConditionTree::leaf("id", Operator::Contains, 1)).is_err());
        assert!(check(ConditionTree::leaf("id", Operator::Equal, "one")).is_err());
        assert!(check(ConditionTree::leaf("title", Operator::Present, "x")).is_err());
        assert!(check(ConditionTree::leaf("title", Operator::LongerThan, "x")).is_err());
        assert!(check(ConditionTree::leaf("missing", Operator::Equal, 1)).is_err());
    }
}
