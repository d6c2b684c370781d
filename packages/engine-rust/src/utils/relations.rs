//! Relation traversal: reading a record's related records through its
//! to-many relations, and locating inverse relations.

use quarry_core::condition_tree::{factory, ConditionTree};
use quarry_core::schema::{FieldSchema, ManyToManySchema, OriginKeySchema};
use quarry_core::value::field_value;
use quarry_core::{
    AggregateResult, Aggregation, Caller, Filter, Operator, PaginatedFilter, Projection, Record, Result, ToolkitError,
    Value,
};

use crate::collection::Collection;
use crate::datasource::Datasource;

/// Value of `field` for the record identified by `id`.
///
/// Primary key fields are read from the id itself, other fields cost one
/// `list` call.
///
/// # Errors
///
/// Fails when the record does not exist or the backend call fails.
pub async fn get_value(caller: &Caller, collection: &dyn Collection, id: &[Value], field: &str) -> Result<Value> {
    let schema = collection.schema();
    if let Some(index) = schema.primary_keys().iter().position(|key| key == field) {
        if let Some(value) = id.get(index) {
            return Ok(value.clone());
        }
    }
    let tree = factory::match_ids(&schema, &[id.to_vec()])?;
    let records = collection
        .list(caller, PaginatedFilter::from_tree(tree), Projection::from_iter([field]))
        .await?;
    records
        .first()
        .map(|record| field_value(record, field).clone())
        .ok_or_else(|| ToolkitError::schema(format!("record not found in '{}'", collection.name())))
}

fn to_many(collection: &dyn Collection, relation_name: &str) -> Result<FieldSchema> {
    let field = collection.schema().field(relation_name)?.clone();
    match field {
        FieldSchema::OneToMany(_) | FieldSchema::ManyToMany(_) => Ok(field),
        other => Err(ToolkitError::schema(format!(
            "relation '{relation_name}' has invalid type {}, should be one of [OneToMany, ManyToMany]",
            other.kind()
        ))),
    }
}

/// Filter on the foreign collection selecting the records related to `id`
/// through the to-many relation `relation_name`, intersected with
/// `base`.
///
/// # Errors
///
/// Fails when the relation is not one-to-many or many-to-many, or when a
/// backend call fails.
pub async fn make_foreign_filter(
    caller: &Caller,
    datasource: &dyn Datasource,
    collection: &dyn Collection,
    id: &[Value],
    relation_name: &str,
    base: PaginatedFilter,
) -> Result<PaginatedFilter> {
    let origin_tree = match to_many(collection, relation_name)? {
        FieldSchema::OneToMany(OriginKeySchema { origin_key, origin_key_target, .. }) => {
            let origin_value = get_value(caller, collection, id, &origin_key_target).await?;
            ConditionTree::leaf(origin_key, Operator::Equal, origin_value)
        }
        FieldSchema::ManyToMany(relation) => {
            let origin_value = get_value(caller, collection, id, &relation.origin_key_target).await?;
            let through = datasource.get_collection(&relation.through_collection)?;
            let links = through
                .list(
                    caller,
                    PaginatedFilter::from_tree(ConditionTree::leaf(
                        relation.origin_key.clone(),
                        Operator::Equal,
                        origin_value,
                    )),
                    Projection::from_iter([relation.foreign_key.clone()]),
                )
                .await?;
            let targets: Vec<Value> = links
                .iter()
                .map(|link| field_value(link, &relation.foreign_key).clone())
                .collect();
            ConditionTree::leaf(relation.foreign_key_target, Operator::In, targets)
        }
        other => {
            return Err(ToolkitError::schema(format!(
                "relation '{relation_name}' has invalid type {}",
                other.kind()
            )))
        }
    };
    let tree = base.condition_tree().cloned();
    Ok(base.with_condition_tree(factory::intersect(tree.into_iter().chain([origin_tree]))))
}

/// Filter on the through collection of a many-to-many relation selecting
/// the links of `id` whose foreign record matches `base`.
///
/// # Errors
///
/// Fails when the relation is not many-to-many, or when a backend call
/// fails.
pub async fn make_through_filter(
    caller: &Caller,
    datasource: &dyn Datasource,
    collection: &dyn Collection,
    id: &[Value],
    relation_name: &str,
    base: PaginatedFilter,
) -> Result<PaginatedFilter> {
    let FieldSchema::ManyToMany(relation) = to_many(collection, relation_name)? else {
        return Err(ToolkitError::schema(format!("relation '{relation_name}' must be many to many")));
    };
    let origin_value = get_value(caller, collection, id, &relation.origin_key_target).await?;
    let origin_leaf = ConditionTree::leaf(relation.origin_key.clone(), Operator::Equal, origin_value);

    if let Some(foreign_relation) = relation.foreign_relation.as_deref().filter(|_| base.is_nestable()) {
        let nested = base.nest(foreign_relation)?;
        let tree = nested.condition_tree().cloned();
        return Ok(nested.with_condition_tree(factory::intersect([origin_leaf].into_iter().chain(tree))));
    }

    let target = datasource.get_collection(&relation.foreign_collection)?;
    let page = base.page;
    let foreign_filter =
        make_foreign_filter(caller, datasource, collection, id, relation_name, base.with_page(None)).await?;
    let records = target
        .list(caller, foreign_filter, Projection::from_iter([relation.foreign_key_target.clone()]))
        .await?;
    let targets: Vec<Value> = records
        .iter()
        .map(|record| field_value(record, &relation.foreign_key_target).clone())
        .collect();
    Ok(PaginatedFilter::from_tree(ConditionTree::and(vec![
        origin_leaf,
        ConditionTree::leaf(relation.foreign_key, Operator::In, targets),
    ]))
    .with_page(page))
}

fn nestable_through(relation: &FieldSchema, filter: &Filter) -> Option<ManyToManySchema> {
    match relation {
        FieldSchema::ManyToMany(relation) if relation.foreign_relation.is_some() && filter.is_nestable() => {
            Some(relation.clone())
        }
        _ => None,
    }
}

/// Records related to `id` through the to-many relation `relation_name`.
///
/// # Errors
///
/// Fails when the relation is unknown or not to-many, or a backend call
/// fails.
pub async fn list_relation(
    caller: &Caller,
    datasource: &dyn Datasource,
    collection: &dyn Collection,
    id: &[Value],
    relation_name: &str,
    filter: PaginatedFilter,
    projection: Projection,
) -> Result<Vec<Record>> {
    let relation = to_many(collection, relation_name)?;
    if let Some(many) = nestable_through(&relation, &filter.filter) {
        let foreign_relation = many.foreign_relation.unwrap_or_default();
        let through = datasource.get_collection(&many.through_collection)?;
        let through_filter = make_through_filter(caller, datasource, collection, id, relation_name, filter).await?;
        let links = through.list(caller, through_filter, projection.nest(&foreign_relation)).await?;
        return Ok(links
            .into_iter()
            .filter_map(|mut link| match link.remove(&foreign_relation) {
                Some(Value::Record(record)) => Some(record),
                _ => None,
            })
            .collect());
    }
    let foreign = datasource.get_collection(relation.foreign_collection().unwrap_or_default())?;
    let foreign_filter = make_foreign_filter(caller, datasource, collection, id, relation_name, filter).await?;
    foreign.list(caller, foreign_filter, projection).await
}

/// Aggregation over the records related to `id` through `relation_name`.
///
/// # Errors
///
/// See [`list_relation`].
#[allow(clippy::too_many_arguments)]
pub async fn aggregate_relation(
    caller: &Caller,
    datasource: &dyn Datasource,
    collection: &dyn Collection,
    id: &[Value],
    relation_name: &str,
    filter: Filter,
    aggregation: Aggregation,
    limit: Option<usize>,
) -> Result<Vec<AggregateResult>> {
    let relation = to_many(collection, relation_name)?;
    if let Some(many) = nestable_through(&relation, &filter) {
        let foreign_relation = many.foreign_relation.unwrap_or_default();
        let through = datasource.get_collection(&many.through_collection)?;
        let through_filter =
            make_through_filter(caller, datasource, collection, id, relation_name, filter.into()).await?;
        let rows = through
            .aggregate(caller, through_filter.to_base_filter(), aggregation.nest(&foreign_relation), limit)
            .await?;
        let prefix = format!("{foreign_relation}:");
        return Ok(rows
            .into_iter()
            .map(|row| AggregateResult {
                value: row.value,
                group: row
                    .group
                    .into_iter()
                    .map(|(key, value)| (key.strip_prefix(&prefix).unwrap_or(&key).to_string(), value))
                    .collect(),
            })
            .collect());
    }
    let foreign = datasource.get_collection(relation.foreign_collection().unwrap_or_default())?;
    let foreign_filter =
        make_foreign_filter(caller, datasource, collection, id, relation_name, filter.into()).await?;
    foreign.aggregate(caller, foreign_filter.to_base_filter(), aggregation, limit).await
}

/// Name of the relation on the foreign collection that points back through
/// the same keys, if any.
///
/// # Errors
///
/// Fails for polymorphic many-to-one relations, which have one inverse per
/// target collection, and for unknown relations.
pub fn get_inverse_relation(
    datasource: &dyn Datasource,
    collection: &dyn Collection,
    relation_name: &str,
) -> Result<Option<String>> {
    let schema = collection.schema();
    let relation = schema.field(relation_name)?;
    let Some(foreign_name) = relation.foreign_collection() else {
        return Err(ToolkitError::schema(format!(
            "relation '{}.{relation_name}' has several inverse relations",
            collection.name()
        )));
    };
    let foreign = datasource.get_collection(foreign_name)?;
    let foreign_schema = foreign.schema();
    Ok(foreign_schema
        .fields
        .iter()
        .filter(|(_, field)| match field {
            FieldSchema::Column(_) => false,
            FieldSchema::PolymorphicManyToOne(_) => true,
            other => other.foreign_collection() == Some(collection.name()),
        })
        .find(|(_, field)| is_inverse(field, relation))
        .map(|(name, _)| name.clone()))
}

fn is_inverse(candidate: &FieldSchema, relation: &FieldSchema) -> bool {
    match (candidate, relation) {
        (FieldSchema::ManyToMany(a), FieldSchema::ManyToMany(b)) => {
            a.origin_key == b.foreign_key && a.through_collection == b.through_collection && a.foreign_key == b.origin_key
        }
        (FieldSchema::ManyToOne(a), FieldSchema::OneToMany(b) | FieldSchema::OneToOne(b)) => a.foreign_key == b.origin_key,
        (FieldSchema::OneToMany(a) | FieldSchema::OneToOne(a), FieldSchema::ManyToOne(b)) => a.origin_key == b.foreign_key,
        (
            FieldSchema::PolymorphicManyToOne(a),
            FieldSchema::PolymorphicOneToOne(b) | FieldSchema::PolymorphicOneToMany(b),
        ) => {
            a.foreign_key == b.origin_key
                && a.foreign_key_type_field == b.origin_type_field
                && a.foreign_collections.contains(&b.origin_type_value)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::schema::{ColumnSchema, ManyToOneSchema, PrimitiveType};
    use quarry_core::value::to_record;
    use quarry_core::CollectionSchema;
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryDatasource;

    fn number() -> ColumnSchema {
        ColumnSchema::new(PrimitiveType::Number)
    }

    fn many_to_one(foreign_collection: &str, foreign_key: &str) -> FieldSchema {
        FieldSchema::ManyToOne(ManyToOneSchema {
            foreign_collection: foreign_collection.into(),
            foreign_key: foreign_key.into(),
            foreign_key_target: "id".into(),
        })
    }

    /// Readers borrow books through `loans`.
    fn library(foreign_relation: Option<&str>) -> MemoryDatasource {
        let readers = CollectionSchema::new()
            .with_field("id", number().primary_key())
            .with_field(
                "books",
                FieldSchema::ManyToMany(ManyToManySchema {
                    foreign_collection: "books".into(),
                    through_collection: "loans".into(),
                    foreign_key: "book_id".into(),
                    foreign_key_target: "id".into(),
                    origin_key: "reader_id".into(),
                    origin_key_target: "id".into(),
                    foreign_relation: foreign_relation.map(str::to_string),
                }),
            )
            .with_field(
                "loans",
                FieldSchema::OneToMany(OriginKeySchema {
                    foreign_collection: "loans".into(),
                    origin_key: "reader_id".into(),
                    origin_key_target: "id".into(),
                }),
            );
        let loans = CollectionSchema::new()
            .with_field("id", number().primary_key())
            .with_field("reader_id", number())
            .with_field("book_id", number())
            .with_field("reader", many_to_one("readers", "reader_id"))
            .with_field("book", many_to_one("books", "book_id"));
        let books = CollectionSchema::new()
            .with_field("id", number().primary_key())
            .with_field("title", ColumnSchema::new(PrimitiveType::String));
        MemoryDatasource::new()
            .with_collection("readers", readers, vec![to_record(json!({"id": 1})), to_record(json!({"id": 2}))])
            .with_collection(
                "loans",
                loans,
                vec![
                    to_record(json!({"id": 1, "reader_id": 1, "book_id": 10})),
                    to_record(json!({"id": 2, "reader_id": 1, "book_id": 11})),
                    to_record(json!({"id": 3, "reader_id": 2, "book_id": 12})),
                ],
            )
            .with_collection(
                "books",
                books,
                vec![
                    to_record(json!({"id": 10, "title": "Dune"})),
                    to_record(json!({"id": 11, "title": "Foundation"})),
                    to_record(json!({"id": 12, "title": "Hyperion"})),
                ],
            )
    }

    fn titles(records: &[Record]) -> Vec<String> {
        let mut titles: Vec<String> = records
            .iter()
            .filter_map(|record| field_value(record, "title").as_str().map(str::to_string))
            .collect();
        titles.sort();
        titles
    }

    #[tokio::test]
    async fn lists_many_to_many_with_and_without_foreign_relation() {
        for foreign_relation in [None, Some("book")] {
            let datasource = library(foreign_relation);
            let readers = datasource.get_collection("readers").unwrap();
            let records = list_relation(
                &Caller::default(),
                &datasource,
                readers.as_ref(),
                &[Value::from(1)],
                "books",
                PaginatedFilter::new(),
                Projection::from("id,title"),
            )
            .await
            .unwrap();
            assert_eq!(titles(&records), vec!["Dune", "Foundation"]);
        }
    }

    #[tokio::test]
    async fn one_to_many_filter_targets_origin_key() {
        let datasource = library(None);
        let readers = datasource.get_collection("readers").unwrap();
        let filter = make_foreign_filter(
            &Caller::default(),
            &datasource,
            readers.as_ref(),
            &[Value::from(2)],
            "loans",
            PaginatedFilter::new(),
        )
        .await
        .unwrap();
        assert_eq!(filter.condition_tree().unwrap().to_string(), "reader_id equal 2");
    }

    #[tokio::test]
    async fn aggregates_through_relation() {
        let datasource = library(Some("book"));
        let readers = datasource.get_collection("readers").unwrap();
        let rows = aggregate_relation(
            &Caller::default(),
            &datasource,
            readers.as_ref(),
            &[Value::from(1)],
            "books",
            Filter::new(),
            Aggregation::count(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(rows[0].value, Value::from(2));
    }

    #[test]
    fn finds_inverse_relations() {
        let datasource = library(None);
        let readers = datasource.get_collection("readers").unwrap();
        assert_eq!(get_inverse_relation(&datasource, readers.as_ref(), "loans").unwrap().as_deref(), Some("reader"));
        let loans = datasource.get_collection("loans").unwrap();
        assert_eq!(get_inverse_relation(&datasource, loans.as_ref(), "reader").unwrap().as_deref(), Some("loans"));
        assert_eq!(get_inverse_relation(&datasource, loans.as_ref(), "book").unwrap(), None);
    }
}
