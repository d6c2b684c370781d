//! Relations the backend does not know about, emulated through its own key
//! columns.
//!
//! Projections on an emulated relation are rewritten into the local key,
//! then the related records are fetched with one batched `list` per relation
//! and re-attached. Filters on an emulated relation become an `in` list of
//! keys obtained from a preliminary query on the target side.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use quarry_core::schema::{ManyToManySchema, ManyToOneSchema, OriginKeySchema};
use quarry_core::value::field_value;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ConditionTree, ConditionTreeLeaf, FieldSchema, Filter,
    Operator, PaginatedFilter, Projection, Record, Result, SortClause, ToolkitError, Value,
};
use tracing::debug;

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};
use crate::utils::projection_with_pks;
use crate::validators::validate_field;

/// Relation to emulate. Key targets left to `None` default to the first
/// primary key of the collection they live on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationDefinition {
    ManyToOne {
        foreign_collection: String,
        foreign_key: String,
        foreign_key_target: Option<String>,
    },
    OneToOne {
        foreign_collection: String,
        origin_key: String,
        origin_key_target: Option<String>,
    },
    OneToMany {
        foreign_collection: String,
        origin_key: String,
        origin_key_target: Option<String>,
    },
    ManyToMany {
        foreign_collection: String,
        through_collection: String,
        foreign_key: String,
        foreign_key_target: Option<String>,
        origin_key: String,
        origin_key_target: Option<String>,
    },
}

impl RelationDefinition {
    #[must_use]
    pub fn many_to_one(foreign_collection: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self::ManyToOne {
            foreign_collection: foreign_collection.into(),
            foreign_key: foreign_key.into(),
            foreign_key_target: None,
        }
    }

    #[must_use]
    pub fn one_to_one(foreign_collection: impl Into<String>, origin_key: impl Into<String>) -> Self {
        Self::OneToOne {
            foreign_collection: foreign_collection.into(),
            origin_key: origin_key.into(),
            origin_key_target: None,
        }
    }

    #[must_use]
    pub fn one_to_many(foreign_collection: impl Into<String>, origin_key: impl Into<String>) -> Self {
        Self::OneToMany {
            foreign_collection: foreign_collection.into(),
            origin_key: origin_key.into(),
            origin_key_target: None,
        }
    }

    /// Many-to-many through `through_collection`, which holds `origin_key`
    /// (pointing here) and `foreign_key` (pointing at `foreign_collection`).
    #[must_use]
    pub fn many_to_many(
        foreign_collection: impl Into<String>,
        through_collection: impl Into<String>,
        origin_key: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::ManyToMany {
            foreign_collection: foreign_collection.into(),
            through_collection: through_collection.into(),
            foreign_key: foreign_key.into(),
            foreign_key_target: None,
            origin_key: origin_key.into(),
            origin_key_target: None,
        }
    }

    fn foreign_collection(&self) -> &str {
        match self {
            Self::ManyToOne { foreign_collection, .. }
            | Self::OneToOne { foreign_collection, .. }
            | Self::OneToMany { foreign_collection, .. }
            | Self::ManyToMany { foreign_collection, .. } => foreign_collection,
        }
    }
}

pub struct RelationCollection {
    base: DecoratorBase<RelationCollection>,
    relations: RwLock<BTreeMap<String, FieldSchema>>,
}

impl DecoratorFactory for RelationCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), relations: RwLock::new(BTreeMap::new()) }
    }
}

fn first_primary_key(collection: &dyn Collection) -> Result<String> {
    collection
        .schema()
        .primary_keys()
        .into_iter()
        .next()
        .ok_or_else(|| ToolkitError::schema(format!("collection '{}' has no primary key", collection.name())))
}

/// Distinct non-null values of `path` across `records`.
fn distinct_values(records: &[Record], path: &str) -> Vec<Value> {
    let mut values: Vec<Value> = Vec::new();
    for record in records {
        let value = field_value(record, path);
        if !value.is_null() && !values.iter().any(|seen| seen.loose_eq(value)) {
            values.push(value.clone());
        }
    }
    values
}

impl RelationCollection {
    /// Declares the relation `name`.
    ///
    /// # Errors
    ///
    /// Fails when a collection is unknown, when a key or key target is not
    /// a column supporting `in`, or when a key and its target have
    /// different types.
    pub fn add_relation(&self, name: &str, definition: RelationDefinition) -> Result<()> {
        let foreign = self.base.collection(definition.foreign_collection())?;
        let relation = match definition {
            RelationDefinition::ManyToOne { foreign_collection, foreign_key, foreign_key_target } => {
                let foreign_key_target = match foreign_key_target {
                    Some(target) => target,
                    None => first_primary_key(foreign.as_ref())?,
                };
                self.check_keys(self, foreign.as_ref(), &foreign_key, &foreign_key_target)?;
                FieldSchema::ManyToOne(ManyToOneSchema { foreign_collection, foreign_key, foreign_key_target })
            }
            RelationDefinition::OneToOne { foreign_collection, origin_key, origin_key_target } => {
                let schema = self.origin_key_schema(foreign.as_ref(), foreign_collection, origin_key, origin_key_target)?;
                FieldSchema::OneToOne(schema)
            }
            RelationDefinition::OneToMany { foreign_collection, origin_key, origin_key_target } => {
                let schema = self.origin_key_schema(foreign.as_ref(), foreign_collection, origin_key, origin_key_target)?;
                FieldSchema::OneToMany(schema)
            }
            RelationDefinition::ManyToMany {
                foreign_collection,
                through_collection,
                foreign_key,
                foreign_key_target,
                origin_key,
                origin_key_target,
            } => {
                let through = self.base.collection(&through_collection)?;
                let foreign_key_target = match foreign_key_target {
                    Some(target) => target,
                    None => first_primary_key(foreign.as_ref())?,
                };
                let origin_key_target = match origin_key_target {
                    Some(target) => target,
                    None => first_primary_key(self)?,
                };
                self.check_keys(through.as_ref(), foreign.as_ref(), &foreign_key, &foreign_key_target)?;
                self.check_keys(through.as_ref(), self, &origin_key, &origin_key_target)?;
                FieldSchema::ManyToMany(ManyToManySchema {
                    foreign_collection,
                    through_collection,
                    foreign_key,
                    foreign_key_target,
                    origin_key,
                    origin_key_target,
                    foreign_relation: None,
                })
            }
        };
        self.relations.write().insert(name.to_string(), relation);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    fn origin_key_schema(
        &self,
        foreign: &dyn Collection,
        foreign_collection: String,
        origin_key: String,
        origin_key_target: Option<String>,
    ) -> Result<OriginKeySchema> {
        let origin_key_target = match origin_key_target {
            Some(target) => target,
            None => first_primary_key(self)?,
        };
        self.check_keys(foreign, self, &origin_key, &origin_key_target)?;
        Ok(OriginKeySchema { foreign_collection, origin_key, origin_key_target })
    }

    fn check_keys(&self, owner: &dyn Collection, target_owner: &dyn Collection, key: &str, target: &str) -> Result<()> {
        let key_type = self.check_column(owner, key)?;
        let target_type = self.check_column(target_owner, target)?;
        if key_type != target_type {
            return Err(ToolkitError::schema(format!(
                "types from '{}.{key}' and '{}.{target}' do not match",
                owner.name(),
                target_owner.name()
            )));
        }
        Ok(())
    }

    fn check_column(&self, owner: &dyn Collection, name: &str) -> Result<quarry_core::ColumnType> {
        validate_field(self.base.datasource()?.as_ref(), owner, name, &[])?;
        let schema = owner.schema();
        let column = schema.column(name)?;
        if !column.filter_operators.contains(&Operator::In) {
            return Err(ToolkitError::schema(format!(
                "column does not support the in operator: '{}.{name}'",
                owner.name()
            )));
        }
        Ok(column.column_type.clone())
    }

    fn emulated(&self, name: &str) -> Option<FieldSchema> {
        self.relations.read().get(name).cloned()
    }

    fn association(&self, field: &FieldSchema, name: &str) -> Result<Arc<RelationCollection>> {
        let foreign = field
            .foreign_collection()
            .ok_or_else(|| ToolkitError::schema(format!("'{}.{name}' is not a relation", self.name())))?;
        self.base.collection(foreign)
    }

    /// Local paths the child must return to serve `path`.
    fn rewrite_field(&self, path: &str) -> Result<Projection> {
        let (prefix, rest) = match path.split_once(':') {
            Some((prefix, rest)) => (prefix, Some(rest)),
            None => (path, None),
        };
        let schema = self.schema();
        let field = schema.field(prefix)?;
        if field.is_column() {
            return Ok(Projection::from_iter([path]));
        }
        if self.emulated(prefix).is_none() {
            let Some(rest) = rest else {
                return Ok(Projection::from_iter([path]));
            };
            return Ok(self.association(field, prefix)?.rewrite_field(rest)?.nest(prefix));
        }
        Ok(match field {
            FieldSchema::ManyToOne(relation) => Projection::from_iter([relation.foreign_key.clone()]),
            FieldSchema::OneToOne(relation) | FieldSchema::OneToMany(relation) => {
                Projection::from_iter([relation.origin_key_target.clone()])
            }
            FieldSchema::ManyToMany(relation) => Projection::from_iter([relation.origin_key_target.clone()]),
            _ => Projection::new(),
        })
    }

    fn rewrite_leaf<'a>(&'a self, caller: &'a Caller, leaf: ConditionTreeLeaf) -> BoxFuture<'a, Result<ConditionTree>> {
        Box::pin(async move {
            let Some((prefix, rest)) = leaf.field.split_once(':') else {
                return Ok(ConditionTree::Leaf(leaf));
            };
            let schema = self.schema();
            let field = schema.field(prefix)?.clone();
            let association = self.association(&field, prefix)?;
            let inner = leaf.override_field(rest);

            if self.emulated(prefix).is_none() {
                return Ok(association.rewrite_leaf(caller, inner).await?.nest(prefix));
            }

            debug!(collection = self.name(), relation = prefix, "resolving filter on emulated relation");
            let inner = PaginatedFilter::from_tree(ConditionTree::Leaf(inner));
            match field {
                FieldSchema::ManyToOne(relation) => {
                    let target = relation.foreign_key_target;
                    let records = association.list(caller, inner, Projection::from_iter([target.as_str()])).await?;
                    Ok(ConditionTree::leaf(relation.foreign_key, Operator::In, distinct_values(&records, &target)))
                }
                FieldSchema::OneToOne(relation) | FieldSchema::OneToMany(relation) => {
                    let key = relation.origin_key;
                    let records = association.list(caller, inner, Projection::from_iter([key.as_str()])).await?;
                    Ok(ConditionTree::leaf(relation.origin_key_target, Operator::In, distinct_values(&records, &key)))
                }
                FieldSchema::ManyToMany(relation) => {
                    let target = relation.foreign_key_target;
                    let foreigns = association.list(caller, inner, Projection::from_iter([target.as_str()])).await?;
                    let through = self.base.collection(&relation.through_collection)?;
                    let links = through
                        .list(
                            caller,
                            PaginatedFilter::from_tree(ConditionTree::leaf(
                                relation.foreign_key,
                                Operator::In,
                                distinct_values(&foreigns, &target),
                            )),
                            Projection::from_iter([relation.origin_key.as_str()]),
                        )
                        .await?;
                    Ok(ConditionTree::leaf(
                        relation.origin_key_target,
                        Operator::In,
                        distinct_values(&links, &relation.origin_key),
                    ))
                }
                _ => Ok(ConditionTree::Leaf(leaf)),
            }
        })
    }

    async fn refine_tree(&self, caller: &Caller, tree: Option<&ConditionTree>) -> Result<Option<ConditionTree>> {
        match tree {
            Some(tree) => Ok(Some(tree.replace_leafs_async(|leaf| self.rewrite_leaf(caller, leaf)).await?)),
            None => Ok(None),
        }
    }

    async fn refine_filter(&self, caller: &Caller, filter: Filter) -> Result<Filter> {
        let tree = self.refine_tree(caller, filter.condition_tree.as_ref()).await?;
        Ok(filter.with_condition_tree(tree))
    }

    fn reproject<'a>(
        &'a self,
        caller: &'a Caller,
        records: &'a mut [Record],
        projection: &'a Projection,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for (name, sub_projection) in projection.relations() {
                self.reproject_relation(caller, records, &name, &sub_projection).await?;
            }
            Ok(())
        })
    }

    async fn reproject_relation(
        &self,
        caller: &Caller,
        records: &mut [Record],
        name: &str,
        projection: &Projection,
    ) -> Result<()> {
        let schema = self.schema();
        let field = schema.field(name)?.clone();
        let association = self.association(&field, name)?;

        if self.emulated(name).is_none() {
            let mut positions = Vec::new();
            let mut nested = Vec::new();
            for (index, record) in records.iter_mut().enumerate() {
                if let Some(Value::Record(sub)) = record.get_mut(name) {
                    positions.push(index);
                    nested.push(std::mem::take(sub));
                }
            }
            association.reproject(caller, &mut nested, projection).await?;
            for (index, sub) in positions.into_iter().zip(nested) {
                records[index].insert(name.to_string(), Value::Record(sub));
            }
            return Ok(());
        }

        let (local, remote) = match &field {
            FieldSchema::ManyToOne(relation) => (relation.foreign_key.clone(), relation.foreign_key_target.clone()),
            FieldSchema::OneToOne(relation) => (relation.origin_key_target.clone(), relation.origin_key.clone()),
            _ => return Ok(()),
        };

        let ids = distinct_values(records, &local);
        let related = if ids.is_empty() {
            Vec::new()
        } else {
            debug!(collection = self.name(), relation = name, count = ids.len(), "fetching emulated relation");
            let filter = PaginatedFilter::from_tree(ConditionTree::leaf(remote.clone(), Operator::In, ids));
            association
                .list(caller, filter, projection.union([&Projection::from_iter([remote.as_str()])]))
                .await?
        };
        for record in records.iter_mut() {
            let key = field_value(record, &local).clone();
            let found = related
                .iter()
                .find(|candidate| !key.is_null() && field_value(candidate, &remote).loose_eq(&key))
                .map_or(Value::Null, |candidate| Value::Record(candidate.clone()));
            record.insert(name.to_string(), found);
        }
        Ok(())
    }
}

#[async_trait]
impl Collection for RelationCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            for (name, relation) in self.relations.read().iter() {
                schema.fields.insert(name.clone(), relation.clone());
            }
            schema
        })
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        let tree = self.refine_tree(caller, filter.condition_tree()).await?;
        let sort = match &filter.sort {
            Some(sort) => Some(sort.replace_clauses(|clause| {
                Ok(self
                    .rewrite_field(&clause.field)?
                    .iter()
                    .map(|field| SortClause { field: field.to_string(), ascending: clause.ascending })
                    .collect())
            })?),
            None => None,
        };
        let child_filter = filter.with_condition_tree(tree).with_sort(sort);

        let layer = self.base.datasource()?;
        let rewritten = projection.try_replace(|path| self.rewrite_field(path))?;
        let child_projection = projection_with_pks(layer.as_ref(), self, &rewritten)?;
        let mut records = self.base.child().list(caller, child_filter, child_projection.clone()).await?;
        if child_projection == projection {
            return Ok(records);
        }

        self.reproject(caller, &mut records, &projection).await?;
        projection.apply(&records)
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        self.base.child().create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let filter = self.refine_filter(caller, filter).await?;
        self.base.child().update(caller, filter, patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        let filter = self.refine_filter(caller, filter).await?;
        self.base.child().delete(caller, filter).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let uses_emulated = {
            let relations = self.relations.read();
            aggregation.projection().relations().iter().any(|(name, _)| relations.contains_key(name))
        };
        if !uses_emulated {
            let filter = self.refine_filter(caller, filter).await?;
            return self.base.child().aggregate(caller, filter, aggregation, limit).await;
        }

        debug!(collection = self.name(), "aggregating over emulated relation in memory");
        let timezone = filter.timezone.unwrap_or(caller.timezone);
        let records = self
            .list(caller, PaginatedFilter::from_base_filter(filter), aggregation.projection())
            .await?;
        aggregation.apply(&records, timezone, limit)
    }
}
