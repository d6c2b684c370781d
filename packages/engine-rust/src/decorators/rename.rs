//! Field renaming.
//!
//! Two maps translate between exposed and child names; paths are
//! translated segment by segment through the sibling decorators of each
//! relation.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ConditionTree, FieldSchema, Filter, PaginatedFilter,
    Projection, Record, Result, SortClause, ToolkitError, Value,
};

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};

#[derive(Debug, Default, Clone)]
struct RenameMap {
    to_child: BTreeMap<String, String>,
    from_child: BTreeMap<String, String>,
}

pub struct RenameCollection {
    base: DecoratorBase<RenameCollection>,
    names: RwLock<RenameMap>,
}

impl DecoratorFactory for RenameCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), names: RwLock::new(RenameMap::default()) }
    }
}

impl RenameCollection {
    /// Exposes `current_name` as `new_name`. Renaming a field back to its
    /// child name cancels the previous rename.
    ///
    /// # Errors
    ///
    /// Fails for unknown fields, invalid or taken names, and for fields
    /// that are part of a polymorphic relation key.
    pub fn rename_field(&self, current_name: &str, new_name: &str) -> Result<()> {
        let schema = self.schema();
        if !schema.fields.contains_key(current_name) {
            let choices: Vec<&str> = schema.fields.keys().map(String::as_str).collect();
            return Err(ToolkitError::schema(format!(
                "no such field '{}.{current_name}', choices are {}",
                self.name(),
                choices.join(", ")
            )));
        }
        if new_name.is_empty() || new_name.contains(':') || new_name.contains(char::is_whitespace) {
            return Err(ToolkitError::schema(format!("the name of field '{}.{new_name}' is invalid", self.name())));
        }
        if new_name != current_name && schema.fields.contains_key(new_name) {
            return Err(ToolkitError::schema(format!("field '{}.{new_name}' already exists", self.name())));
        }
        for (name, field) in &self.base.child().schema().fields {
            if let FieldSchema::PolymorphicManyToOne(relation) = field {
                let child_name = self.to_child(current_name);
                if relation.foreign_key == child_name || relation.foreign_key_type_field == child_name {
                    return Err(ToolkitError::schema(format!(
                        "cannot rename '{}.{current_name}', because it's implied in a polymorphic relation '{}.{name}'",
                        self.name(),
                        self.name()
                    )));
                }
            }
        }

        {
            let mut names = self.names.write();
            let mut initial_name = current_name.to_string();
            if let Some(child_name) = names.to_child.remove(current_name) {
                names.from_child.remove(&child_name);
                initial_name = child_name;
            }
            if initial_name != new_name {
                names.from_child.insert(initial_name.clone(), new_name.to_string());
                names.to_child.insert(new_name.to_string(), initial_name);
            }
        }

        // Relation schemas of siblings mention our keys.
        for sibling in self.base.datasource()?.decorators() {
            sibling.base.mark_schema_as_dirty();
        }
        Ok(())
    }

    fn to_child(&self, name: &str) -> String {
        self.names.read().to_child.get(name).cloned().unwrap_or_else(|| name.to_string())
    }

    fn from_child(&self, name: &str) -> String {
        self.names.read().from_child.get(name).cloned().unwrap_or_else(|| name.to_string())
    }

    fn sibling(&self, field: &FieldSchema, name: &str) -> Result<Arc<RenameCollection>> {
        let foreign = field
            .foreign_collection()
            .ok_or_else(|| ToolkitError::schema(format!("the field {name} is not a relation")))?;
        self.base.collection(foreign)
    }

    fn path_to_child(&self, path: &str) -> Result<String> {
        let Some((name, rest)) = path.split_once(':') else {
            return Ok(self.to_child(path));
        };
        let schema = self.schema();
        let field = schema.field(name)?;
        let child_name = self.to_child(name);
        if let FieldSchema::PolymorphicManyToOne(_) = field {
            return Ok(format!("{child_name}:{rest}"));
        }
        Ok(format!("{child_name}:{}", self.sibling(field, name)?.path_to_child(rest)?))
    }

    fn path_from_child(&self, path: &str) -> Result<String> {
        let Some((child_name, rest)) = path.split_once(':') else {
            return Ok(self.from_child(path));
        };
        let name = self.from_child(child_name);
        let schema = self.schema();
        let field = schema.field(&name)?;
        if let FieldSchema::PolymorphicManyToOne(_) = field {
            return Ok(format!("{name}:{rest}"));
        }
        Ok(format!("{name}:{}", self.sibling(field, &name)?.path_from_child(rest)?))
    }

    fn record_to_child(&self, record: Record) -> Result<Record> {
        let schema = self.schema();
        let mut child = Record::new();
        for (name, value) in record {
            let value = match (schema.fields.get(&name), value) {
                (Some(field), Value::Record(sub)) if field.is_relation() && !field.is_polymorphic() => {
                    Value::Record(self.sibling(field, &name)?.record_to_child(sub)?)
                }
                (_, value) => value,
            };
            child.insert(self.to_child(&name), value);
        }
        Ok(child)
    }

    fn record_from_child(&self, record: Record) -> Result<Record> {
        let schema = self.schema();
        let mut exposed = Record::new();
        for (child_name, value) in record {
            let name = self.from_child(&child_name);
            let value = match (schema.fields.get(&name), value) {
                (Some(field), Value::Record(sub)) if field.is_relation() && !field.is_polymorphic() => {
                    Value::Record(self.sibling(field, &name)?.record_from_child(sub)?)
                }
                (_, value) => value,
            };
            exposed.insert(name, value);
        }
        Ok(exposed)
    }

    fn refine_tree(&self, tree: Option<&ConditionTree>) -> Result<Option<ConditionTree>> {
        let Some(tree) = tree else {
            return Ok(None);
        };
        tree.replace_leafs(|leaf| Ok(ConditionTree::Leaf(leaf.override_field(self.path_to_child(&leaf.field)?))))
            .map(Some)
    }

    fn refine_filter(&self, filter: Filter) -> Result<Filter> {
        let tree = self.refine_tree(filter.condition_tree.as_ref())?;
        Ok(filter.with_condition_tree(tree))
    }

    /// Child name of `key` as seen from `owner`.
    fn key_in(&self, owner: &str, key: &str) -> Result<String> {
        Ok(self.base.collection(owner)?.from_child(key))
    }
}

#[async_trait]
impl Collection for RenameCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let names = self.names.read().clone();
            let rename = |name: &str| names.from_child.get(name).cloned().unwrap_or_else(|| name.to_string());
            let mut schema = child.clone();
            schema.fields = child
                .fields
                .iter()
                .map(|(name, field)| {
                    let mut field = field.clone();
                    match &mut field {
                        FieldSchema::ManyToOne(relation) => {
                            relation.foreign_key = rename(&relation.foreign_key);
                            if let Ok(target) = self.key_in(&relation.foreign_collection, &relation.foreign_key_target) {
                                relation.foreign_key_target = target;
                            }
                        }
                        FieldSchema::OneToOne(relation) | FieldSchema::OneToMany(relation) => {
                            relation.origin_key_target = rename(&relation.origin_key_target);
                            if let Ok(key) = self.key_in(&relation.foreign_collection, &relation.origin_key) {
                                relation.origin_key = key;
                            }
                        }
                        FieldSchema::ManyToMany(relation) => {
                            relation.origin_key_target = rename(&relation.origin_key_target);
                            if let Ok(target) = self.key_in(&relation.foreign_collection, &relation.foreign_key_target) {
                                relation.foreign_key_target = target;
                            }
                            if let Ok(key) = self.key_in(&relation.through_collection, &relation.foreign_key) {
                                relation.foreign_key = key;
                            }
                            if let Ok(key) = self.key_in(&relation.through_collection, &relation.origin_key) {
                                relation.origin_key = key;
                            }
                        }
                        _ => {}
                    }
                    (rename(name), field)
                })
                .collect();
            schema
        })
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        let tree = self.refine_tree(filter.condition_tree())?;
        let sort = match &filter.sort {
            Some(sort) => Some(sort.replace_clauses(|clause| {
                Ok(vec![SortClause { field: self.path_to_child(&clause.field)?, ascending: clause.ascending }])
            })?),
            None => None,
        };
        let filter = filter.with_condition_tree(tree).with_sort(sort);

        let child_projection =
            projection.try_replace(|path| Ok(Projection::from_iter([self.path_to_child(path)?])))?;
        let records = self.base.child().list(caller, filter, child_projection.clone()).await?;
        if child_projection == projection {
            return Ok(records);
        }
        records.into_iter().map(|record| self.record_from_child(record)).collect()
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        let records = records.into_iter().map(|record| self.record_to_child(record)).collect::<Result<_>>()?;
        let created = self.base.child().create(caller, records).await?;
        created.into_iter().map(|record| self.record_from_child(record)).collect()
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let filter = self.refine_filter(filter)?;
        let patch = self.record_to_child(patch)?;
        self.base.child().update(caller, filter, patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        let filter = self.refine_filter(filter)?;
        self.base.child().delete(caller, filter).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let filter = self.refine_filter(filter)?;
        let mut failure = None;
        let aggregation = aggregation.replace_fields(|field| match self.path_to_child(field) {
            Ok(path) => path,
            Err(error) => {
                failure.get_or_insert(error);
                field.to_string()
            }
        });
        if let Some(error) = failure {
            return Err(error);
        }

        let rows = self.base.child().aggregate(caller, filter, aggregation, limit).await?;
        rows.into_iter()
            .map(|row| {
                let group = row
                    .group
                    .into_iter()
                    .map(|(path, value)| Ok((self.path_from_child(&path)?, value)))
                    .collect::<Result<Record>>()?;
                Ok(AggregateResult { value: row.value, group })
            })
            .collect()
    }
}
