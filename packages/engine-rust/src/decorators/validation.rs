//! Declarative validation rules checked before writes are forwarded.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_core::schema::ValidationRule;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ConditionTree, Filter, Operator, PaginatedFilter,
    Projection, Record, Result, ToolkitError, Value,
};

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};
use crate::validators::validate_field;

pub struct ValidationCollection {
    base: DecoratorBase<ValidationCollection>,
    validations: RwLock<BTreeMap<String, Vec<ValidationRule>>>,
}

impl DecoratorFactory for ValidationCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), validations: RwLock::new(BTreeMap::new()) }
    }
}

impl ValidationCollection {
    /// Adds `rule` to the column `name`.
    ///
    /// # Errors
    ///
    /// Fails when `name` is not a writable column.
    pub fn add_validation(&self, name: &str, rule: ValidationRule) -> Result<()> {
        let child = self.base.child();
        validate_field(self.base.datasource()?.child().as_ref(), child.as_ref(), name, &[])?;
        let schema = child.schema();
        if schema.column(name)?.is_read_only {
            return Err(ToolkitError::schema(format!(
                "cannot add validators on a readonly field '{}.{name}'",
                self.name()
            )));
        }
        self.validations.write().entry(name.to_string()).or_default().push(rule);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    /// Checks `record` against every rule. On updates (`all_fields` false)
    /// only the fields present in the patch are checked.
    fn validate(&self, caller: &Caller, record: &Record, all_fields: bool) -> Result<()> {
        let validations = self.validations.read().clone();
        let schema = self.schema();
        let time = caller.time_context();
        for (name, rules) in &validations {
            if !all_fields && !record.contains_key(name) {
                continue;
            }
            let is_null = record.get(name).is_none_or(Value::is_null);
            for rule in rules {
                // Null values only answer to presence.
                if is_null && rule.operator != Operator::Present {
                    continue;
                }
                let tree = ConditionTree::leaf(name.clone(), rule.operator, rule.value.clone().unwrap_or_default());
                if !tree.matches(record, schema.as_ref(), &time)? {
                    return Err(ToolkitError::Validation { field: name.clone(), rule: rule.describe() });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Collection for ValidationCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            for (name, rules) in self.validations.read().iter() {
                if let Some(column) = schema.fields.get_mut(name).and_then(|field| field.as_column_mut()) {
                    column.validations.extend(rules.iter().cloned());
                }
            }
            schema
        })
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        self.base.child().list(caller, filter, projection).await
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        for record in &records {
            self.validate(caller, record, true)?;
        }
        self.base.child().create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        self.validate(caller, &patch, false)?;
        self.base.child().update(caller, filter, patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        self.base.child().delete(caller, filter).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        self.base.child().aggregate(caller, filter, aggregation, limit).await
    }
}
