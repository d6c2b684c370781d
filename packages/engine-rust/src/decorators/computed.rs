//! Read-only fields computed in memory from other fields.
//!
//! A computed field declares the paths it depends on. On `list` the
//! projection is rewritten so the backend returns those dependencies, then
//! every computed field is resolved in dependency order, batching each
//! resolver call over the distinct dependency values of the page.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use quarry_core::schema::{ColumnSchema, ColumnType, FieldSchema};
use quarry_core::value::{field_value, set_field_value};
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, Filter, PaginatedFilter, Projection, Record, Result,
    ToolkitError, Value,
};
use tracing::debug;

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory, Handler};
use crate::collection::{Collection, CollectionRef};
use crate::validators::validate_field;

/// Declaration of a computed field.
#[derive(Clone)]
pub struct ComputedDefinition {
    pub column_type: ColumnType,
    pub dependencies: Projection,
    /// One output value per input record, in input order.
    pub get_values: Handler<Vec<Record>, Vec<Value>>,
    pub default_value: Option<Value>,
    pub enum_values: Option<Vec<String>>,
}

impl ComputedDefinition {
    #[must_use]
    pub fn new(
        column_type: impl Into<ColumnType>,
        dependencies: impl Into<Projection>,
        get_values: Handler<Vec<Record>, Vec<Value>>,
    ) -> Self {
        Self {
            column_type: column_type.into(),
            dependencies: dependencies.into(),
            get_values,
            default_value: None,
            enum_values: None,
        }
    }

    #[must_use]
    pub fn with_default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_enum_values<S: Into<String>>(mut self, values: impl IntoIterator<Item = S>) -> Self {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    fn column(&self) -> ColumnSchema {
        let mut column = ColumnSchema::new(self.column_type.clone()).read_only().sortable(false).operators(std::iter::empty());
        column.default_value = self.default_value.clone();
        column.enum_values = self.enum_values.clone();
        column
    }
}

impl std::fmt::Debug for ComputedDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedDefinition")
            .field("column_type", &self.column_type)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

pub struct ComputedCollection {
    base: DecoratorBase<ComputedCollection>,
    computeds: RwLock<BTreeMap<String, ComputedDefinition>>,
}

impl DecoratorFactory for ComputedCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), computeds: RwLock::new(BTreeMap::new()) }
    }
}

impl ComputedCollection {
    /// Adds a computed field.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Schema`] when a dependency does not resolve to
    /// a column of this collection (computed fields included).
    pub fn register_computed(&self, name: &str, definition: ComputedDefinition) -> Result<()> {
        let layer = self.base.datasource()?;
        for dependency in definition.dependencies.iter() {
            validate_field(layer.as_ref(), self, dependency, &[]).map_err(|_| {
                ToolkitError::schema(format!(
                    "the dependency {dependency} of the computed field {name} is unknown in the collection {}",
                    self.name()
                ))
            })?;
        }
        self.computeds.write().insert(name.to_string(), definition);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    /// Whether `name` is computed by this decorator.
    #[must_use]
    pub fn is_computed(&self, name: &str) -> bool {
        self.computeds.read().contains_key(name)
    }

    /// Owner and definition of the computed field at `path`.
    fn computed(&self, path: &str) -> Result<Option<(Arc<ComputedCollection>, ComputedDefinition)>> {
        match path.split_once(':') {
            None => {
                let Some(definition) = self.computeds.read().get(path).cloned() else {
                    return Ok(None);
                };
                Ok(Some((self.base.collection(self.name())?, definition)))
            }
            Some((prefix, rest)) => self.association(prefix)?.computed(rest),
        }
    }

    fn association(&self, prefix: &str) -> Result<Arc<ComputedCollection>> {
        let schema = self.schema();
        let foreign = schema
            .field(prefix)?
            .foreign_collection()
            .ok_or_else(|| ToolkitError::schema(format!("'{prefix}' is not a relation")))?
            .to_string();
        self.base.collection(&foreign)
    }

    /// Paths the child must return so that `path` can be computed.
    fn rewrite_field(&self, path: &str) -> Result<Projection> {
        if let Some((prefix, rest)) = path.split_once(':') {
            return Ok(self.association(prefix)?.rewrite_field(rest)?.nest(prefix));
        }
        let dependencies = self.computeds.read().get(path).map(|definition| definition.dependencies.clone());
        match dependencies {
            Some(dependencies) => dependencies.try_replace(|dependency| self.rewrite_field(dependency)),
            None => Ok(Projection::from_iter([path])),
        }
    }

    fn aggregation_uses_computed(&self, aggregation: &Aggregation) -> Result<bool> {
        for path in aggregation.projection().iter() {
            if self.computed(path)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Ensures every record holds a value at `path`, computing it (and the
    /// computed fields it depends on) when it is not already available.
    fn queue_field<'a>(
        &'a self,
        caller: &'a Caller,
        path: String,
        available: &'a mut BTreeSet<String>,
        records: &'a mut [Record],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if available.contains(&path) {
                return Ok(());
            }
            let Some((owner, definition)) = self.computed(&path)? else {
                available.insert(path);
                return Ok(());
            };
            let prefix = path.rsplit_once(':').map(|(prefix, _)| prefix.to_string());
            let nested = match &prefix {
                Some(prefix) => definition.dependencies.nest(prefix),
                None => definition.dependencies.clone(),
            };
            for dependency in nested.iter() {
                self.queue_field(caller, dependency.to_string(), available, records).await?;
            }

            // Distinct partial records; a null parent relation yields no input.
            let mut inputs: Vec<Record> = Vec::new();
            let mut index: HashMap<Record, usize> = HashMap::new();
            let mut mapping: Vec<Option<usize>> = Vec::with_capacity(records.len());
            for record in records.iter() {
                let parent = match &prefix {
                    Some(prefix) => match field_value(record, prefix) {
                        Value::Record(parent) => Some(parent),
                        _ => None,
                    },
                    None => Some(record),
                };
                let Some(parent) = parent else {
                    mapping.push(None);
                    continue;
                };
                let mut partial = Record::new();
                for dependency in definition.dependencies.iter() {
                    set_field_value(&mut partial, dependency, field_value(parent, dependency).clone());
                }
                let position = *index.entry(partial.clone()).or_insert_with(|| {
                    inputs.push(partial);
                    inputs.len() - 1
                });
                mapping.push(Some(position));
            }

            let expected = inputs.len();
            let outputs = (definition.get_values)(inputs, owner.base.context(caller)?).await?;
            if outputs.len() != expected {
                return Err(ToolkitError::schema(format!(
                    "computed field '{path}' returned {} values for {expected} records",
                    outputs.len()
                )));
            }
            for (record, position) in records.iter_mut().zip(mapping) {
                if let Some(position) = position {
                    set_field_value(record, &path, outputs[position].clone());
                }
            }
            available.insert(path);
            Ok(())
        })
    }
}

#[async_trait]
impl Collection for ComputedCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            for (name, definition) in self.computeds.read().iter() {
                schema.fields.insert(name.clone(), FieldSchema::Column(definition.column()));
            }
            schema
        })
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        let child_projection = projection.try_replace(|path| self.rewrite_field(path))?;
        let mut records = self.base.child().list(caller, filter, child_projection.clone()).await?;
        if records.is_empty() || child_projection == projection {
            return Ok(records);
        }

        let mut available: BTreeSet<String> = child_projection.iter().map(str::to_string).collect();
        for path in projection.iter() {
            self.queue_field(caller, path.to_string(), &mut available, &mut records).await?;
        }
        projection.apply(&records)
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        self.base.child().create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
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
        if !self.aggregation_uses_computed(&aggregation)? {
            return self.base.child().aggregate(caller, filter, aggregation, limit).await;
        }

        debug!(collection = self.name(), "aggregating computed fields in memory");
        let timezone = filter.timezone.unwrap_or(caller.timezone);
        let records = self
            .list(caller, PaginatedFilter::from_base_filter(filter), aggregation.projection())
            .await?;
        aggregation.apply(&records, timezone, limit)
    }
}
