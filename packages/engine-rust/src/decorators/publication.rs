//! Hides fields from the exposed schema.
//!
//! A relation is only published while the keys it is built on are.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, FieldSchema, Filter, PaginatedFilter, Projection, Record,
    Result, ToolkitError,
};

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};

pub struct PublicationCollection {
    base: DecoratorBase<PublicationCollection>,
    unpublished: RwLock<BTreeSet<String>>,
}

impl DecoratorFactory for PublicationCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), unpublished: RwLock::new(BTreeSet::new()) }
    }
}

impl PublicationCollection {
    /// Shows or hides `name`.
    ///
    /// # Errors
    ///
    /// Fails for unknown fields and for primary keys.
    pub fn change_field_visibility(&self, name: &str, visible: bool) -> Result<()> {
        let child_schema = self.base.child().schema();
        let field = child_schema.field(name)?;
        if field.as_column().is_some_and(|column| column.is_primary_key) && !visible {
            return Err(ToolkitError::schema(format!("cannot hide primary key '{}.{name}'", self.name())));
        }
        if visible {
            self.unpublished.write().remove(name);
        } else {
            self.unpublished.write().insert(name.to_string());
        }

        // Relations of siblings may depend on this field.
        for sibling in self.base.datasource()?.decorators() {
            sibling.base.mark_schema_as_dirty();
        }
        Ok(())
    }

    fn is_hidden(&self, name: &str) -> bool {
        self.unpublished.read().contains(name)
    }

    fn is_published(&self, name: &str) -> bool {
        if self.is_hidden(name) {
            return false;
        }
        let schema = self.base.child().schema();
        let Some(field) = schema.fields.get(name) else {
            return false;
        };
        let sibling_publishes = |collection: &str, key: &str| {
            self.base.collection(collection).is_ok_and(|sibling| sibling.is_published(key))
        };
        match field {
            FieldSchema::Column(_) => true,
            FieldSchema::ManyToOne(relation) => self.is_published(&relation.foreign_key),
            FieldSchema::OneToOne(relation) | FieldSchema::OneToMany(relation) => {
                sibling_publishes(&relation.foreign_collection, &relation.origin_key)
            }
            FieldSchema::ManyToMany(relation) => {
                sibling_publishes(&relation.through_collection, &relation.foreign_key)
                    && sibling_publishes(&relation.through_collection, &relation.origin_key)
            }
            FieldSchema::PolymorphicManyToOne(relation) => {
                self.is_published(&relation.foreign_key) && self.is_published(&relation.foreign_key_type_field)
            }
            FieldSchema::PolymorphicOneToOne(relation) | FieldSchema::PolymorphicOneToMany(relation) => {
                sibling_publishes(&relation.foreign_collection, &relation.origin_key)
                    && sibling_publishes(&relation.foreign_collection, &relation.origin_type_field)
            }
        }
    }
}

#[async_trait]
impl Collection for PublicationCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            schema.fields.retain(|name, _| self.is_published(name));
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
        let created = self.base.child().create(caller, records).await?;
        let unpublished = self.unpublished.read().clone();
        Ok(created
            .into_iter()
            .map(|mut record| {
                record.retain(|name, _| !unpublished.contains(name));
                record
            })
            .collect())
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
        self.base.child().aggregate(caller, filter, aggregation, limit).await
    }
}
