//! Named segments: predefined condition trees selected through
//! `filter.segment`.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ConditionTree, Filter, PaginatedFilter, Projection, Record,
    Result,
};
use tracing::trace;

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory, Handler};
use crate::collection::{Collection, CollectionRef};
use crate::validators::validate_field;

/// Builds the tree of a segment for the requesting caller.
pub type SegmentHandler = Handler<(), ConditionTree>;

pub struct SegmentCollection {
    base: DecoratorBase<SegmentCollection>,
    segments: RwLock<BTreeMap<String, SegmentHandler>>,
}

impl DecoratorFactory for SegmentCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), segments: RwLock::new(BTreeMap::new()) }
    }
}

impl SegmentCollection {
    /// Registers segment `name`, replacing any previous definition.
    pub fn add_segment(&self, name: impl Into<String>, definition: SegmentHandler) {
        self.segments.write().insert(name.into(), definition);
        self.base.mark_schema_as_dirty();
    }

    /// Resolves a segment this level owns into the filter's condition tree.
    /// Segments of other levels pass through.
    async fn refine(&self, caller: &Caller, mut filter: Filter) -> Result<Filter> {
        let definition = filter.segment.as_deref().and_then(|segment| self.segments.read().get(segment).cloned());
        let Some(definition) = definition else {
            return Ok(filter);
        };
        let tree = definition((), self.base.context(caller)?).await?;
        let datasource = self.base.datasource()?;
        for field in tree.projection().iter() {
            validate_field(datasource.as_ref(), self, field, &[])?;
        }
        trace!(collection = self.name(), segment = filter.segment.as_deref(), tree = %tree, "segment applied");
        filter.segment = None;
        Ok(filter.intersect_with(Some(tree)))
    }
}

#[async_trait]
impl Collection for SegmentCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            for name in self.segments.read().keys() {
                if !schema.segments.contains(name) {
                    schema.segments.push(name.clone());
                }
            }
            schema
        })
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        let filter = PaginatedFilter { filter: self.refine(caller, filter.filter).await?, ..filter };
        self.base.child().list(caller, filter, projection).await
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        self.base.child().create(caller, records).await
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let filter = self.refine(caller, filter).await?;
        self.base.child().update(caller, filter, patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        let filter = self.refine(caller, filter).await?;
        self.base.child().delete(caller, filter).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let filter = self.refine(caller, filter).await?;
        self.base.child().aggregate(caller, filter, aggregation, limit).await
    }
}
