//! Search emulation: turns the free-text `search` of a filter into a
//! condition tree over the searchable columns, for children that cannot
//! search themselves or when a replacement handler is registered.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_core::condition_tree::factory;
use quarry_core::schema::PrimitiveType;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ColumnSchema, ConditionTree, FieldSchema, Filter, Operator,
    PaginatedFilter, Projection, Record, Result, Value,
};
use tracing::trace;

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory, Handler};
use crate::collection::{Collection, CollectionRef};

/// Input of a search replacement handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub search: String,
    /// Whether to-one relations should be searched too.
    pub extended: bool,
}

pub type SearchHandler = Handler<SearchRequest, ConditionTree>;

pub struct SearchCollection {
    base: DecoratorBase<SearchCollection>,
    replacer: RwLock<Option<SearchHandler>>,
}

impl DecoratorFactory for SearchCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), replacer: RwLock::new(None) }
    }
}

impl SearchCollection {
    /// Replaces the default search with `replacer`, even when the child can
    /// search natively.
    pub fn replace_search(&self, replacer: SearchHandler) {
        *self.replacer.write() = Some(replacer);
    }

    /// Rewrites `filter.search` into its condition tree. Blank searches are
    /// dropped; searches the child handles itself pass through.
    async fn refine(&self, caller: &Caller, mut filter: Filter) -> Result<Filter> {
        let Some(search) = filter.search.take().filter(|search| !search.trim().is_empty()) else {
            return Ok(filter);
        };
        let replacer = self.replacer.read().clone();
        let tree = match replacer {
            Some(replacer) => {
                let request = SearchRequest { search, extended: filter.search_extended };
                replacer(request, self.base.context(caller)?).await?
            }
            None if self.base.child().schema().searchable => {
                filter.search = Some(search);
                return Ok(filter);
            }
            None => self.default_tree(&search, filter.search_extended)?,
        };
        trace!(collection = self.name(), tree = %tree, "search emulated");
        filter.search_extended = false;
        Ok(filter.intersect_with(Some(tree)))
    }

    /// OR of one condition per column able to match `search`. No such
    /// column yields a tree matching nothing.
    fn default_tree(&self, search: &str, extended: bool) -> Result<ConditionTree> {
        let conditions = self
            .searchable_columns(extended)?
            .into_iter()
            .filter_map(|(path, column)| condition(&path, &column, search));
        Ok(factory::union(conditions))
    }

    fn searchable_columns(&self, extended: bool) -> Result<Vec<(String, ColumnSchema)>> {
        let schema = self.base.child().schema();
        let mut columns = Vec::new();
        for (name, field) in &schema.fields {
            match field {
                FieldSchema::Column(column) => columns.push((name.clone(), column.clone())),
                FieldSchema::ManyToOne(_) | FieldSchema::OneToOne(_) if extended => {
                    let Some(foreign) = field.foreign_collection() else { continue };
                    let related = self.base.datasource()?.child().get_collection(foreign)?.schema();
                    for (sub_name, sub_field) in &related.fields {
                        if let Some(column) = sub_field.as_column() {
                            columns.push((format!("{name}:{sub_name}"), column.clone()));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(columns)
    }
}

/// The leaf searching `search` in one column, if its type and operators
/// allow it.
fn condition(path: &str, column: &ColumnSchema, search: &str) -> Option<ConditionTree> {
    let supports = |operator| column.filter_operators.contains(&operator);
    let trimmed = search.trim();
    match column.column_type.as_primitive()? {
        PrimitiveType::Number if supports(Operator::Equal) => {
            let value = match trimmed.parse::<i64>() {
                Ok(integer) => Value::Int(integer),
                Err(_) => Value::from(trimmed.parse::<f64>().ok().filter(|number| number.is_finite())?),
            };
            Some(ConditionTree::leaf(path, Operator::Equal, value))
        }
        PrimitiveType::Enum if supports(Operator::Equal) => {
            let member = column
                .enum_values
                .iter()
                .flatten()
                .find(|member| member.as_str() == trimmed || member.eq_ignore_ascii_case(trimmed))?;
            Some(ConditionTree::leaf(path, Operator::Equal, member.as_str()))
        }
        PrimitiveType::String if supports(Operator::Contains) => {
            Some(ConditionTree::leaf(path, Operator::Contains, search))
        }
        PrimitiveType::String if supports(Operator::Equal) => Some(ConditionTree::leaf(path, Operator::Equal, search)),
        PrimitiveType::Uuid if supports(Operator::Equal) && uuid::Uuid::parse_str(trimmed).is_ok() => {
            Some(ConditionTree::leaf(path, Operator::Equal, trimmed))
        }
        _ => None,
    }
}

#[async_trait]
impl Collection for SearchCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| CollectionSchema { searchable: true, ..child.clone() })
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
