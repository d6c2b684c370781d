//! Sorting on fields the backend cannot sort: either substituted with an
//! equivalent sort, or done in memory over the whole filtered set.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_core::condition_tree::factory;
use quarry_core::schema::FieldSchema;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, Filter, PaginatedFilter, Projection, Record, Result, Sort,
    SortClause, ToolkitError, Value,
};
use tracing::debug;

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};
use crate::utils::projection_with_pks;
use crate::validators::validate_field;

pub struct SortEmulateCollection {
    base: DecoratorBase<SortEmulateCollection>,
    /// Field to its equivalent sort; `None` means emulated in memory.
    sorts: RwLock<BTreeMap<String, Option<Sort>>>,
}

impl DecoratorFactory for SortEmulateCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), sorts: RwLock::new(BTreeMap::new()) }
    }
}

impl SortEmulateCollection {
    /// Sorts on `name` in memory.
    ///
    /// # Errors
    ///
    /// Fails when `name` is not a column.
    pub fn emulate_field_sorting(&self, name: &str) -> Result<()> {
        self.register(name, None)
    }

    /// Sorts on `name` using `equivalent` instead (flipped for descending
    /// sorts).
    ///
    /// # Errors
    ///
    /// Fails when `name` is not a column or `equivalent` is empty.
    pub fn replace_field_sorting(&self, name: &str, equivalent: Sort) -> Result<()> {
        if equivalent.is_empty() {
            return Err(ToolkitError::schema("a new sorting method should be provided to replace field sorting"));
        }
        self.register(name, Some(equivalent))
    }

    fn register(&self, name: &str, equivalent: Option<Sort>) -> Result<()> {
        validate_field(self.base.datasource()?.as_ref(), self, name, &[])?;
        self.sorts.write().insert(name.to_string(), equivalent);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    fn association(&self, prefix: &str) -> Result<Arc<SortEmulateCollection>> {
        let schema = self.schema();
        let foreign = schema
            .field(prefix)?
            .foreign_collection()
            .ok_or_else(|| ToolkitError::schema(format!("'{prefix}' is not a relation")))?
            .to_string();
        self.base.collection(&foreign)
    }

    fn rewrite_clause(&self, clause: &SortClause, visited: &[String]) -> Result<Vec<SortClause>> {
        if let Some((prefix, rest)) = clause.field.split_once(':') {
            let association = self.association(prefix)?;
            let inner = SortClause { field: rest.to_string(), ascending: clause.ascending };
            let rewritten = Sort::new(association.rewrite_clause(&inner, visited)?);
            return Ok(rewritten.nest(prefix).0);
        }

        let equivalent = self.sorts.read().get(&clause.field).cloned().flatten();
        let Some(equivalent) = equivalent else {
            return Ok(vec![clause.clone()]);
        };
        if visited.contains(&clause.field) {
            return Err(ToolkitError::schema(format!(
                "sort replacement cycle on '{}.{}'",
                self.name(),
                clause.field
            )));
        }
        let mut visited = visited.to_vec();
        visited.push(clause.field.clone());
        let equivalent = if clause.ascending { equivalent } else { equivalent.inverse() };
        Ok(equivalent.replace_clauses(|sub_clause| self.rewrite_clause(sub_clause, &visited))?.0)
    }

    fn is_emulated(&self, path: &str) -> Result<bool> {
        match path.split_once(':') {
            None => Ok(matches!(self.sorts.read().get(path), Some(None))),
            Some((prefix, rest)) => self.association(prefix)?.is_emulated(rest),
        }
    }

    /// Puts `records` in the order of `reference`, matching on primary keys.
    fn sort_like(&self, reference: &[Record], records: Vec<Record>) -> Result<Vec<Record>> {
        let schema = self.schema();
        let mut positions: HashMap<Vec<Value>, usize> = HashMap::with_capacity(reference.len());
        for (index, record) in reference.iter().enumerate() {
            positions.insert(factory::record_id(&schema, record)?, index);
        }
        let mut sorted: Vec<Option<Record>> = vec![None; reference.len()];
        for record in records {
            if let Some(position) = positions.get(&factory::record_id(&schema, &record)?) {
                sorted[*position] = Some(record);
            }
        }
        Ok(sorted.into_iter().flatten().collect())
    }
}

#[async_trait]
impl Collection for SortEmulateCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            for name in self.sorts.read().keys() {
                if let Some(FieldSchema::Column(column)) = schema.fields.get_mut(name) {
                    column.is_sortable = true;
                }
            }
            schema
        })
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        let mut child_filter = filter;
        if let Some(sort) = &child_filter.sort {
            child_filter.sort = Some(sort.replace_clauses(|clause| self.rewrite_clause(clause, &[]))?);
        }

        let emulated = match &child_filter.sort {
            Some(sort) => sort.clauses().map(|clause| self.is_emulated(&clause.field)).collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        let Some(sort) = child_filter.sort.clone().filter(|_| emulated.contains(&true)) else {
            return self.base.child().list(caller, child_filter, projection).await;
        };

        debug!(collection = self.name(), sort = ?sort, "emulating sort in memory");
        let layer = self.base.datasource()?;

        // Whole filtered set, only with what the sort reads.
        let reference_filter = PaginatedFilter::from_base_filter(child_filter.to_base_filter());
        let sort_projection = projection_with_pks(layer.as_ref(), self, &sort.projection())?;
        let mut reference = self.base.child().list(caller, reference_filter, sort_projection).await?;
        sort.apply(&mut reference);
        if let Some(page) = child_filter.page {
            reference = page.apply(reference);
        }

        let by_ids = PaginatedFilter::from_tree(factory::match_records(&self.schema(), &reference)?);
        let full_projection = projection_with_pks(layer.as_ref(), self, &projection)?;
        let records = self.base.child().list(caller, by_ids, full_projection).await?;
        let records = self.sort_like(&reference, records)?;
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
        self.base.child().aggregate(caller, filter, aggregation, limit).await
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::schema::{ColumnSchema, PrimitiveType};
    use quarry_core::value::to_record;
    use quarry_core::Page;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::{MemoryDatasource, RecordingCollection};

    fn stack() -> (Arc<DatasourceDecorator<RecordingCollection>>, Arc<DatasourceDecorator<SortEmulateCollection>>) {
        let memory = MemoryDatasource::new().with_collection(
            "books",
            CollectionSchema::new()
                .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
                .with_field("title", ColumnSchema::new(PrimitiveType::String).sortable(false))
                .with_field("year", ColumnSchema::new(PrimitiveType::Number)),
            vec![
                to_record(json!({"id": 1, "title": "Foundation", "year": 1951})),
                to_record(json!({"id": 2, "title": "Beat the dealer", "year": 1962})),
                to_record(json!({"id": 3, "title": "Gomorrah", "year": 2006})),
            ],
        );
        let config = Arc::new(EngineConfig::default());
        let recording = DatasourceDecorator::<RecordingCollection>::new(Arc::new(memory), config.clone());
        let sort = DatasourceDecorator::<SortEmulateCollection>::new(recording.clone(), config);
        (recording, sort)
    }

    fn titles(records: &[Record]) -> Vec<&str> {
        records.iter().filter_map(|record| record.get("title")?.as_str()).collect()
    }

    async fn list_sorted(books: &SortEmulateCollection, clause: SortClause, page: Option<Page>) -> Vec<Record> {
        let filter = PaginatedFilter::new().with_sort(Some(Sort::new(vec![clause]))).with_page(page);
        books.list(&Caller::default(), filter, Projection::from("title")).await.unwrap()
    }

    #[tokio::test]
    async fn emulated_sort_orders_and_pages_in_memory() {
        let (recording, sort) = stack();
        let books = sort.collection("books").unwrap();
        books.emulate_field_sorting("title").unwrap();
        assert!(books.schema().column("title").unwrap().is_sortable);

        let ascending = list_sorted(&books, SortClause::asc("title"), None).await;
        assert_eq!(titles(&ascending), vec!["Beat the dealer", "Foundation", "Gomorrah"]);

        let descending = list_sorted(&books, SortClause::desc("title"), None).await;
        assert_eq!(titles(&descending), vec!["Gomorrah", "Foundation", "Beat the dealer"]);

        let paged = list_sorted(&books, SortClause::desc("title"), Some(Page::new(2, Some(1)))).await;
        assert_eq!(titles(&paged), vec!["Beat the dealer"]);

        let calls = recording.collection("books").unwrap().list_calls();
        assert!(calls.iter().all(|(filter, _)| filter.sort.is_none() && filter.page.is_none()));
    }

    #[tokio::test]
    async fn replaced_sort_is_forwarded_to_the_backend() {
        let (recording, sort) = stack();
        let books = sort.collection("books").unwrap();
        books.replace_field_sorting("title", Sort::new(vec![SortClause::asc("year")])).unwrap();

        let descending = list_sorted(&books, SortClause::desc("title"), None).await;
        assert_eq!(titles(&descending), vec!["Gomorrah", "Beat the dealer", "Foundation"]);

        let calls = recording.collection("books").unwrap().list_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.sort, Some(Sort::new(vec![SortClause::desc("year")])));
    }

    #[test]
    fn registration_requires_a_column() {
        let (_, sort) = stack();
        let books = sort.collection("books").unwrap();
        assert!(books.emulate_field_sorting("isbn").is_err());
        assert!(books.replace_field_sorting("title", Sort::default()).is_err());
    }
}
