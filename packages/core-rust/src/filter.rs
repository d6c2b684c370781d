//! Filters: which records an operation targets.

use chrono::FixedOffset;

use crate::condition_tree::{factory, ConditionTree};
use crate::error::{Result, ToolkitError};
use crate::page::Page;
use crate::sort::Sort;

/// Condition tree plus the search/segment inputs backends interpret
/// themselves.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    pub condition_tree: Option<ConditionTree>,
    pub search: Option<String>,
    pub search_extended: bool,
    pub segment: Option<String>,
    /// Timezone relative date operators are evaluated in.
    pub timezone: Option<FixedOffset>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter holding only a condition tree.
    #[must_use]
    pub fn from_tree(condition_tree: ConditionTree) -> Self {
        Self { condition_tree: Some(condition_tree), ..Self::default() }
    }

    #[must_use]
    pub fn with_condition_tree(mut self, condition_tree: Option<ConditionTree>) -> Self {
        self.condition_tree = condition_tree;
        self
    }

    #[must_use]
    pub fn with_search(mut self, search: impl Into<String>, extended: bool) -> Self {
        self.search = Some(search.into());
        self.search_extended = extended;
        self
    }

    #[must_use]
    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    #[must_use]
    pub fn with_timezone(mut self, timezone: FixedOffset) -> Self {
        self.timezone = Some(timezone);
        self
    }

    /// Same filter with `tree` ANDed into its condition tree.
    #[must_use]
    pub fn intersect_with(mut self, tree: Option<ConditionTree>) -> Self {
        self.condition_tree = factory::intersect(self.condition_tree.take().into_iter().chain(tree));
        self
    }

    /// Only filters without search or segment can move across a relation.
    #[must_use]
    pub fn is_nestable(&self) -> bool {
        self.search.as_deref().map_or(true, str::is_empty) && self.segment.is_none()
    }

    /// Re-targets the filter at the collection behind relation `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::ConditionTree`] when the filter carries a
    /// search or a segment.
    pub fn nest(&self, prefix: &str) -> Result<Filter> {
        if !self.is_nestable() {
            return Err(ToolkitError::condition_tree("filter can't be nested"));
        }
        Ok(Filter {
            condition_tree: self.condition_tree.as_ref().map(|tree| tree.nest(prefix)),
            ..self.clone()
        })
    }
}

/// [`Filter`] plus ordering and pagination, used by `list`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PaginatedFilter {
    pub filter: Filter,
    pub sort: Option<Sort>,
    pub page: Option<Page>,
}

impl PaginatedFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_tree(condition_tree: ConditionTree) -> Self {
        Self::from_base_filter(Filter::from_tree(condition_tree))
    }

    #[must_use]
    pub fn from_base_filter(filter: Filter) -> Self {
        Self { filter, sort: None, page: None }
    }

    /// Drops sort and page.
    #[must_use]
    pub fn to_base_filter(&self) -> Filter {
        self.filter.clone()
    }

    #[must_use]
    pub fn condition_tree(&self) -> Option<&ConditionTree> {
        self.filter.condition_tree.as_ref()
    }

    #[must_use]
    pub fn with_condition_tree(mut self, condition_tree: Option<ConditionTree>) -> Self {
        self.filter.condition_tree = condition_tree;
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort: Option<Sort>) -> Self {
        self.sort = sort;
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: Option<Page>) -> Self {
        self.page = page;
        self
    }

    #[must_use]
    pub fn intersect_with(mut self, tree: Option<ConditionTree>) -> Self {
        self.filter = self.filter.intersect_with(tree);
        self
    }

    #[must_use]
    pub fn is_nestable(&self) -> bool {
        self.filter.is_nestable()
    }

    /// Nests the condition tree and the sort under relation `prefix`.
    ///
    /// # Errors
    ///
    /// See [`Filter::nest`].
    pub fn nest(&self, prefix: &str) -> Result<PaginatedFilter> {
        Ok(PaginatedFilter {
            filter: self.filter.nest(prefix)?,
            sort: self.sort.as_ref().map(|sort| sort.nest(prefix)),
            page: self.page,
        })
    }
}

impl From<Filter> for PaginatedFilter {
    fn from(filter: Filter) -> Self {
        Self::from_base_filter(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Operator;
    use crate::sort::SortClause;

    #[test]
    fn search_and_segment_prevent_nesting() {
        let tree = ConditionTree::leaf("name", Operator::Equal, "x");
        assert!(Filter::from_tree(tree.clone()).nest("author").is_ok());
        assert!(Filter::from_tree(tree.clone()).with_search("x", false).nest("author").is_err());
        assert!(Filter::from_tree(tree).with_segment("active").nest("author").is_err());
    }

    #[test]
    fn paginated_nest_moves_sort_too() {
        let filter = PaginatedFilter::from_tree(ConditionTree::leaf("name", Operator::Equal, "x"))
            .with_sort(Some(Sort::new(vec![SortClause::asc("name")])))
            .with_page(Some(Page::new(0, Some(5))));
        let nested = filter.nest("author").unwrap();
        assert_eq!(nested.condition_tree().map(ToString::to_string).as_deref(), Some("author:name equal x"));
        assert_eq!(nested.sort.unwrap().0[0].field, "author:name");
        assert_eq!(nested.page, Some(Page::new(0, Some(5))));
    }

    #[test]
    fn intersect_with_merges_trees() {
        let a = ConditionTree::leaf("a", Operator::Equal, 1);
        let b = ConditionTree::leaf("b", Operator::Equal, 2);
        let filter = Filter::from_tree(a.clone()).intersect_with(Some(b.clone()));
        assert_eq!(filter.condition_tree, Some(ConditionTree::and(vec![a, b.clone()])));
        assert_eq!(Filter::new().intersect_with(Some(b.clone())).condition_tree, Some(b));
        assert_eq!(Filter::new().intersect_with(None).condition_tree, None);
    }

    #[test]
    fn base_filter_round_trip_drops_pagination() {
        let base = Filter::from_tree(ConditionTree::leaf("a", Operator::Equal, 1)).with_segment("s");
        let paginated = PaginatedFilter::from_base_filter(base.clone()).with_page(Some(Page::new(1, None)));
        assert_eq!(paginated.to_base_filter(), base);
    }
}
