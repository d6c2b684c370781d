use quarry_core::{Projection, Result, Sort};

use super::field::validate_field;
use crate::collection::Collection;
use crate::datasource::Datasource;

/// Every projected path must name a column.
///
/// # Errors
///
/// See [`validate_field`].
pub fn validate_projection(datasource: &dyn Datasource, collection: &dyn Collection, projection: &Projection) -> Result<()> {
    projection.iter().try_for_each(|path| validate_field(datasource, collection, path, &[]))
}

/// Every sort clause must name a column.
///
/// # Errors
///
/// See [`validate_field`].
pub fn validate_sort(datasource: &dyn Datasource, collection: &dyn Collection, sort: &Sort) -> Result<()> {
    sort.clauses().try_for_each(|clause| validate_field(datasource, collection, &clause.field, &[]))
}
