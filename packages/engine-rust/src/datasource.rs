//! Datasources: named sets of collections.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use quarry_core::{Result, ToolkitError};
use tracing::warn;

use crate::collection::CollectionRef;

/// Shared handle to a datasource.
pub type DatasourceRef = Arc<dyn Datasource>;

/// A set of collections addressable by name.
pub trait Datasource: Send + Sync {
    /// Human-readable name, used in diagnostics only.
    fn name(&self) -> &str {
        "datasource"
    }

    /// Every collection, in registration order.
    fn collections(&self) -> Vec<CollectionRef>;

    /// Looks a collection up by name.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Datasource`] when no collection has that name.
    fn get_collection(&self, name: &str) -> Result<CollectionRef>;

    /// Collection names, in registration order.
    fn collection_names(&self) -> Vec<String> {
        self.collections().iter().map(|collection| collection.name().to_string()).collect()
    }
}

// ---------------------------------------------------------------------------
// BaseDatasource
// ---------------------------------------------------------------------------

/// Datasource backed by a registry of collections.
///
/// Lookups go through a [`DashMap`]; registration order is kept separately so
/// `collections()` is deterministic.
pub struct BaseDatasource {
    name: String,
    by_name: DashMap<String, CollectionRef>,
    order: RwLock<Vec<String>>,
}

impl BaseDatasource {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), by_name: DashMap::new(), order: RwLock::new(Vec::new()) }
    }

    /// Registers a collection.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Datasource`] when the name is already taken.
    pub fn add_collection(&self, collection: CollectionRef) -> Result<()> {
        let name = collection.name().to_string();
        let mut order = self.order.write();
        if self.by_name.contains_key(&name) {
            return Err(ToolkitError::datasource(format!(
                "collection '{name}' already defined in datasource"
            )));
        }
        self.by_name.insert(name.clone(), collection);
        order.push(name);
        Ok(())
    }
}

impl Datasource for BaseDatasource {
    fn name(&self) -> &str {
        &self.name
    }

    fn collections(&self) -> Vec<CollectionRef> {
        self.order
            .read()
            .iter()
            .filter_map(|name| self.by_name.get(name).map(|entry| entry.value().clone()))
            .collect()
    }

    fn get_collection(&self, name: &str) -> Result<CollectionRef> {
        self.by_name.get(name).map(|entry| entry.value().clone()).ok_or_else(|| {
            ToolkitError::datasource(format!(
                "collection '{name}' not found, available collections are: {}",
                self.order.read().join(", ")
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// CompositeDatasource
// ---------------------------------------------------------------------------

/// Several datasources exposed as one.
///
/// Collection names must be unique across members; lookups return the first
/// member that knows the name.
#[derive(Default)]
pub struct CompositeDatasource {
    members: RwLock<Vec<DatasourceRef>>,
}

impl CompositeDatasource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member datasource.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Datasource`] when one of its collections is
    /// already exposed by another member.
    pub fn add_datasource(&self, datasource: DatasourceRef) -> Result<()> {
        let mut members = self.members.write();
        for name in datasource.collection_names() {
            if members.iter().any(|member| member.get_collection(&name).is_ok()) {
                return Err(ToolkitError::datasource(format!("collection '{name}' already exists")));
            }
        }
        if members.iter().any(|member| member.name() == datasource.name()) {
            warn!(
                datasource = datasource.name(),
                "a datasource with this name is already registered"
            );
        }
        members.push(datasource);
        Ok(())
    }

    /// Member datasources, in registration order.
    #[must_use]
    pub fn datasources(&self) -> Vec<DatasourceRef> {
        self.members.read().clone()
    }
}

impl Datasource for CompositeDatasource {
    fn name(&self) -> &str {
        "composite"
    }

    fn collections(&self) -> Vec<CollectionRef> {
        self.members.read().iter().flat_map(|member| member.collections()).collect()
    }

    fn get_collection(&self, name: &str) -> Result<CollectionRef> {
        let members = self.members.read().clone();
        if let Some(found) = members.iter().find_map(|member| member.get_collection(name).ok()) {
            return Ok(found);
        }
        let mut names: Vec<String> = members.iter().flat_map(|member| member.collection_names()).collect();
        names.sort();
        Err(ToolkitError::datasource(format!(
            "collection '{name}' not found, available collections are: {}",
            names.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::{CollectionSchema, ColumnSchema, PrimitiveType};

    use super::*;
    use crate::memory::MemoryDatasource;

    fn schema() -> CollectionSchema {
        CollectionSchema::new().with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
    }

    #[test]
    fn base_datasource_rejects_duplicates_and_lists_names() {
        let memory = MemoryDatasource::new()
            .with_collection("books", schema(), Vec::new())
            .with_collection("authors", schema(), Vec::new());
        let datasource = BaseDatasource::new("main");
        for collection in memory.collections() {
            datasource.add_collection(collection).unwrap();
        }
        let books = memory.get_collection("books").unwrap();
        assert!(matches!(datasource.add_collection(books), Err(ToolkitError::Datasource(_))));
        assert_eq!(datasource.collection_names(), vec!["books", "authors"]);

        let err = datasource.get_collection("nope").err().unwrap();
        assert!(err.to_string().contains("books, authors"));
    }

    #[test]
    fn composite_checks_duplicates_across_members() {
        let composite = CompositeDatasource::new();
        composite
            .add_datasource(Arc::new(MemoryDatasource::new().with_collection("books", schema(), Vec::new())))
            .unwrap();
        composite
            .add_datasource(Arc::new(MemoryDatasource::new().with_collection("authors", schema(), Vec::new())))
            .unwrap();
        let duplicate = Arc::new(MemoryDatasource::new().with_collection("books", schema(), Vec::new()));
        assert!(composite.add_datasource(duplicate).is_err());

        assert_eq!(composite.get_collection("authors").unwrap().name(), "authors");
        let err = composite.get_collection("zebras").err().unwrap();
        assert!(err.to_string().ends_with("authors, books"));
    }
}
