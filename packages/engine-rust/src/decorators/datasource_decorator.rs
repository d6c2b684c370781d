use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use quarry_core::{Result, ToolkitError};

use crate::collection::{Collection, CollectionRef};
use crate::config::EngineConfig;
use crate::datasource::{Datasource, DatasourceRef};

// ---------------------------------------------------------------------------
// DecoratorFactory
// ---------------------------------------------------------------------------

/// A collection decorator that a [`DatasourceDecorator`] can instantiate for
/// each collection of its child datasource.
///
/// `datasource` points back at the layer being built, so a decorator can
/// reach its sibling decorators (same layer, other collections) once the
/// layer is complete.
pub trait DecoratorFactory: Collection + Sized + 'static {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self;
}

// ---------------------------------------------------------------------------
// DatasourceDecorator
// ---------------------------------------------------------------------------

/// One layer of the decorator stack: the same decorator type applied to
/// every collection of a child datasource.
pub struct DatasourceDecorator<C> {
    child: DatasourceRef,
    config: Arc<EngineConfig>,
    order: Vec<String>,
    collections: BTreeMap<String, Arc<C>>,
}

impl<C: DecoratorFactory> DatasourceDecorator<C> {
    /// Wraps every collection of `child` in a `C`.
    #[must_use]
    pub fn new(child: DatasourceRef, config: Arc<EngineConfig>) -> Arc<Self> {
        Arc::new_cyclic(|layer: &Weak<Self>| {
            let mut order = Vec::new();
            let mut collections = BTreeMap::new();
            for collection in child.collections() {
                let name = collection.name().to_string();
                collections.insert(name.clone(), Arc::new(C::wrap(collection, layer.clone())));
                order.push(name);
            }
            Self { child, config, order, collections }
        })
    }

    /// The datasource this layer decorates.
    #[must_use]
    pub fn child(&self) -> &DatasourceRef {
        &self.child
    }

    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Typed access to one decorator of this layer, by its current name.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Datasource`] for unknown names and for the
    /// former name of a renamed collection.
    pub fn collection(&self, name: &str) -> Result<Arc<C>> {
        if let Some(collection) = self.collections.get(name).filter(|collection| collection.name() == name) {
            return Ok(collection.clone());
        }
        // Collections renamed below this layer keep their original key.
        if let Some(collection) = self.decorators().into_iter().find(|collection| collection.name() == name) {
            return Ok(collection);
        }
        if let Some(renamed) = self.collections.get(name) {
            return Err(ToolkitError::datasource(format!(
                "collection '{name}' has been renamed to '{}'",
                renamed.name()
            )));
        }
        Err(ToolkitError::datasource(format!(
            "collection '{name}' not found, available collections are: {}",
            self.collection_names().join(", ")
        )))
    }

    /// Every decorator of this layer, in the child's order.
    #[must_use]
    pub fn decorators(&self) -> Vec<Arc<C>> {
        self.order.iter().filter_map(|name| self.collections.get(name).cloned()).collect()
    }
}

impl<C: DecoratorFactory> Datasource for DatasourceDecorator<C> {
    fn name(&self) -> &str {
        self.child.name()
    }

    fn collections(&self) -> Vec<CollectionRef> {
        self.decorators().into_iter().map(|collection| collection as CollectionRef).collect()
    }

    fn get_collection(&self, name: &str) -> Result<CollectionRef> {
        self.collection(name).map(|collection| collection as CollectionRef)
    }
}
