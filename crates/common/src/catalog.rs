use dashmap::DashMap;

use crate::plan::PartitionKey;

/// Where a partition's data is best read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationHint {
    pub container_id: String,
}

impl LocationHint {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
        }
    }
}

/// Lookup from partition key to the containers best positioned to scan it.
///
/// An empty answer is valid and makes the dispatcher fall back to load based
/// placement.
pub trait CatalogLookup: Send + Sync {
    fn locate(&self, key: &PartitionKey) -> Vec<LocationHint>;
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    locations: DashMap<PartitionKey, Vec<LocationHint>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `container_id` holds `key`. Repeated hints are kept once.
    pub fn add_location(&self, key: impl Into<PartitionKey>, container_id: impl Into<String>) {
        let hint = LocationHint::new(container_id);
        let mut hints = self.locations.entry(key.into()).or_default();
        if !hints.contains(&hint) {
            hints.push(hint);
        }
    }

    /// Forgets every hint naming `container_id`.
    pub fn remove_container(&self, container_id: &str) {
        for mut entry in self.locations.iter_mut() {
            entry.value_mut().retain(|hint| hint.container_id != container_id);
        }
        self.locations.retain(|_, hints| !hints.is_empty());
    }
}

impl CatalogLookup for MemoryCatalog {
    fn locate(&self, key: &PartitionKey) -> Vec<LocationHint> {
        self.locations
            .get(key)
            .map(|hints| hints.value().clone())
            .unwrap_or_default()
    }
}
