//! Lookup of data-source implementations by type name.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::data_source::DataSource;

type Constructor = Arc<dyn Fn() -> Box<dyn DataSource> + Send + Sync>;

/// Maps the type name sent in `setContext` to a constructor.
///
/// Cloning is cheap; agent mode shares one registry across connections.
#[derive(Clone, Default)]
pub struct DataSourceRegistry {
    constructors: HashMap<String, Constructor>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `type_name`, built with `T::default()`.
    pub fn register<T>(self, type_name: &str) -> Self
    where
        T: DataSource + Default + 'static,
    {
        self.register_with(type_name, || Box::new(T::default()))
    }

    pub fn register_with<F>(mut self, type_name: &str, constructor: F) -> Self
    where
        F: Fn() -> Box<dyn DataSource> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_name.to_string(), Arc::new(constructor));
        self
    }

    /// Create a fresh instance for one connection.
    pub fn create(&self, type_name: &str) -> Result<Box<dyn DataSource>> {
        let constructor = self
            .constructors
            .get(type_name)
            .ok_or_else(|| anyhow!("The data source type '{}' is not registered.", type_name))?;
        Ok(constructor())
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceRegistry")
            .field("types", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleDataSource;

    #[test]
    fn test_create_registered_type() {
        let registry = DataSourceRegistry::new().register::<SampleDataSource>("sample");
        assert!(registry.create("sample").is_ok());
        assert_eq!(registry.type_names().collect::<Vec<_>>(), vec!["sample"]);
    }

    #[test]
    fn test_unknown_type_names_type() {
        let registry = DataSourceRegistry::new();
        let err = registry.create("Nexus.Sources.Missing").err().unwrap();
        assert_eq!(
            err.to_string(),
            "The data source type 'Nexus.Sources.Missing' is not registered."
        );
    }
}
