//! Name lookup for point descriptors
//!
//! Every name a point answers to (its full name and each
//! `source.alias`) maps to the same descriptor. The registry only grows.

use crate::error::{EngineError, Result};
use crate::point::PointDescriptor;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Inner {
    by_name: BTreeMap<String, Arc<PointDescriptor>>,
    /// Unique points in registration order
    points: Vec<Arc<PointDescriptor>>,
}

/// Append-only point table
#[derive(Default)]
pub struct PointRegistry {
    inner: RwLock<Inner>,
}

impl PointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a point under all of its names.
    ///
    /// Fails if the full name is taken. An alias that is already taken is
    /// skipped with a warning and the point is registered without it.
    pub fn register(&self, point: Arc<PointDescriptor>) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let full = point.full_name().to_string();
        if inner.by_name.contains_key(&full) {
            return Err(EngineError::Config(format!(
                "({}) Point already defined, later definition ignored",
                full
            )));
        }

        inner.by_name.insert(full.clone(), point.clone());
        for alias in point.info().alias_names() {
            if alias == full {
                continue;
            }
            if inner.by_name.contains_key(&alias) {
                tracing::warn!("({}) Alias {} already in use, skipped", full, alias);
                continue;
            }
            inner.by_name.insert(alias, point.clone());
        }
        inner.points.push(point);
        tracing::debug!("Registered point {}", full);
        Ok(())
    }

    /// Look up by full name or alias
    pub fn get(&self, name: &str) -> Option<Arc<PointDescriptor>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_name
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_name
            .contains_key(name)
    }

    /// Every point once, in registration order
    pub fn points(&self) -> Vec<Arc<PointDescriptor>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .points
            .clone()
    }

    /// Every registered name, sorted
    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_name
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .points
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointRegistry")
            .field("points", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::PointInfo;

    fn point(source: &str, names: &[&str]) -> Arc<PointDescriptor> {
        let mut info = PointInfo::new(source, names[0]);
        info.names = names.iter().map(|s| s.to_string()).collect();
        Arc::new(PointDescriptor::new(info, Vec::new()))
    }

    #[test]
    fn test_aliases_resolve_to_same_point() {
        let registry = PointRegistry::new();
        registry.register(point("ant", &["temp", "t"])).unwrap();

        let a = registry.get("ant.temp").unwrap();
        let b = registry.get("ant.t").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["ant.t", "ant.temp"]);
    }

    #[test]
    fn test_first_registration_wins() {
        let registry = PointRegistry::new();
        let first = point("ant", &["temp"]);
        registry.register(first.clone()).unwrap();
        assert!(registry.register(point("ant", &["temp"])).is_err());
        assert!(Arc::ptr_eq(&registry.get("ant.temp").unwrap(), &first));
    }

    #[test]
    fn test_taken_alias_is_skipped() {
        let registry = PointRegistry::new();
        registry.register(point("ant", &["temp", "x"])).unwrap();
        registry.register(point("ant", &["humidity", "x"])).unwrap();

        assert_eq!(registry.get("ant.x").unwrap().full_name(), "ant.temp");
        assert!(registry.contains("ant.humidity"));
        assert_eq!(registry.points().len(), 2);
    }
}
