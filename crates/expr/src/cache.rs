//! Compile-once cache for leaf templates.
//!
//! Templates repeat the same short strings constantly (`"{{item.text}}"`,
//! headers, separators). The cache is owned by whoever compiles templates
//! and keyed by the exact leaf source.

use crate::leaf::CompiledLeaf;
use promptloom_core::ExprError;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Leaf source → compiled leaf.
#[derive(Debug, Default)]
pub struct LeafCache {
    leaves: RwLock<HashMap<String, Arc<CompiledLeaf>>>,
}

impl LeafCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached leaf for `source`, compiling it on first use.
    ///
    /// Parse failures are not cached.
    pub fn get_or_compile(&self, source: &str) -> Result<Arc<CompiledLeaf>, ExprError> {
        if let Some(leaf) = self
            .leaves
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
        {
            return Ok(Arc::clone(leaf));
        }

        let compiled = Arc::new(CompiledLeaf::compile(source)?);
        tracing::trace!(len = source.len(), templated = compiled.has_variables(), "leaf compiled");
        let mut leaves = self.leaves.write().unwrap_or_else(PoisonError::into_inner);
        let entry = leaves
            .entry(source.to_string())
            .or_insert_with(|| Arc::clone(&compiled));
        Ok(Arc::clone(entry))
    }

    /// Number of distinct leaves compiled so far.
    pub fn len(&self) -> usize {
        self.leaves
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.leaves
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_source_compiles_once() {
        let cache = LeafCache::new();
        let a = cache.get_or_compile("Hello {{name}}").unwrap();
        let b = cache.get_or_compile("Hello {{name}}").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        cache.get_or_compile("Other").unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = LeafCache::new();
        assert!(cache.get_or_compile("{{#if x}}").is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_empties_cache() {
        let cache = LeafCache::new();
        cache.get_or_compile("a").unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }
}
