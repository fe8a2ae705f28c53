//! Compiled-template cache keyed by `(id, version)`.

use crate::compiled::CompiledTemplate;
use crate::compiler::TemplateCompiler;
use crate::model::Template;
use promptloom_core::CompileError;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Compile-once store for templates.
///
/// Bumping a template's `version` compiles it afresh; the old entry stays
/// until [`evict`](Self::evict) or [`clear`](Self::clear).
#[derive(Debug, Default)]
pub struct TemplateCache {
    compiler: TemplateCompiler,
    templates: RwLock<HashMap<(String, u32), Arc<CompiledTemplate>>>,
}

impl TemplateCache {
    pub fn new(compiler: TemplateCompiler) -> Self {
        Self {
            compiler,
            templates: RwLock::default(),
        }
    }

    pub fn compiler(&self) -> &TemplateCompiler {
        &self.compiler
    }

    pub fn get(&self, id: &str, version: u32) -> Option<Arc<CompiledTemplate>> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(id.to_string(), version))
            .cloned()
    }

    /// Return the compiled template, compiling it on first request.
    pub fn get_or_compile(&self, template: &Template) -> Result<Arc<CompiledTemplate>, CompileError> {
        if let Some(hit) = self.get(&template.id, template.version) {
            return Ok(hit);
        }

        let compiled = Arc::new(self.compiler.compile(template)?);
        debug!(template = %template.id, version = template.version, "caching compiled template");
        let mut templates = self.templates.write().unwrap_or_else(PoisonError::into_inner);
        let entry = templates
            .entry((template.id.clone(), template.version))
            .or_insert(compiled);
        Ok(Arc::clone(entry))
    }

    pub fn evict(&self, id: &str, version: u32) -> bool {
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(id.to_string(), version))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(version: u32) -> Template {
        serde_json::from_value(json!({
            "id": "t",
            "name": "T",
            "version": version,
            "layout": [{"kind": "message", "role": "system", "content": "v{{v}}"}]
        }))
        .unwrap()
    }

    #[test]
    fn same_version_is_shared() {
        let cache = TemplateCache::default();
        let a = cache.get_or_compile(&template(1)).unwrap();
        let b = cache.get_or_compile(&template(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn new_version_compiles_again() {
        let cache = TemplateCache::default();
        let a = cache.get_or_compile(&template(1)).unwrap();
        let b = cache.get_or_compile(&template(2)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);

        assert!(cache.evict("t", 1));
        assert!(cache.get("t", 1).is_none());
        assert!(cache.get("t", 2).is_some());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn compile_errors_are_not_cached() {
        let cache = TemplateCache::default();
        let mut bad = template(1);
        bad.layout.push(crate::model::LayoutNode::Slot(crate::model::LayoutSlot {
            name: "ghost".into(),
            header: None,
            footer: None,
            omit_if_empty: None,
        }));
        assert!(cache.get_or_compile(&bad).is_err());
        assert!(cache.is_empty());
    }
}
