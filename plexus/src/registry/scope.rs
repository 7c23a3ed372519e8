// Declarative visibility filters.
//
// A scope is not an ACL: it shapes which functions a given caller gets to
// see (an LLM menu, an exported signature set), while enforcement stays in
// the registry and engine.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::types::FunctionEntry;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub included_plugins: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_plugins: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_functions: Option<HashSet<String>>,
    /// A function must carry at least one of these tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inclusive_tags: Option<HashSet<String>>,
    /// A function must carry none of these tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive_tags: Option<HashSet<String>>,
    /// Named plugins bypass every other filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_include_plugins: Option<HashSet<String>>,
}

impl Scope {
    pub fn all() -> Self {
        Scope::default()
    }

    pub fn include_plugins<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.included_plugins = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude_plugins<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.excluded_plugins = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude_functions<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        names: I,
    ) -> Self {
        self.excluded_functions = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_inclusive_tags<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        tags: I,
    ) -> Self {
        self.inclusive_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_exclusive_tags<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        tags: I,
    ) -> Self {
        self.exclusive_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn force_include<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.force_include_plugins = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn plugin_allowed(&self, plugin_name: &str) -> bool {
        if let Some(excluded) = &self.excluded_plugins {
            if excluded.contains(plugin_name) {
                return false;
            }
        }
        if let Some(included) = &self.included_plugins {
            if !included.contains(plugin_name) {
                return false;
            }
        }
        true
    }

    pub fn function_allowed(&self, name: &str, tags: &[String]) -> bool {
        if let Some(excluded) = &self.excluded_functions {
            if excluded.contains(name) {
                return false;
            }
        }
        if let Some(inclusive) = &self.inclusive_tags {
            if !tags.iter().any(|t| inclusive.contains(t)) {
                return false;
            }
        }
        if let Some(exclusive) = &self.exclusive_tags {
            if tags.iter().any(|t| exclusive.contains(t)) {
                return false;
            }
        }
        true
    }

    pub fn is_forced(&self, plugin_name: &str) -> bool {
        self.force_include_plugins
            .as_ref()
            .map(|f| f.contains(plugin_name))
            .unwrap_or(false)
    }
}

/// Renders the function menu an interactive caller (typically an LLM) gets
/// to see: one pseudo-signature per visible function, with docs.
pub fn render_menu(functions: &[FunctionEntry]) -> String {
    let mut out = String::new();
    for entry in functions {
        out.push_str(&entry.spec.render_signature());
        out.push('\n');
        if let Some(doc) = &entry.spec.doc {
            out.push_str("    ");
            out.push_str(doc);
            out.push('\n');
        }
        for param in &entry.spec.params {
            if let Some(doc) = &param.doc {
                out.push_str(&format!("    :param {}: {}\n", param.name, doc));
            }
        }
        if let Some(returns) = &entry.spec.returns {
            out.push_str(&format!("    :return: {}\n", returns));
        }
        out.push('\n');
    }
    out
}
