//! Read-only language lookup shared by in-flight requests

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ConfigError, Language};

/// Language ID to adapter mapping, loaded once at startup.
///
/// Cloning is cheap; every clone shares the same immutable table.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: Arc<HashMap<String, Language>>,
}

impl LanguageRegistry {
    pub fn new(languages: HashMap<String, Language>) -> Self {
        Self {
            languages: Arc::new(languages),
        }
    }

    /// Resolve a language ID to its adapter
    pub fn resolve(&self, id: &str) -> Result<&Language, ConfigError> {
        self.languages
            .get(id)
            .ok_or_else(|| ConfigError::LanguageNotFound(id.to_string()))
    }

    /// Language IDs in sorted order
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.languages.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Iterate over `(id, language)` pairs sorted by ID
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Language)> {
        self.ids()
            .into_iter()
            .filter_map(move |id| self.languages.get(id).map(|lang| (id, lang)))
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}
