//! Model registry.
//!
//! The set of accepted model identifiers is fixed when the process starts and
//! read-only afterwards. Adding a model means a restart with new config.

use std::collections::BTreeSet;
use std::sync::Arc;

/// Immutable set of accepted model identifiers.
///
/// Cloning is cheap: all clones share one allocation.
///
/// # Example
///
/// ```rust
/// use tokio_prompt_admission::ModelRegistry;
/// let registry = ModelRegistry::new(["gpt4", "gpt5"]);
/// assert!(registry.contains("gpt4"));
/// assert!(!registry.contains("llama"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistry {
    models: Arc<BTreeSet<String>>,
}

impl ModelRegistry {
    /// Build a registry from model names. Duplicates collapse.
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: Arc::new(models.into_iter().map(Into::into).collect()),
        }
    }

    /// Exact membership test.
    pub fn contains(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns `true` if no model is registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Registered models in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_exact() {
        let registry = ModelRegistry::new(["gpt4"]);
        assert!(registry.contains("gpt4"));
        assert!(!registry.contains("GPT4"));
        assert!(!registry.contains("gpt4 "));
        assert!(!registry.contains(""));
    }

    #[test]
    fn test_duplicates_collapse() {
        let registry = ModelRegistry::new(["gpt4", "gpt4", "gpt3"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.iter().collect::<Vec<_>>(), vec!["gpt3", "gpt4"]);
    }

    #[test]
    fn test_clones_share_contents() {
        let a = ModelRegistry::new(["gpt5"]);
        let b = a.clone();
        assert_eq!(a, b);
        assert!(b.contains("gpt5"));
    }

    #[test]
    fn test_empty_registry_accepts_nothing() {
        let registry = ModelRegistry::new(Vec::<String>::new());
        assert!(registry.is_empty());
        assert!(!registry.contains("gpt4"));
    }
}
