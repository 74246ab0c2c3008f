//! Model catalog entries and alias resolution.

use serde::{Deserialize, Serialize};

/// One model advertised by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Stable model identifier accepted by the backend.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: String,
    /// Free-form feature tags ("chat", "tools", "vision", ...).
    #[serde(default)]
    pub features: Vec<String>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            features: Vec::new(),
        }
    }

    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.features = features.iter().map(|f| (*f).to_string()).collect();
        self
    }
}

/// Resolve a requested model id against a provider catalog.
///
/// An exact id match wins; otherwise a case-insensitive display-name match is
/// treated as an alias. With an empty catalog (or no match) the requested id
/// is returned unchanged so the backend gets the final say.
pub fn resolve_model_id(requested: &str, models: &[ModelInfo]) -> String {
    if models.iter().any(|m| m.id == requested) {
        return requested.to_string();
    }
    if let Some(hit) = models
        .iter()
        .find(|m| m.display_name.eq_ignore_ascii_case(requested))
    {
        return hit.id.clone();
    }
    requested.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<ModelInfo> {
        vec![
            ModelInfo::new("claude-3-5-haiku-20241022", "Claude 3.5 Haiku"),
            ModelInfo::new("claude-sonnet-4-20250514", "Claude Sonnet 4"),
        ]
    }

    #[test]
    fn test_exact_id_match() {
        assert_eq!(
            resolve_model_id("claude-sonnet-4-20250514", &catalog()),
            "claude-sonnet-4-20250514"
        );
    }

    #[test]
    fn test_display_name_alias() {
        assert_eq!(
            resolve_model_id("claude 3.5 haiku", &catalog()),
            "claude-3-5-haiku-20241022"
        );
    }

    #[test]
    fn test_empty_catalog_returns_unchanged() {
        assert_eq!(resolve_model_id("anything", &[]), "anything");
    }

    #[test]
    fn test_unknown_model_returns_unchanged() {
        assert_eq!(resolve_model_id("gpt-7", &catalog()), "gpt-7");
    }
}
