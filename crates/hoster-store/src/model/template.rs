use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use hoster_core::resources::ResourceSpec;
use serde::{Deserialize, Serialize};

/// Declared variable types. `password` values are treated as secrets by the
/// surface layer; the core only substitutes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Password,
    Integer,
    Boolean,
}

/// A variable a template exposes for per-deployment customization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// A file materialized into the deployment's config directory before start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFileSpec {
    /// Relative path under the deployment's config directory.
    pub path: String,
    pub content: String,
    /// Unix permission bits, e.g. `0o600`.
    pub mode: u32,
}

/// A deployable blueprint. Content is frozen by `published`; only the catalog
/// fields (category, tags, price) stay mutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub reference_id: String,
    pub creator_id: i64,
    /// Globally unique, URL-safe.
    pub slug: String,
    pub name: String,
    /// Semver string, captured onto deployments at create time.
    pub version: String,
    /// Opaque compose text, interpreted only by the container runtime after
    /// variable substitution.
    pub compose_spec: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    #[serde(default)]
    pub config_files: Vec<ConfigFileSpec>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    pub resources: ResourceSpec,
    pub published: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Monthly price in cents. Zero means free.
    #[serde(default)]
    pub price_cents: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// Default variable values, the base layer under per-deployment values.
    pub fn default_variables(&self) -> BTreeMap<String, String> {
        self.variables
            .iter()
            .filter_map(|v| v.default.clone().map(|d| (v.name.clone(), d)))
            .collect()
    }

    /// Names of declared required variables.
    pub fn required_variables(&self) -> impl Iterator<Item = &str> {
        self.variables
            .iter()
            .filter(|v| v.required)
            .map(|v| v.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_type_serializes_lowercase() {
        let v = TemplateVariable {
            name: "DB_PASSWORD".to_string(),
            kind: VariableType::Password,
            default: None,
            required: true,
        };
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains(r#""type":"password""#));
    }

    #[test]
    fn default_variables_skip_undefaulted() {
        let tmpl = Template {
            id: 1,
            reference_id: "tmpl_abcd1234".to_string(),
            creator_id: 1,
            slug: "web".to_string(),
            name: "Web".to_string(),
            version: "1.0.0".to_string(),
            compose_spec: String::new(),
            variables: vec![
                TemplateVariable {
                    name: "PORT".to_string(),
                    kind: VariableType::Integer,
                    default: Some("8080".to_string()),
                    required: false,
                },
                TemplateVariable {
                    name: "SECRET".to_string(),
                    kind: VariableType::Password,
                    default: None,
                    required: true,
                },
            ],
            config_files: vec![],
            required_capabilities: BTreeSet::new(),
            resources: ResourceSpec::default(),
            published: false,
            category: None,
            tags: vec![],
            price_cents: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let defaults = tmpl.default_variables();
        assert_eq!(defaults.get("PORT").map(String::as_str), Some("8080"));
        assert!(!defaults.contains_key("SECRET"));
        assert_eq!(tmpl.required_variables().collect::<Vec<_>>(), ["SECRET"]);
    }
}
