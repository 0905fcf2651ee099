//! Container registry credential settings

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Registries the inference container image may be pulled from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry ids a token is requested for. The deployment's own account id
    /// is appended at runtime when known.
    #[serde(default = "default_registry_ids")]
    pub registry_ids: Vec<String>,

    /// Fixed username returned alongside the token (default: "AWS")
    #[serde(default = "default_username")]
    pub username: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_ids: default_registry_ids(),
            username: default_username(),
        }
    }
}

impl RegistryConfig {
    /// Registry ids including `account_id`, deduplicated, order preserved
    pub fn registry_ids_with(&self, account_id: Option<&str>) -> Vec<String> {
        let mut ids: Vec<String> = Vec::with_capacity(self.registry_ids.len() + 1);
        let extra = account_id.map(str::to_string);
        for id in self.registry_ids.iter().cloned().chain(extra) {
            if !id.is_empty() && !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// Shared deep-learning container registry
fn default_registry_ids() -> Vec<String> {
    vec!["763104351884".to_string()]
}

fn default_username() -> String {
    "AWS".to_string()
}

/// Validate registry settings, counting `account_id` as it is appended at runtime
pub fn validate_registry(registry: &RegistryConfig, account_id: Option<&str>) -> Result<()> {
    if registry.username.trim().is_empty() {
        return Err(DispatchError::Config(
            "Registry username must not be empty".to_string(),
        ));
    }
    let ids = registry.registry_ids_with(account_id);
    if ids.is_empty() || ids.len() > 2 {
        return Err(DispatchError::Config(format!(
            "Registry: expected 1 or 2 registry ids including the account, got {} ({})",
            ids.len(),
            ids.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let r = RegistryConfig::default();
        assert_eq!(r.registry_ids, vec!["763104351884"]);
        assert_eq!(r.username, "AWS");
    }

    #[test]
    fn test_registry_ids_with_account() {
        let r = RegistryConfig::default();
        assert_eq!(
            r.registry_ids_with(Some("123456789012")),
            vec!["763104351884", "123456789012"]
        );
        assert_eq!(r.registry_ids_with(None), vec!["763104351884"]);
    }

    #[test]
    fn test_registry_ids_with_duplicate_account() {
        let r = RegistryConfig::default();
        assert_eq!(r.registry_ids_with(Some("763104351884")).len(), 1);
        assert_eq!(r.registry_ids_with(Some("")).len(), 1);
    }

    #[test]
    fn test_validate_registry() {
        assert!(validate_registry(&RegistryConfig::default(), None).is_ok());
        assert!(validate_registry(&RegistryConfig::default(), Some("123456789012")).is_ok());

        let r = RegistryConfig {
            username: " ".into(),
            ..RegistryConfig::default()
        };
        assert!(validate_registry(&r, None).is_err());

        let r = RegistryConfig {
            registry_ids: vec!["1".into(), "2".into(), "3".into()],
            ..RegistryConfig::default()
        };
        assert!(validate_registry(&r, None).is_err());

        let r = RegistryConfig {
            registry_ids: vec![],
            ..RegistryConfig::default()
        };
        assert!(validate_registry(&r, None).is_err());
        assert!(validate_registry(&r, Some("123456789012")).is_ok());
    }

    #[test]
    fn test_validate_registry_counts_account() {
        let r = RegistryConfig {
            registry_ids: vec!["763104351884".into(), "210987654321".into()],
            ..RegistryConfig::default()
        };
        assert!(validate_registry(&r, None).is_ok());
        assert!(validate_registry(&r, Some("210987654321")).is_ok());
        let err = validate_registry(&r, Some("123456789012")).unwrap_err();
        assert!(err.to_string().contains("got 3"));
    }
}
