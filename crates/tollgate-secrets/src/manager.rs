//! Secret manager for resolving step secret references.

use std::collections::HashMap;
use std::sync::Arc;
use tollgate_core::Result;
use tollgate_core::pipeline::SecretReference;
use tollgate_core::ports::SecretProvider;
use tracing::{debug, info, warn};

/// Configuration for the secret manager.
#[derive(Debug, Clone)]
pub struct SecretManagerConfig {
    /// Provider used when a reference names none.
    pub default_provider: String,
}

impl Default for SecretManagerConfig {
    fn default() -> Self {
        Self {
            default_provider: "env".to_string(),
        }
    }
}

/// Secret manager for resolving secrets from multiple providers.
pub struct SecretManager {
    config: SecretManagerConfig,
    providers: HashMap<String, Arc<dyn SecretProvider>>,
}

impl SecretManager {
    /// Create a new secret manager.
    pub fn new(config: SecretManagerConfig) -> Self {
        Self {
            config,
            providers: HashMap::new(),
        }
    }

    /// Register a secret provider.
    pub fn register_provider(&mut self, provider: Arc<dyn SecretProvider>) {
        info!(provider = %provider.name(), "Registering secret provider");
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Resolve a single secret reference.
    ///
    /// Returns `None` for a missing optional secret.
    pub async fn resolve(&self, reference: &SecretReference) -> Result<Option<String>> {
        let provider_key = reference
            .provider
            .as_deref()
            .unwrap_or(&self.config.default_provider);

        let provider = self.providers.get(provider_key).ok_or_else(|| {
            tollgate_core::Error::SecretProviderNotConfigured(provider_key.to_string())
        })?;

        let key = reference.key.as_deref().unwrap_or(&reference.name);

        match provider.get(key).await {
            Ok(value) => {
                debug!(name = %reference.name, provider = %provider_key, "Secret resolved");
                Ok(Some(value.value))
            }
            Err(tollgate_core::Error::SecretNotFound(_)) if !reference.required => {
                warn!(name = %reference.name, provider = %provider_key, "Optional secret not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve references into an environment map keyed by reference name.
    pub async fn resolve_all(
        &self,
        references: &[SecretReference],
    ) -> Result<HashMap<String, String>> {
        let mut result = HashMap::new();

        for reference in references {
            if let Some(value) = self.resolve(reference).await? {
                result.insert(reference.name.clone(), value);
            }
        }

        Ok(result)
    }
}

impl Default for SecretManager {
    fn default() -> Self {
        Self::new(SecretManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FileProvider;

    fn reference(name: &str, key: Option<&str>, required: bool) -> SecretReference {
        SecretReference {
            name: name.to_string(),
            key: key.map(str::to_string),
            provider: Some("file".to_string()),
            required,
        }
    }

    fn manager() -> SecretManager {
        let mut secrets = HashMap::new();
        secrets.insert("PYPI_USERNAME".to_string(), "__token__".to_string());
        secrets.insert("PYPI_PASSWORD".to_string(), "hunter2".to_string());

        let mut manager = SecretManager::default();
        manager.register_provider(Arc::new(FileProvider::from_map(secrets)));
        manager
    }

    #[tokio::test]
    async fn test_resolve_all_maps_keys_to_env_names() {
        let env = manager()
            .resolve_all(&[
                reference("TWINE_USERNAME", Some("PYPI_USERNAME"), true),
                reference("TWINE_PASSWORD", Some("PYPI_PASSWORD"), true),
            ])
            .await
            .unwrap();

        assert_eq!(env.get("TWINE_USERNAME").map(String::as_str), Some("__token__"));
        assert_eq!(env.get("TWINE_PASSWORD").map(String::as_str), Some("hunter2"));
    }

    #[tokio::test]
    async fn test_missing_required_secret_is_an_error() {
        let err = manager()
            .resolve(&reference("TOKEN", None, true))
            .await
            .unwrap_err();
        assert!(matches!(err, tollgate_core::Error::SecretNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_optional_secret_is_skipped() {
        let env = manager()
            .resolve_all(&[reference("CODECOV_TOKEN", None, false)])
            .await
            .unwrap();
        assert!(env.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let mut r = reference("TOKEN", None, true);
        r.provider = Some("vault".to_string());

        let err = manager().resolve(&r).await.unwrap_err();
        assert!(matches!(
            err,
            tollgate_core::Error::SecretProviderNotConfigured(_)
        ));
    }
}
