//! Secret provider implementations.

use async_trait::async_trait;
use std::collections::HashMap;
use tollgate_core::Result;
use tollgate_core::ports::SecretProvider;
use tollgate_core::secrets::SecretValue;

/// Environment variable secret provider.
pub struct EnvProvider {
    prefix: Option<String>,
}

impl EnvProvider {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    fn resolve_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(p) => format!("{}_{}", p, name),
            None => name.to_string(),
        }
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl SecretProvider for EnvProvider {
    async fn get(&self, key: &str) -> Result<SecretValue> {
        let env_name = self.resolve_name(key);
        std::env::var(&env_name)
            .map(SecretValue::new)
            .map_err(|_| tollgate_core::Error::SecretNotFound(key.to_string()))
    }

    fn name(&self) -> &str {
        "env"
    }
}

/// File-based secret provider: a flat JSON object of key to value.
pub struct FileProvider {
    secrets: HashMap<String, String>,
}

impl FileProvider {
    pub fn from_map(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    pub async fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            tollgate_core::Error::Internal(format!(
                "Failed to read secrets file {}: {}",
                path.display(),
                e
            ))
        })?;

        let secrets: HashMap<String, String> = serde_json::from_str(&content)?;
        Ok(Self { secrets })
    }
}

#[async_trait]
impl SecretProvider for FileProvider {
    async fn get(&self, key: &str) -> Result<SecretValue> {
        self.secrets
            .get(key)
            .map(SecretValue::new)
            .ok_or_else(|| tollgate_core::Error::SecretNotFound(key.to_string()))
    }

    fn name(&self) -> &str {
        "file"
    }
}
