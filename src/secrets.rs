//! API token retrieval.
//!
//! The cloud secret store is an external collaborator; `SecretStore` is the
//! seam. `EnvSecretStore` resolves a secret path from the process
//! environment (including a `.env` file loaded at startup).

use async_trait::async_trait;

use crate::config::Environment;
use crate::error::{Result, SyncError};
use crate::sheets::client::ACCESS_TOKEN_VAR;

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the secret stored at `path`.
    async fn fetch(&self, path: &str) -> Result<String>;
}

/// Environment variable name for a secret path:
/// `staging/smartsheet-data-sync/svc-api-token` →
/// `STAGING_SMARTSHEET_DATA_SYNC_SVC_API_TOKEN`.
pub fn secret_env_var(path: &str) -> String {
    path.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Reads secrets from environment variables.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch(&self, path: &str) -> Result<String> {
        let candidates = [secret_env_var(path), ACCESS_TOKEN_VAR.to_string()];
        candidates
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
            .ok_or_else(|| {
                SyncError::configuration(format!(
                    "No secret found for '{}' (set {})",
                    path, candidates[0]
                ))
            })
    }
}

/// Fetch the API token for `env` and export it as `SMARTSHEET_ACCESS_TOKEN`.
pub async fn install_access_token(store: &dyn SecretStore, env: Environment) -> Result<()> {
    let path = env.secret_path();
    let token = store.fetch(path).await?;
    std::env::set_var(ACCESS_TOKEN_VAR, token);
    tracing::info!(environment = %env, secret = path, "API token installed");
    Ok(())
}
