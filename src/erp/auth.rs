use crate::supabase::SupabaseClient;
use async_trait::async_trait;
use std::env;
use tracing::warn;

/// Source of the bearer token used against the ERP.
///
/// `None` means no credential is available; callers turn that into
/// [`ErpError::AuthUnavailable`](crate::erp::ErpError::AuthUnavailable)
/// instead of attempting the request.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Option<String>;
}

/// Reads a token from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    var: &'static str,
}

impl EnvCredentials {
    pub fn new(var: &'static str) -> Self {
        Self { var }
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn access_token(&self) -> Option<String> {
        env::var(self.var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Token persisted by the OAuth collaborator in Supabase, with an env
/// fallback when the store has nothing usable.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    store: SupabaseClient,
    fallback: EnvCredentials,
}

impl StoredCredentials {
    pub fn new(store: SupabaseClient, fallback: EnvCredentials) -> Self {
        Self { store, fallback }
    }
}

#[async_trait]
impl CredentialProvider for StoredCredentials {
    async fn access_token(&self) -> Option<String> {
        match self.store.fetch_access_token().await {
            Ok(Some(token)) => Some(token),
            Ok(None) => self.fallback.access_token().await,
            Err(err) => {
                warn!(target = "oc.auth", error = %err, "stored_token_lookup_failed");
                self.fallback.access_token().await
            }
        }
    }
}

/// Fixed token for test wiring.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Option<String>);

#[cfg(test)]
#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}
