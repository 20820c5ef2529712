use crate::http::build_client;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

/// Read-only view over the token table the OAuth collaborator maintains.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    table: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredToken {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.trim().is_empty() && self.expires_at.is_none_or(|exp| exp > now)
    }
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        let table = std::env::var("SUPABASE_TOKEN_TABLE").unwrap_or_else(|_| "erp_tokens".into());
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            table,
            http: build_client(),
        })
    }

    /// Most recent non-expired access token, if any.
    pub async fn fetch_access_token(&self) -> Result<Option<String>, SupabaseError> {
        let url = format!(
            "{}/rest/v1/{}?select=access_token,expires_at&order=updated_at.desc&limit=1",
            self.base_url, self.table
        );
        let response = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let mut payload: Vec<StoredToken> = response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        Ok(payload
            .pop()
            .filter(|token| token.is_live(Utc::now()))
            .map(|token| token.access_token))
    }
}
