use crate::erp::auth::CredentialProvider;
use crate::fetcher::RateLimitSignal;
use crate::http::build_client;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

pub const NO_QUERY: &[(&str, &str)] = &[];

#[derive(Debug, Clone, Error)]
pub enum ErpError {
    #[error("authentication unavailable")]
    AuthUnavailable,
    #[error("upstream rate limited")]
    RateLimited,
    #[error("resource not found")]
    NotFound,
    #[error("unexpected upstream response: {0}")]
    Malformed(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl RateLimitSignal for ErpError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, ErpError::RateLimited)
    }
}

/// How the credential is presented to the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    /// Legacy API: `apikey` query parameter.
    ApiKeyParam,
}

/// Thin JSON client over one ERP API version.
#[derive(Clone)]
pub struct ErpClient {
    http: Client,
    root: String,
    credentials: Arc<dyn CredentialProvider>,
    auth: AuthStyle,
}

impl ErpClient {
    pub fn new(root: &str, credentials: Arc<dyn CredentialProvider>, auth: AuthStyle) -> Self {
        Self {
            http: build_client(),
            root: root.trim_end_matches('/').to_string(),
            credentials,
            auth,
        }
    }

    pub async fn get_json<Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
        timeout: Option<Duration>,
    ) -> Result<Value, ErpError> {
        let mut request = self
            .http
            .get(format!("{}{path}", self.root))
            .query(query);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        self.send(request).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Value, ErpError> {
        let request = self.http.post(format!("{}{path}", self.root)).json(body);
        self.send(request).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, ErpError> {
        let token = self
            .credentials
            .access_token()
            .await
            .ok_or(ErpError::AuthUnavailable)?;
        let request = match self.auth {
            AuthStyle::Bearer => request.bearer_auth(token),
            AuthStyle::ApiKeyParam => request.query(&[("apikey", token)]),
        };
        let response = request
            .send()
            .await
            .map_err(|err| ErpError::Request(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ErpError::RateLimited);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ErpError::NotFound);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ErpError::AuthUnavailable);
        }
        let body = response
            .text()
            .await
            .map_err(|err| ErpError::Request(err.to_string()))?;
        let value: Value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).map_err(|err| ErpError::Malformed(err.to_string()))?
        };
        // Validation failures come back as 400 with a structured body the
        // dispatcher still needs to classify.
        if !status.is_success() && !(status == StatusCode::BAD_REQUEST && value.is_object()) {
            return Err(ErpError::Request(format!("HTTP {status}")));
        }
        Ok(value)
    }
}

/// Pull the record list out of any of the listing shapes the ERP returns:
/// a bare array, or an array nested under `data`, `items`, `contacts`,
/// `contatos`, `produtos` (optionally inside `retorno`). Legacy records wrapped
/// as `{"contato": {...}}` are unwrapped.
pub fn extract_records(body: &Value) -> Result<Vec<Value>, ErpError> {
    const KEYS: [&str; 6] = ["data", "items", "contacts", "contatos", "produtos", "retorno"];
    let list = match body {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        Value::Object(map) => {
            if legacy_not_found(body) {
                return Ok(Vec::new());
            }
            let Some((key, nested)) = KEYS
                .iter()
                .find_map(|key| map.get(*key).map(|value| (*key, value)))
            else {
                return Err(ErpError::Malformed("no record list in response".into()));
            };
            match nested {
                Value::Array(items) => items.clone(),
                Value::Object(_) if key == "retorno" || key == "data" => {
                    return extract_records(nested);
                }
                Value::Null => Vec::new(),
                _ => return Err(ErpError::Malformed(format!("`{key}` is not a list"))),
            }
        }
        _ => return Err(ErpError::Malformed("response is not a list".into())),
    };
    Ok(list.into_iter().map(unwrap_record).collect())
}

fn unwrap_record(record: Value) -> Value {
    match record {
        Value::Object(mut map) if map.len() == 1 => {
            let key = map.keys().next().cloned().unwrap_or_default();
            if matches!(key.as_str(), "contato" | "produto" | "item") && map[&key].is_object() {
                map.remove(&key).unwrap_or(Value::Null)
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

/// Legacy API signals "past the last page" as an error with code 14.
fn legacy_not_found(body: &Value) -> bool {
    let errors = body.pointer("/retorno/erros");
    match errors {
        Some(Value::Array(items)) => items.iter().any(|item| {
            let code = item
                .pointer("/erro/cod")
                .or_else(|| item.get("cod"))
                .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()));
            code == Some(14)
        }),
        Some(Value::Object(map)) => map
            .get("erro")
            .and_then(|e| e.get("cod"))
            .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
            == Some(14),
        _ => false,
    }
}

/// Coerce an upstream identifier (number or string) to its canonical string.
pub fn canonical_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => n
            .as_u64()
            .map(|v| v.to_string())
            .or_else(|| n.as_i64().map(|v| v.to_string()))
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| format!("{f:.0}"))
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_every_listing_shape() {
        let bare = json!([{"id": 1}]);
        let data = json!({"data": [{"id": 2}]});
        let items = json!({"items": [{"id": 3}]});
        let contacts = json!({"contacts": [{"id": 4}]});
        let legacy = json!({"retorno": {"contatos": [{"contato": {"id": "5"}}]}});
        assert_eq!(extract_records(&bare).unwrap(), vec![json!({"id": 1})]);
        assert_eq!(extract_records(&data).unwrap(), vec![json!({"id": 2})]);
        assert_eq!(extract_records(&items).unwrap(), vec![json!({"id": 3})]);
        assert_eq!(extract_records(&contacts).unwrap(), vec![json!({"id": 4})]);
        assert_eq!(extract_records(&legacy).unwrap(), vec![json!({"id": "5"})]);
    }

    #[test]
    fn legacy_end_of_listing_is_empty() {
        let body = json!({
            "retorno": {
                "erros": [{"erro": {"cod": 14, "msg": "A informacao desejada nao foi encontrada"}}]
            }
        });
        assert!(extract_records(&body).unwrap().is_empty());
    }

    #[test]
    fn unknown_shape_is_malformed() {
        let body = json!({"unexpected": true});
        assert!(matches!(extract_records(&body), Err(ErpError::Malformed(_))));
    }

    #[test]
    fn canonical_id_coerces_numbers_and_strings() {
        assert_eq!(canonical_id(&json!(42)), Some("42".into()));
        assert_eq!(canonical_id(&json!(" 42 ")), Some("42".into()));
        assert_eq!(canonical_id(&json!(42.0)), Some("42".into()));
        assert_eq!(canonical_id(&json!(null)), None);
    }
}
