//! GraphQL client for the migrated-emails index.
//!
//! Requests carry a service token obtained from the identity endpoint. The
//! token is cached until shortly before its `exp` claim and refreshed once
//! when the endpoint reports `invalid-jwt`.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use futures::lock::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{IndexQuery, IndexRecord, RemoteIndex};
use crate::error::{Error, Result};

const EMAILS_QUERY: &str = "query getEmails($condition: emails_bool_exp) {
  emails(where: $condition) {
    object
  }
}";

/// Refresh tokens this many seconds before they expire.
const TOKEN_EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
pub struct GraphqlIndex {
    client: reqwest::Client,
    endpoint: String,
    company_id: String,
    tokens: std::sync::Arc<ServiceTokens>,
}

impl GraphqlIndex {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        company_id: impl Into<String>,
        tokens: ServiceTokens,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            company_id: company_id.into(),
            tokens: std::sync::Arc::new(tokens),
        }
    }

    fn url(&self) -> String {
        format!("{}/v1/graphql", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl RemoteIndex for GraphqlIndex {
    async fn query(&self, queries: &[IndexQuery]) -> Result<Vec<IndexRecord>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "query": EMAILS_QUERY,
            "variables": { "condition": condition(&self.company_id, queries) },
        });

        for attempt in 0..2 {
            let token = self.tokens.token(attempt > 0).await?;
            let response: GraphqlResponse<EmailsData> = self
                .client
                .post(self.url())
                .bearer_auth(token)
                .json(&body)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if let Some(errors) = response.errors {
                let message = errors.to_string();
                if attempt == 0 && message.contains("invalid-jwt") {
                    info!("Service token rejected, refreshing");
                    continue;
                }
                return Err(Error::Index(message));
            }

            let records: Vec<IndexRecord> = response
                .data
                .map(|data| data.emails.into_iter().map(|email| email.object).collect())
                .unwrap_or_default();
            debug!(queries = queries.len(), records = records.len(), "Queried index");
            return Ok(records);
        }

        Err(Error::Index("service token rejected twice".to_string()))
    }
}

/// Build the `emails_bool_exp` condition covering every query.
pub fn condition(company_id: &str, queries: &[IndexQuery]) -> Value {
    let alternatives: Vec<Value> = queries
        .iter()
        .map(|q| {
            json!({
                "from": { "_eq": q.sender },
                "subject": { "_in": q.subjects },
            })
        })
        .collect();

    json!({
        "company_id": { "_eq": company_id },
        "_or": alternatives,
    })
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    errors: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EmailsData {
    emails: Vec<EmailRow>,
}

#[derive(Debug, Deserialize)]
struct EmailRow {
    object: IndexRecord,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    service_id: &'a str,
    secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

#[derive(Debug, Clone)]
struct ServiceToken {
    jwt: String,
    expires_at: i64,
}

impl ServiceToken {
    fn is_expired(&self, now: i64) -> bool {
        now + TOKEN_EXPIRY_SKEW_SECONDS > self.expires_at
    }
}

/// Service credentials and the cached token they produced.
pub struct ServiceTokens {
    client: reqwest::Client,
    id_url: String,
    service_id: String,
    secret: String,
    cached: Mutex<Option<ServiceToken>>,
}

impl ServiceTokens {
    pub fn new(
        client: reqwest::Client,
        id_url: impl Into<String>,
        service_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            id_url: id_url.into(),
            service_id: service_id.into(),
            secret: secret.into(),
            cached: Mutex::new(None),
        }
    }

    /// Current token, fetching a new one when `force` is set or the cached
    /// one is about to expire.
    pub async fn token(&self, force: bool) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if !force && !token.is_expired(Utc::now().timestamp()) {
                return Ok(token.jwt.clone());
            }
        }

        let response: TokenResponse = self
            .client
            .post(&self.id_url)
            .json(&TokenRequest {
                service_id: &self.service_id,
                secret: &self.secret,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let token = ServiceToken {
            expires_at: jwt_expiry(&response.token)?,
            jwt: response.token,
        };
        debug!(expires_at = token.expires_at, "Obtained service token");
        let jwt = token.jwt.clone();
        *cached = Some(token);
        Ok(jwt)
    }
}

impl std::fmt::Debug for ServiceTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTokens")
            .field("id_url", &self.id_url)
            .field("service_id", &self.service_id)
            .finish_non_exhaustive()
    }
}

/// Read the `exp` claim of a JWT without verifying it.
fn jwt_expiry(jwt: &str) -> Result<i64> {
    let payload = jwt
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Token("malformed JWT".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::Token(e.to_string()))?;
    let claims: Claims = serde_json::from_slice(&bytes).map_err(|e| Error::Token(e.to_string()))?;
    Ok(claims.exp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(claims: &str) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256"}"#),
            URL_SAFE_NO_PAD.encode(claims)
        )
    }

    #[test]
    fn test_condition_covers_every_sender() {
        let queries = [
            IndexQuery {
                sender: "alice@example.com".into(),
                subjects: vec!["a".into(), "b".into()],
            },
            IndexQuery {
                sender: "bob@example.com".into(),
                subjects: vec!["c".into()],
            },
        ];
        let value = condition("acme", &queries);
        assert_eq!(value["company_id"]["_eq"], "acme");
        assert_eq!(value["_or"].as_array().unwrap().len(), 2);
        assert_eq!(value["_or"][0]["from"]["_eq"], "alice@example.com");
        assert_eq!(value["_or"][0]["subject"]["_in"], json!(["a", "b"]));
        assert_eq!(value["_or"][1]["subject"]["_in"], json!(["c"]));
    }

    #[test]
    fn test_jwt_expiry() {
        assert_eq!(jwt_expiry(&jwt(r#"{"exp":1700000000,"sub":"svc"}"#)).unwrap(), 1700000000);
        assert!(jwt_expiry("not-a-jwt").is_err());
        assert!(jwt_expiry(&jwt(r#"{"sub":"svc"}"#)).is_err());
    }

    #[test]
    fn test_token_expiry_skew() {
        let token = ServiceToken {
            jwt: String::new(),
            expires_at: 1_000,
        };
        assert!(!token.is_expired(900));
        assert!(token.is_expired(941));
        assert!(token.is_expired(1_000));
    }

    #[test]
    fn test_response_decoding() {
        let body = r#"{"data":{"emails":[{"object":{"key":"acme/x/2024-01-01/5.eml","type":"s3","bucket":"b"}}]}}"#;
        let response: GraphqlResponse<EmailsData> = serde_json::from_str(body).unwrap();
        let rows = response.data.unwrap().emails;
        assert_eq!(rows[0].object.key, "acme/x/2024-01-01/5.eml");
        assert_eq!(rows[0].object.bucket.as_deref(), Some("b"));
        assert!(response.errors.is_none());
    }
}
