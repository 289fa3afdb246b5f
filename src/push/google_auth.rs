//! OAuth2 access tokens for Google APIs, minted from a service-account key
//! with the JWT bearer grant.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const FIREBASE_MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECONDS: i64 = 3600;
/// Cached tokens are refreshed this long before Google says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// The fields of a downloaded service-account JSON key that token minting needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(default)]
    pub project_id: Option<String>,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service account key {}", path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid service account key {}", path))
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    ASSERTION_LIFETIME_SECONDS as u64
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct ServiceAccountAuth {
    http: reqwest::Client,
    client_email: String,
    token_uri: String,
    scope: &'static str,
    signing_key: EncodingKey,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountAuth {
    pub fn new(http: reqwest::Client, key: &ServiceAccountKey, scope: &'static str) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("service account private_key is not an RSA PEM key")?;

        Ok(Self {
            http,
            client_email: key.client_email.clone(),
            token_uri: key.token_uri.clone(),
            scope,
            signing_key,
            cached: Mutex::new(None),
        })
    }

    /// Returns a cached bearer token, exchanging a fresh assertion when the
    /// cached one is missing or near expiry. Concurrent callers share one exchange.
    pub async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.exchange().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Drops the cached token so the next call mints a new one.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    fn assertion(&self) -> Result<String> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: self.scope,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECONDS,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .context("failed to sign token assertion")
    }

    async fn exchange(&self) -> Result<CachedToken> {
        let assertion = self.assertion()?;
        let response = self
            .http
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .context("token exchange request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("token exchange rejected with {}: {}", status, body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("malformed token exchange response")?;
        tracing::debug!(expires_in = token.expires_in, "minted google access token");

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        Ok(CachedToken {
            value: token.access_token,
            refresh_at: Instant::now() + lifetime,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Form, Json, Router};
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub(crate) const TEST_PRIVATE_KEY: &str = include_str!("testdata/service_account_key.pem");
    const TEST_PUBLIC_KEY: &str = include_str!("testdata/service_account_pub.pem");

    pub(crate) fn test_key(token_uri: String) -> ServiceAccountKey {
        ServiceAccountKey {
            project_id: Some("demo-project".to_string()),
            client_email: "push@demo-project.iam.gserviceaccount.com".to_string(),
            private_key: TEST_PRIVATE_KEY.to_string(),
            token_uri,
        }
    }

    #[derive(Clone, Default)]
    struct Exchanges {
        count: Arc<AtomicUsize>,
        audience: Arc<std::sync::Mutex<Option<String>>>,
    }

    async fn fake_token(
        State(exchanges): State<Exchanges>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        assert_eq!(form["grant_type"], JWT_BEARER_GRANT);

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        let claims = decode::<Value>(
            &form["assertion"],
            &DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap()
        .claims;
        assert_eq!(claims["iss"], "push@demo-project.iam.gserviceaccount.com");
        assert_eq!(claims["scope"], FIREBASE_MESSAGING_SCOPE);
        *exchanges.audience.lock().unwrap() = claims["aud"].as_str().map(str::to_string);

        let n = exchanges.count.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "access_token": format!("access-{}", n),
            "expires_in": 3599,
            "token_type": "Bearer"
        }))
    }

    async fn spawn_fake_token_server() -> (String, Exchanges) {
        let exchanges = Exchanges::default();
        let app = Router::new()
            .route("/token", post(fake_token))
            .with_state(exchanges.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/token", addr), exchanges)
    }

    #[test]
    fn key_file_defaults_token_uri() {
        let key: ServiceAccountKey = serde_json::from_value(json!({
            "type": "service_account",
            "client_email": "a@b.iam.gserviceaccount.com",
            "private_key": "pem"
        }))
        .unwrap();
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
        assert!(key.project_id.is_none());
    }

    #[test]
    fn rejects_non_rsa_private_key() {
        let mut key = test_key(DEFAULT_TOKEN_URI.to_string());
        key.private_key = "not a pem".to_string();
        assert!(ServiceAccountAuth::new(reqwest::Client::new(), &key, FIREBASE_MESSAGING_SCOPE).is_err());
    }

    #[tokio::test]
    async fn signed_assertion_is_exchanged_once_and_cached() {
        let (token_uri, exchanges) = spawn_fake_token_server().await;
        let auth = ServiceAccountAuth::new(
            reqwest::Client::new(),
            &test_key(token_uri.clone()),
            FIREBASE_MESSAGING_SCOPE,
        )
        .unwrap();

        assert_eq!(auth.access_token().await.unwrap(), "access-0");
        assert_eq!(auth.access_token().await.unwrap(), "access-0");
        assert_eq!(exchanges.count.load(Ordering::SeqCst), 1);
        assert_eq!(
            exchanges.audience.lock().unwrap().as_deref(),
            Some(token_uri.as_str())
        );

        auth.invalidate().await;
        assert_eq!(auth.access_token().await.unwrap(), "access-1");
    }

    #[tokio::test]
    async fn failed_exchange_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let auth = ServiceAccountAuth::new(
            reqwest::Client::new(),
            &test_key(format!("http://{}/token", addr)),
            FIREBASE_MESSAGING_SCOPE,
        )
        .unwrap();
        assert!(auth.access_token().await.is_err());
    }
}
