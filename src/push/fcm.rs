use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::google_auth::{ServiceAccountAuth, ServiceAccountKey, FIREBASE_MESSAGING_SCOPE};
use super::{DeliveryOutcome, DeliveryStatus, PushTransport};
use crate::domain::notification::PushMessage;
use crate::domain::push_token::TransportKind;

/// The v1 API takes one token per request; this many run at once.
const MAX_IN_FLIGHT: usize = 16;

/// `FcmError.errorCode` values after which the token will never work again.
const PERMANENT_ERRORS: [&str; 2] = ["UNREGISTERED", "SENDER_ID_MISMATCH"];
const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";

/// Project and OAuth2 identity used for `messages:send`.
pub struct FcmCredentials {
    pub project_id: String,
    pub auth: ServiceAccountAuth,
}

impl FcmCredentials {
    /// `project_id` overrides the one recorded in the key file.
    pub fn from_key(
        http: reqwest::Client,
        key: &ServiceAccountKey,
        project_id: Option<String>,
    ) -> Result<Self> {
        let project_id = project_id
            .or_else(|| key.project_id.clone())
            .ok_or_else(|| anyhow!("FCM_PROJECT_ID is unset and the service account key has no project_id"))?;
        let auth = ServiceAccountAuth::new(http, key, FIREBASE_MESSAGING_SCOPE)?;
        Ok(Self { project_id, auth })
    }
}

pub struct FcmTransport {
    http: reqwest::Client,
    api_url: String,
    credentials: Option<FcmCredentials>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    message: FcmMessage<'a>,
}

#[derive(Serialize)]
struct FcmMessage<'a> {
    token: &'a str,
    notification: FcmNotification<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a BTreeMap<String, String>>,
    android: AndroidConfig,
}

#[derive(Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct AndroidConfig {
    priority: &'static str,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

impl FcmTransport {
    pub fn new(http: reqwest::Client, api_url: String, credentials: Option<FcmCredentials>) -> Self {
        Self {
            http,
            api_url,
            credentials,
        }
    }

    async fn send_one(
        &self,
        credentials: &FcmCredentials,
        url: &str,
        bearer: &str,
        token: &str,
        message: &PushMessage,
        data: Option<&BTreeMap<String, String>>,
    ) -> DeliveryStatus {
        let payload = SendRequest {
            message: FcmMessage {
                token,
                notification: FcmNotification {
                    title: &message.title,
                    body: &message.body,
                },
                data,
                android: AndroidConfig { priority: "high" },
            },
        };

        let response = match self.http.post(url).bearer_auth(bearer).json(&payload).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = ?err, "fcm send request failed");
                return DeliveryStatus::TransientError;
            }
        };

        let status = response.status();
        if status.is_success() {
            return DeliveryStatus::Delivered;
        }
        if status == StatusCode::UNAUTHORIZED {
            credentials.auth.invalidate().await;
        }

        let body = response
            .json::<ErrorResponse>()
            .await
            .map(|parsed| parsed.error)
            .unwrap_or_default();
        let outcome = error_status(&body);
        tracing::debug!(
            %status,
            error = body.status.as_deref().unwrap_or("unknown"),
            ?outcome,
            "fcm rejected message"
        );
        outcome
    }
}

#[async_trait]
impl PushTransport for FcmTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Fcm
    }

    async fn send(&self, tokens: &[String], message: &PushMessage) -> DeliveryOutcome {
        let Some(credentials) = self.credentials.as_ref() else {
            tracing::warn!(tokens = tokens.len(), "FCM credentials not configured, skipping send");
            return DeliveryOutcome::all_transient(tokens);
        };

        let mut statuses = vec![DeliveryStatus::TransientError; tokens.len()];
        let accepted: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| TransportKind::classify(token) == TransportKind::Fcm)
            .map(|(index, _)| index)
            .collect();
        if accepted.len() < tokens.len() {
            tracing::warn!(
                skipped = tokens.len() - accepted.len(),
                "expo tokens handed to fcm transport"
            );
        }
        if accepted.is_empty() {
            return DeliveryOutcome::from_statuses(tokens, statuses);
        }

        let bearer = match credentials.auth.access_token().await {
            Ok(bearer) => bearer,
            Err(err) => {
                tracing::warn!(error = ?err, tokens = accepted.len(), "fcm access token unavailable");
                return DeliveryOutcome::from_statuses(tokens, statuses);
            }
        };

        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.api_url.trim_end_matches('/'),
            credentials.project_id
        );
        let data = message.data.as_ref().map(stringify_data);

        let sends: Vec<_> = accepted
            .iter()
            .map(|&index| {
                self.send_one(credentials, &url, &bearer, &tokens[index], message, data.as_ref())
            })
            .collect();
        let results: Vec<DeliveryStatus> = futures::stream::iter(sends)
        .buffered(MAX_IN_FLIGHT)
        .collect()
        .await;

        for (&index, status) in accepted.iter().zip(results) {
            statuses[index] = status;
        }

        DeliveryOutcome::from_statuses(tokens, statuses)
    }
}

fn stringify_data(data: &Map<String, Value>) -> BTreeMap<String, String> {
    data.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// `INVALID_ARGUMENT` also covers payload problems, so it only condemns the
/// token when Google names the registration token as the bad argument.
fn error_status(body: &ErrorBody) -> DeliveryStatus {
    let code = body
        .details
        .iter()
        .find_map(|detail| detail.error_code.as_deref())
        .or(body.status.as_deref());

    match code {
        Some(code) if PERMANENT_ERRORS.contains(&code) => DeliveryStatus::InvalidDestination,
        Some(INVALID_ARGUMENT) if names_registration_token(body) => {
            DeliveryStatus::InvalidDestination
        }
        _ => DeliveryStatus::TransientError,
    }
}

fn names_registration_token(body: &ErrorBody) -> bool {
    body.message
        .as_deref()
        .map(|message| message.to_ascii_lowercase().contains("registration token"))
        .unwrap_or(false)
}
