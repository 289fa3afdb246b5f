use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{DeliveryOutcome, DeliveryStatus, PushTransport};
use crate::domain::notification::PushMessage;
use crate::domain::push_token::TransportKind;

/// Expo rejects requests with more than 100 messages.
pub const EXPO_BATCH_SIZE: usize = 100;

/// Batches in flight at once for a single send.
pub const EXPO_MAX_IN_FLIGHT: usize = 6;

const DEVICE_NOT_REGISTERED: &str = "DeviceNotRegistered";

pub struct ExpoTransport {
    http: reqwest::Client,
    push_url: String,
    access_token: Option<String>,
}

#[derive(Serialize)]
struct ExpoMessage<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Map<String, Value>>,
    sound: &'static str,
}

#[derive(Debug, Deserialize)]
struct ExpoResponse {
    #[serde(default)]
    data: Vec<ExpoTicket>,
}

#[derive(Debug, Deserialize)]
struct ExpoTicket {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<ExpoTicketDetails>,
}

#[derive(Debug, Deserialize)]
struct ExpoTicketDetails {
    #[serde(default)]
    error: Option<String>,
}

impl ExpoTransport {
    pub fn new(http: reqwest::Client, push_url: String, access_token: Option<String>) -> Self {
        Self {
            http,
            push_url,
            access_token,
        }
    }

    async fn send_batch(&self, tokens: &[&str], message: &PushMessage) -> Vec<DeliveryStatus> {
        let payload: Vec<ExpoMessage<'_>> = tokens
            .iter()
            .map(|&token| ExpoMessage {
                to: token,
                title: &message.title,
                body: &message.body,
                data: message.data.as_ref(),
                sound: "default",
            })
            .collect();

        let mut request = self.http.post(&self.push_url).json(&payload);
        if let Some(token) = self.access_token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = ?err, batch = tokens.len(), "expo push request failed");
                return vec![DeliveryStatus::TransientError; tokens.len()];
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, batch = tokens.len(), "expo push rejected batch");
            return vec![DeliveryStatus::TransientError; tokens.len()];
        }

        match response.json::<ExpoResponse>().await {
            Ok(body) => statuses_from_response(body, tokens.len()),
            Err(err) => {
                tracing::warn!(error = ?err, "malformed expo push response");
                vec![DeliveryStatus::TransientError; tokens.len()]
            }
        }
    }
}

#[async_trait]
impl PushTransport for ExpoTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Expo
    }

    async fn send(&self, tokens: &[String], message: &PushMessage) -> DeliveryOutcome {
        let mut statuses = vec![DeliveryStatus::TransientError; tokens.len()];

        let accepted: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| TransportKind::classify(token) == TransportKind::Expo)
            .map(|(index, _)| index)
            .collect();
        if accepted.len() < tokens.len() {
            tracing::warn!(
                skipped = tokens.len() - accepted.len(),
                "non-expo tokens handed to expo transport"
            );
        }

        let batches: Vec<Vec<usize>> = accepted
            .chunks(EXPO_BATCH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect();
        let sends: Vec<_> = batches
            .iter()
            .map(|batch| {
                let batch_tokens: Vec<&str> = batch.iter().map(|&i| tokens[i].as_str()).collect();
                async move { self.send_batch(&batch_tokens, message).await }
            })
            .collect();
        let results: Vec<Vec<DeliveryStatus>> = futures::stream::iter(sends)
            .buffered(EXPO_MAX_IN_FLIGHT)
            .collect()
            .await;

        for (batch, batch_statuses) in batches.iter().zip(results) {
            for (&index, status) in batch.iter().zip(batch_statuses) {
                statuses[index] = status;
            }
        }

        DeliveryOutcome::from_statuses(tokens, statuses)
    }
}

fn statuses_from_response(body: ExpoResponse, expected: usize) -> Vec<DeliveryStatus> {
    if body.data.len() != expected {
        tracing::warn!(
            expected,
            received = body.data.len(),
            "expo ticket count does not match batch"
        );
        return vec![DeliveryStatus::TransientError; expected];
    }

    body.data.iter().map(ticket_status).collect()
}

fn ticket_status(ticket: &ExpoTicket) -> DeliveryStatus {
    if ticket.status == "ok" {
        return DeliveryStatus::Delivered;
    }

    let code = ticket
        .details
        .as_ref()
        .and_then(|details| details.error.as_deref());
    match code {
        Some(DEVICE_NOT_REGISTERED) => DeliveryStatus::InvalidDestination,
        _ => {
            tracing::debug!(
                error = code.unwrap_or("unknown"),
                message = ticket.message.as_deref().unwrap_or(""),
                "expo ticket error"
            );
            DeliveryStatus::TransientError
        }
    }
}
