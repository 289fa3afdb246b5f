//! Push delivery transports.
//!
//! Every transport reports one [`Ticket`] per input token, in input order,
//! and never returns an error. Network and provider failures are folded
//! into ticket statuses.

pub mod expo;
pub mod fcm;
pub mod google_auth;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PushConfig;
use crate::domain::notification::PushMessage;
use crate::domain::push_token::TransportKind;
use google_auth::ServiceAccountKey;

pub use expo::ExpoTransport;
pub use fcm::{FcmCredentials, FcmTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Accepted by the provider (delivered or queued for the device).
    Delivered,
    /// The provider says the token will never work again.
    InvalidDestination,
    /// Anything else: network, auth, rate limit, malformed response.
    TransientError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ticket {
    pub token_value: String,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub tickets: Vec<Ticket>,
}

impl DeliveryOutcome {
    pub fn from_statuses(tokens: &[String], statuses: Vec<DeliveryStatus>) -> Self {
        let tickets = tokens
            .iter()
            .zip(statuses)
            .map(|(token, status)| Ticket {
                token_value: token.clone(),
                status,
            })
            .collect();
        Self { tickets }
    }

    pub fn all_transient(tokens: &[String]) -> Self {
        Self::from_statuses(tokens, vec![DeliveryStatus::TransientError; tokens.len()])
    }

    pub fn count(&self, status: DeliveryStatus) -> usize {
        self.tickets
            .iter()
            .filter(|ticket| ticket.status == status)
            .count()
    }

    pub fn merge(mut self, other: DeliveryOutcome) -> Self {
        self.tickets.extend(other.tickets);
        self
    }
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn send(&self, tokens: &[String], message: &PushMessage) -> DeliveryOutcome;
}

/// One transport per provider.
#[derive(Clone)]
pub struct Transports {
    pub expo: Arc<dyn PushTransport>,
    pub fcm: Arc<dyn PushTransport>,
}

impl Transports {
    pub fn new(expo: Arc<dyn PushTransport>, fcm: Arc<dyn PushTransport>) -> Self {
        Self { expo, fcm }
    }

    pub fn from_config(config: &PushConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        let expo = ExpoTransport::new(
            http.clone(),
            config.expo_push_url.clone(),
            config.expo_access_token.clone(),
        );
        let credentials = match config.fcm_credentials_path.as_deref() {
            Some(path) => {
                let key = ServiceAccountKey::from_file(path)?;
                Some(FcmCredentials::from_key(
                    http.clone(),
                    &key,
                    config.fcm_project_id.clone(),
                )?)
            }
            None => None,
        };
        let fcm = FcmTransport::new(http, config.fcm_api_url.clone(), credentials);

        Ok(Self::new(Arc::new(expo), Arc::new(fcm)))
    }

    pub fn for_kind(&self, kind: TransportKind) -> &Arc<dyn PushTransport> {
        match kind {
            TransportKind::Expo => &self.expo,
            TransportKind::Fcm => &self.fcm,
        }
    }
}
