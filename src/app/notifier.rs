//! Notification fan-out.
//!
//! A notification always lands in every targeted user's in-app inbox; push
//! delivery is best effort on top of that. The only failure surfaced to the
//! caller is the initial token lookup.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::app::error::ServiceResult;
use crate::domain::notification::{FanOutReport, NotificationRecord, PushMessage};
use crate::domain::push_token::{PushToken, TransportKind};
use crate::push::{DeliveryOutcome, DeliveryStatus, PushTransport, Transports};

#[async_trait]
pub trait TokenDirectory: Send + Sync {
    async fn tokens_for(&self, user_ids: &[i64]) -> Result<Vec<PushToken>>;

    async fn revoke(&self, token_value: &str) -> Result<()>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn append(&self, user_id: i64, message: &PushMessage)
        -> ServiceResult<NotificationRecord>;
}

#[derive(Clone)]
pub struct Notifier {
    directory: Arc<dyn TokenDirectory>,
    store: Arc<dyn NotificationStore>,
    transports: Transports,
}

impl Notifier {
    pub fn new(
        directory: Arc<dyn TokenDirectory>,
        store: Arc<dyn NotificationStore>,
        transports: Transports,
    ) -> Self {
        Self {
            directory,
            store,
            transports,
        }
    }

    pub async fn notify(
        &self,
        target_user_ids: &[i64],
        message: &PushMessage,
    ) -> Result<FanOutReport> {
        if target_user_ids.is_empty() {
            return Ok(FanOutReport::default());
        }

        let recipients = dedup_in_order(target_user_ids);
        let tokens = self.directory.tokens_for(&recipients).await?;

        // Routing follows the token text; the stored kind is informational.
        let (expo_tokens, fcm_tokens): (Vec<String>, Vec<String>) = {
            let (expo, fcm): (Vec<&PushToken>, Vec<&PushToken>) = tokens
                .iter()
                .partition(|token| TransportKind::classify(&token.token_value) == TransportKind::Expo);
            (
                expo.into_iter().map(|t| t.token_value.clone()).collect(),
                fcm.into_iter().map(|t| t.token_value.clone()).collect(),
            )
        };

        let (expo_outcome, fcm_outcome) = tokio::join!(
            dispatch(self.transports.for_kind(TransportKind::Expo), &expo_tokens, message),
            dispatch(self.transports.for_kind(TransportKind::Fcm), &fcm_tokens, message),
        );
        let outcome = expo_outcome.merge(fcm_outcome);

        self.revoke_invalid(&outcome).await;
        let record_write_failures = self.write_records(&recipients, message).await;

        let report = FanOutReport {
            targeted: recipients.len(),
            tokens_attempted: tokens.len(),
            delivered: outcome.count(DeliveryStatus::Delivered),
            invalid: outcome.count(DeliveryStatus::InvalidDestination),
            transient_failures: outcome.count(DeliveryStatus::TransientError),
            record_write_failures,
        };

        tracing::info!(
            targeted = report.targeted,
            tokens = report.tokens_attempted,
            delivered = report.delivered,
            invalid = report.invalid,
            transient = report.transient_failures,
            record_failures = report.record_write_failures.len(),
            title = %message.title,
            "notification fan-out finished"
        );

        Ok(report)
    }

    async fn revoke_invalid(&self, outcome: &DeliveryOutcome) {
        for ticket in outcome
            .tickets
            .iter()
            .filter(|ticket| ticket.status == DeliveryStatus::InvalidDestination)
        {
            if let Err(err) = self.directory.revoke(&ticket.token_value).await {
                tracing::warn!(error = ?err, "failed to revoke invalid push token");
            } else {
                tracing::debug!("revoked invalid push token");
            }
        }
    }

    async fn write_records(&self, recipients: &[i64], message: &PushMessage) -> Vec<i64> {
        let mut failures = Vec::new();
        for &user_id in recipients {
            if let Err(err) = self.store.append(user_id, message).await {
                tracing::warn!(error = ?err, user_id, "failed to write notification record");
                failures.push(user_id);
            }
        }
        failures
    }
}

async fn dispatch(
    transport: &Arc<dyn PushTransport>,
    tokens: &[String],
    message: &PushMessage,
) -> DeliveryOutcome {
    if tokens.is_empty() {
        return DeliveryOutcome::default();
    }
    tracing::debug!(
        transport = transport.kind().as_db(),
        tokens = tokens.len(),
        "dispatching push batch"
    );
    transport.send(tokens, message).await
}

fn dedup_in_order(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
