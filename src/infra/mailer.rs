use anyhow::{anyhow, Result};
use serde::Serialize;
use std::time::Duration;

use crate::config::MailConfig;

/// Transactional mail over an HTTP API (SendGrid v3 compatible body).
#[derive(Clone)]
pub struct Mailer {
    http: reqwest::Client,
    config: MailConfig,
}

#[derive(Serialize)]
struct MailRequest<'a> {
    personalizations: [Personalization<'a>; 1],
    from: Address<'a>,
    subject: &'a str,
    content: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Personalization<'a> {
    to: [Address<'a>; 1],
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    value: &'a str,
}

impl Mailer {
    pub fn new(config: MailConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_url.is_some()
    }

    /// Sends a plain-text message. Returns `Ok(false)` without sending when
    /// no mail API is configured.
    pub async fn send_text(&self, to: &str, subject: &str, text: &str) -> Result<bool> {
        let Some(api_url) = self.config.api_url.as_deref() else {
            tracing::warn!(subject, "mail API not configured, message dropped");
            return Ok(false);
        };

        let body = MailRequest {
            personalizations: [Personalization {
                to: [Address { email: to }],
            }],
            from: Address {
                email: &self.config.from_address,
            },
            subject,
            content: [Content {
                kind: "text/plain",
                value: text,
            }],
        };

        let mut request = self.http.post(api_url).json(&body);
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("mail API responded with {}", status));
        }

        Ok(true)
    }
}
