use anyhow::{anyhow, Result};
use url::Url;

use super::{env_or, env_or_parse};

const DEFAULT_EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";
const DEFAULT_FCM_API_URL: &str = "https://fcm.googleapis.com";

/// Outbound push providers. FCM needs a service-account key file; without
/// one the FCM transport reports every token as a transient failure.
#[derive(Clone, Debug)]
pub struct PushConfig {
    pub expo_push_url: String,
    pub expo_access_token: Option<String>,
    pub fcm_api_url: String,
    /// Falls back to the `project_id` inside the key file.
    pub fcm_project_id: Option<String>,
    pub fcm_credentials_path: Option<String>,
    pub timeout_seconds: u64,
}

impl PushConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            expo_push_url: env_url("EXPO_PUSH_URL", DEFAULT_EXPO_PUSH_URL)?,
            expo_access_token: non_empty_env("EXPO_ACCESS_TOKEN"),
            fcm_api_url: env_url("FCM_API_URL", DEFAULT_FCM_API_URL)?,
            fcm_project_id: non_empty_env("FCM_PROJECT_ID"),
            fcm_credentials_path: non_empty_env("FCM_CREDENTIALS_FILE")
                .or_else(|| non_empty_env("GOOGLE_APPLICATION_CREDENTIALS")),
            timeout_seconds: env_or_parse("PUSH_TIMEOUT_SECONDS", "10")?,
        })
    }
}

/// Transactional mail API. Mail is disabled when `MAIL_API_URL` is unset.
#[derive(Clone, Debug)]
pub struct MailConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub from_address: String,
}

impl MailConfig {
    pub fn from_env() -> Result<Self> {
        let api_url = match non_empty_env("MAIL_API_URL") {
            Some(value) => {
                Url::parse(&value).map_err(|err| anyhow!("invalid MAIL_API_URL: {}", err))?;
                Some(value)
            }
            None => None,
        };

        Ok(Self {
            api_url,
            api_key: non_empty_env("MAIL_API_KEY"),
            from_address: env_or("MAIL_FROM", "no-reply@bazaar.local"),
        })
    }
}

fn env_url(key: &str, default: &str) -> Result<String> {
    let value = env_or(key, default);
    Url::parse(&value).map_err(|err| anyhow!("invalid {}: {}", key, err))?;
    Ok(value)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
