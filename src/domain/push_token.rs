use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const EXPO_TOKEN_PREFIXES: [&str; 2] = ["ExponentPushToken[", "ExpoPushToken["];
const EXPO_PUSH_HOST_PREFIX: &str = "https://exp.host/";

/// Which push provider a device token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Expo push service.
    Expo,
    /// Firebase Cloud Messaging.
    Fcm,
}

impl TransportKind {
    /// Derives the provider from the token string alone. Registration and
    /// dispatch both go through here so stored rows never drift from routing.
    pub fn classify(token: &str) -> Self {
        let token = token.trim();
        if EXPO_TOKEN_PREFIXES
            .iter()
            .any(|prefix| token.starts_with(prefix))
            || token.starts_with(EXPO_PUSH_HOST_PREFIX)
        {
            Self::Expo
        } else {
            Self::Fcm
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "expo" => Some(Self::Expo),
            "fcm" => Some(Self::Fcm),
            _ => None,
        }
    }

    pub fn as_db(&self) -> &'static str {
        match self {
            Self::Expo => "expo",
            Self::Fcm => "fcm",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushToken {
    pub owner_user_id: i64,
    pub token_value: String,
    pub transport_kind: TransportKind,
    pub platform: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
