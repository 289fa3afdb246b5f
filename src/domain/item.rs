use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub seller_id: i64,
    pub seller_handle: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_key: Option<String>,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Available,
    Sold,
}

impl ItemStatus {
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "available" => Some(Self::Available),
            "sold" => Some(Self::Sold),
            _ => None,
        }
    }

    pub fn as_db(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Sold => "sold",
        }
    }
}

/// Filters accepted by listing search. Empty fields are ignored.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub query: Option<String>,
    pub category: Option<String>,
    pub min_price_cents: Option<i64>,
    pub max_price_cents: Option<i64>,
    pub seller_id: Option<i64>,
    pub include_sold: bool,
}
