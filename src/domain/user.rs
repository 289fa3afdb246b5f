use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub handle: String,
    pub email: String,
    pub display_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicUser {
    pub id: i64,
    pub handle: String,
    pub display_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub listings_count: i64,
}

impl PublicUser {
    pub fn from_user(user: User, listings_count: i64) -> Self {
        Self {
            id: user.id,
            handle: user.handle,
            display_name: user.display_name,
            created_at: user.created_at,
            listings_count,
        }
    }
}
