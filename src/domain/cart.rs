use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::item::Item;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartEntry {
    pub item: Item,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
}
