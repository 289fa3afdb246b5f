use anyhow::Result;
use sqlx::Row;

use crate::app::error::{ServiceError, ServiceResult};
use crate::app::items::{map_item, ITEM_SELECT};
use crate::domain::cart::CartEntry;
use crate::domain::item::{Item, ItemStatus};
use crate::infra::db::Db;

const MAX_CART_ITEMS: i64 = 200;

#[derive(Debug, Clone)]
pub struct CartAddition {
    pub item: Item,
    /// False when the item was already in the cart.
    pub newly_added: bool,
}

#[derive(Clone)]
pub struct CartService {
    db: Db,
}

impl CartService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn add(&self, user_id: i64, item_id: i64) -> ServiceResult<CartAddition> {
        let row = sqlx::query(&format!("{} WHERE i.id = $1", ITEM_SELECT))
            .bind(item_id)
            .fetch_optional(self.db.pool())
            .await?;
        let item = row
            .as_ref()
            .map(map_item)
            .ok_or(ServiceError::NotFound("item"))?;

        if item.seller_id == user_id {
            return Err(ServiceError::Validation("cannot add your own item to the cart".into()));
        }
        if item.status != ItemStatus::Available {
            return Err(ServiceError::Conflict("item is no longer available".into()));
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cart_items WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(self.db.pool())
            .await?;
        if count >= MAX_CART_ITEMS {
            return Err(ServiceError::Conflict("cart is full".into()));
        }

        // FOR SHARE waits out a purchase holding the row lock and then
        // re-checks the status, so no cart row outlives the sale's cart sweep.
        let result = sqlx::query(
            "INSERT INTO cart_items (user_id, item_id) \
             SELECT $1, id FROM items WHERE id = $2 AND status = 'available' FOR SHARE \
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(item_id)
        .execute(self.db.pool())
        .await?;

        let newly_added = result.rows_affected() > 0;
        if !newly_added {
            let present: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM cart_items WHERE user_id = $1 AND item_id = $2)",
            )
            .bind(user_id)
            .bind(item_id)
            .fetch_one(self.db.pool())
            .await?;
            if !present {
                return Err(ServiceError::Conflict("item is no longer available".into()));
            }
        }

        Ok(CartAddition { item, newly_added })
    }

    pub async fn remove(&self, user_id: i64, item_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cart_items WHERE user_id = $1 AND item_id = $2")
            .bind(user_id)
            .bind(item_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self, user_id: i64) -> Result<Vec<CartEntry>> {
        let rows = sqlx::query(
            "SELECT c.added_at, i.id, i.seller_id, u.handle AS seller_handle, i.title, \
                    i.description, i.price_cents, i.category, i.photo_key, i.status, \
                    i.buyer_id, i.created_at \
             FROM cart_items c \
             JOIN items i ON i.id = c.item_id \
             LEFT JOIN users u ON u.id = i.seller_id \
             WHERE c.user_id = $1 \
             ORDER BY c.added_at DESC, i.id DESC",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        let entries = rows
            .iter()
            .map(|row| CartEntry {
                item: map_item(row),
                added_at: row.get("added_at"),
            })
            .collect();

        Ok(entries)
    }
}
