use anyhow::Result;
use sqlx::postgres::PgRow;
use sqlx::Row;
use time::OffsetDateTime;

use crate::app::error::{ServiceError, ServiceResult};
use crate::domain::item::{Item, ItemFilter, ItemStatus};
use crate::infra::db::Db;

pub(crate) const ITEM_SELECT: &str =
    "SELECT i.id, i.seller_id, u.handle AS seller_handle, i.title, i.description, \
            i.price_cents, i.category, i.photo_key, i.status, i.buyer_id, i.created_at \
     FROM items i \
     LEFT JOIN users u ON u.id = i.seller_id";

#[derive(Debug, Clone)]
pub struct NewItem {
    pub title: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub category: Option<String>,
    pub photo_key: Option<String>,
}

/// Result of a committed purchase. `cart_holders` lists everyone whose cart
/// held the item, buyer included.
#[derive(Debug, Clone)]
pub struct Sale {
    pub item: Item,
    pub cart_holders: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub item_id: i64,
    pub title: String,
    pub cart_holders: Vec<i64>,
}

#[derive(Clone)]
pub struct ItemService {
    db: Db,
}

impl ItemService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn publish(&self, seller_id: i64, item: NewItem) -> Result<Item> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO items (seller_id, title, description, price_cents, category, photo_key) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING id",
        )
        .bind(seller_id)
        .bind(item.title.trim())
        .bind(item.description)
        .bind(item.price_cents)
        .bind(item.category)
        .bind(item.photo_key)
        .fetch_one(self.db.pool())
        .await?;

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("item {} vanished after insert", id))
    }

    pub async fn get(&self, item_id: i64) -> Result<Option<Item>> {
        let row = sqlx::query(&format!("{} WHERE i.id = $1", ITEM_SELECT))
            .bind(item_id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row.as_ref().map(map_item))
    }

    /// Newest first. Sold items are hidden unless `include_sold` is set.
    pub async fn search(
        &self,
        filter: &ItemFilter,
        cursor: Option<(OffsetDateTime, i64)>,
        limit: i64,
    ) -> Result<Vec<Item>> {
        let pattern = filter
            .query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .map(|query| format!("%{}%", escape_like_pattern(query)));
        let (cursor_at, cursor_id) = match cursor {
            Some((created_at, id)) => (Some(created_at), Some(id)),
            None => (None, None),
        };

        let rows = sqlx::query(&format!(
            "{} \
             WHERE ($1::TEXT IS NULL \
                    OR i.title ILIKE $1 ESCAPE '\\' \
                    OR i.description ILIKE $1 ESCAPE '\\') \
               AND ($2::TEXT IS NULL OR i.category = $2) \
               AND ($3::BIGINT IS NULL OR i.price_cents >= $3) \
               AND ($4::BIGINT IS NULL OR i.price_cents <= $4) \
               AND ($5::BIGINT IS NULL OR i.seller_id = $5) \
               AND ($6 OR i.status = 'available') \
               AND ($7::TIMESTAMPTZ IS NULL \
                    OR i.created_at < $7 \
                    OR (i.created_at = $7 AND i.id < $8)) \
             ORDER BY i.created_at DESC, i.id DESC \
             LIMIT $9",
            ITEM_SELECT
        ))
        .bind(pattern)
        .bind(&filter.category)
        .bind(filter.min_price_cents)
        .bind(filter.max_price_cents)
        .bind(filter.seller_id)
        .bind(filter.include_sold)
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.iter().map(map_item).collect())
    }

    pub async fn purchase(&self, item_id: i64, buyer_id: i64) -> ServiceResult<Sale> {
        let mut tx = self.db.pool().begin().await?;

        let row = sqlx::query("SELECT seller_id, status FROM items WHERE id = $1 FOR UPDATE")
            .bind(item_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(ServiceError::NotFound("item"));
        };

        let seller_id: i64 = row.get("seller_id");
        let status: String = row.get("status");
        if seller_id == buyer_id {
            tx.rollback().await?;
            return Err(ServiceError::Validation("cannot buy your own item".into()));
        }
        if ItemStatus::from_db(&status) != Some(ItemStatus::Available) {
            tx.rollback().await?;
            return Err(ServiceError::Conflict("item already sold".into()));
        }

        sqlx::query(
            "UPDATE items SET status = 'sold', buyer_id = $2, sold_at = now() WHERE id = $1",
        )
        .bind(item_id)
        .bind(buyer_id)
        .execute(&mut *tx)
        .await?;

        let cart_holders: Vec<i64> =
            sqlx::query_scalar("DELETE FROM cart_items WHERE item_id = $1 RETURNING user_id")
                .bind(item_id)
                .fetch_all(&mut *tx)
                .await?;

        let row = sqlx::query(&format!("{} WHERE i.id = $1", ITEM_SELECT))
            .bind(item_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Sale {
            item: map_item(&row),
            cart_holders,
        })
    }

    /// Deletes an unsold listing owned by `seller_id` and clears it from carts.
    pub async fn withdraw(&self, item_id: i64, seller_id: i64) -> ServiceResult<Withdrawal> {
        let mut tx = self.db.pool().begin().await?;

        let row = sqlx::query("SELECT seller_id, status, title FROM items WHERE id = $1 FOR UPDATE")
            .bind(item_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(ServiceError::NotFound("item"));
        };

        let owner: i64 = row.get("seller_id");
        let status: String = row.get("status");
        if owner != seller_id {
            tx.rollback().await?;
            return Err(ServiceError::Forbidden("cannot delete other sellers' items".into()));
        }
        if ItemStatus::from_db(&status) == Some(ItemStatus::Sold) {
            tx.rollback().await?;
            return Err(ServiceError::Conflict("sold items cannot be deleted".into()));
        }

        let cart_holders: Vec<i64> =
            sqlx::query_scalar("DELETE FROM cart_items WHERE item_id = $1 RETURNING user_id")
                .bind(item_id)
                .fetch_all(&mut *tx)
                .await?;
        sqlx::query("DELETE FROM items WHERE id = $1")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Withdrawal {
            item_id,
            title: row.get("title"),
            cart_holders,
        })
    }
}

pub(crate) fn map_item(row: &PgRow) -> Item {
    let status: String = row.get("status");
    Item {
        id: row.get("id"),
        seller_id: row.get("seller_id"),
        seller_handle: row.get("seller_handle"),
        title: row.get("title"),
        description: row.get("description"),
        price_cents: row.get("price_cents"),
        category: row.get("category"),
        photo_key: row.get("photo_key"),
        status: ItemStatus::from_db(&status).unwrap_or(ItemStatus::Available),
        buyer_id: row.get("buyer_id"),
        created_at: row.get("created_at"),
    }
}

fn escape_like_pattern(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '%' | '_' | '\\' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}
