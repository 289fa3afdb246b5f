use anyhow::Result;
use sqlx::Row;

use crate::domain::user::{PublicUser, User};
use crate::infra::db::Db;

#[derive(Clone)]
pub struct UserService {
    db: Db,
}

impl UserService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Public profile with the number of listings still for sale.
    pub async fn get_public(&self, user_id: i64) -> Result<Option<PublicUser>> {
        let row = sqlx::query(
            "SELECT u.id, u.handle, u.email, u.display_name, u.created_at, \
                    (SELECT COUNT(*) FROM items i \
                     WHERE i.seller_id = u.id AND i.status = 'available') AS listings_count \
             FROM users u WHERE u.id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;

        let user = row.map(|row| {
            let listings_count: i64 = row.get("listings_count");
            PublicUser::from_user(
                User {
                    id: row.get("id"),
                    handle: row.get("handle"),
                    email: row.get("email"),
                    display_name: row.get("display_name"),
                    created_at: row.get("created_at"),
                },
                listings_count,
            )
        });

        Ok(user)
    }
}
