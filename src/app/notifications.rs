use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use time::OffsetDateTime;

use crate::app::error::{ServiceError, ServiceResult};
use crate::app::notifier::NotificationStore;
use crate::domain::notification::{NotificationRecord, PushMessage};
use crate::infra::db::{is_foreign_key_violation, Db};

pub const DEFAULT_LIST_LIMIT: i64 = 50;

const RECORD_COLUMNS: &str =
    "id, user_id, title, body, data, read_at IS NOT NULL AS is_read, created_at";

/// In-app inbox. Records are append-only apart from the read flag.
#[derive(Clone)]
pub struct NotificationService {
    db: Db,
}

impl NotificationService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        user_id: i64,
        message: &PushMessage,
    ) -> ServiceResult<NotificationRecord> {
        let data = message.data.clone().map(Value::Object);
        let row = sqlx::query(&format!(
            "INSERT INTO notifications (user_id, title, body, data) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {}",
            RECORD_COLUMNS
        ))
        .bind(user_id)
        .bind(&message.title)
        .bind(&message.body)
        .bind(data)
        .fetch_one(self.db.pool())
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                ServiceError::Referential(format!("user {} does not exist", user_id))
            } else {
                ServiceError::Database(err)
            }
        })?;

        Ok(map_record(&row))
    }

    /// Newest first, keyset-paginated on `(created_at, id)`.
    pub async fn list_for(
        &self,
        user_id: i64,
        cursor: Option<(OffsetDateTime, i64)>,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>> {
        let rows = match cursor {
            Some((created_at, notification_id)) => {
                sqlx::query(&format!(
                    "SELECT {} \
                     FROM notifications \
                     WHERE user_id = $1 \
                       AND (created_at < $2 OR (created_at = $2 AND id < $3)) \
                     ORDER BY created_at DESC, id DESC \
                     LIMIT $4",
                    RECORD_COLUMNS
                ))
                .bind(user_id)
                .bind(created_at)
                .bind(notification_id)
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} \
                     FROM notifications \
                     WHERE user_id = $1 \
                     ORDER BY created_at DESC, id DESC \
                     LIMIT $2",
                    RECORD_COLUMNS
                ))
                .bind(user_id)
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?
            }
        };

        Ok(rows.iter().map(map_record).collect())
    }

    /// Idempotent: an already-read record keeps its original read time.
    pub async fn mark_read(&self, record_id: i64) -> ServiceResult<NotificationRecord> {
        self.mark_read_scoped(record_id, None).await
    }

    /// Same as [`mark_read`](Self::mark_read) but only for records owned by
    /// `user_id`; anything else is reported as not found.
    pub async fn mark_read_owned(
        &self,
        record_id: i64,
        user_id: i64,
    ) -> ServiceResult<NotificationRecord> {
        self.mark_read_scoped(record_id, Some(user_id)).await
    }

    async fn mark_read_scoped(
        &self,
        record_id: i64,
        owner: Option<i64>,
    ) -> ServiceResult<NotificationRecord> {
        let row = sqlx::query(&format!(
            "UPDATE notifications \
             SET read_at = COALESCE(read_at, now()) \
             WHERE id = $1 AND ($2::BIGINT IS NULL OR user_id = $2) \
             RETURNING {}",
            RECORD_COLUMNS
        ))
        .bind(record_id)
        .bind(owner)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref()
            .map(map_record)
            .ok_or(ServiceError::NotFound("notification"))
    }

    pub async fn mark_all_read(&self, user_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notifications SET read_at = now() \
             WHERE user_id = $1 AND read_at IS NULL",
        )
        .bind(user_id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn unread_count(&self, user_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND read_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(self.db.pool())
        .await?;

        Ok(count)
    }
}

#[async_trait]
impl NotificationStore for NotificationService {
    async fn append(
        &self,
        user_id: i64,
        message: &PushMessage,
    ) -> ServiceResult<NotificationRecord> {
        NotificationService::append(self, user_id, message).await
    }
}

fn map_record(row: &PgRow) -> NotificationRecord {
    let data: Option<Value> = row.get("data");
    NotificationRecord {
        id: row.get("id"),
        owner_user_id: row.get("user_id"),
        title: row.get("title"),
        body: row.get("body"),
        data: match data {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        },
        read: row.get("is_read"),
        created_at: row.get("created_at"),
    }
}
