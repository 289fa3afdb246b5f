use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::app::error::{ServiceError, ServiceResult};
use crate::app::notifier::TokenDirectory;
use crate::domain::push_token::{PushToken, TransportKind};
use crate::infra::db::{is_foreign_key_violation, Db};

const MAX_TOKEN_LEN: usize = 4096;

#[derive(Debug, Clone)]
pub struct TokenRegistration {
    pub user_id: i64,
    pub token_value: String,
    pub platform: Option<String>,
    pub explicit_kind: Option<TransportKind>,
}

impl TokenRegistration {
    fn validate(&self) -> ServiceResult<()> {
        if self.user_id <= 0 {
            return Err(ServiceError::Validation("user_id is required".into()));
        }
        let token = self.token_value.trim();
        if token.is_empty() {
            return Err(ServiceError::Validation("token is required".into()));
        }
        if token.len() > MAX_TOKEN_LEN {
            return Err(ServiceError::Validation("token is too long".into()));
        }
        Ok(())
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.explicit_kind
            .unwrap_or_else(|| TransportKind::classify(&self.token_value))
    }
}

/// Postgres-backed directory of device push tokens.
#[derive(Clone)]
pub struct PushTokenService {
    db: Db,
}

impl PushTokenService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Upserts on the token value: a device that changes hands moves to the
    /// latest registrant.
    pub async fn register(&self, registration: TokenRegistration) -> ServiceResult<PushToken> {
        registration.validate()?;
        let kind = registration.transport_kind();

        let row = sqlx::query(
            "INSERT INTO push_tokens (token_value, owner_user_id, transport_kind, platform) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (token_value) DO UPDATE \
             SET owner_user_id = EXCLUDED.owner_user_id, \
                 transport_kind = EXCLUDED.transport_kind, \
                 platform = EXCLUDED.platform, \
                 updated_at = now() \
             RETURNING owner_user_id, token_value, transport_kind, platform, registered_at, updated_at",
        )
        .bind(registration.token_value.trim())
        .bind(registration.user_id)
        .bind(kind.as_db())
        .bind(&registration.platform)
        .fetch_one(self.db.pool())
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                ServiceError::Referential(format!("user {} does not exist", registration.user_id))
            } else {
                ServiceError::Database(err)
            }
        })?;

        Ok(map_token(&row))
    }

    pub async fn tokens_for(&self, user_ids: &[i64]) -> Result<Vec<PushToken>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT owner_user_id, token_value, transport_kind, platform, registered_at, updated_at \
             FROM push_tokens \
             WHERE owner_user_id = ANY($1) \
             ORDER BY owner_user_id, registered_at, token_value",
        )
        .bind(user_ids)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.iter().map(map_token).collect())
    }

    pub async fn revoke(&self, token_value: &str) -> Result<()> {
        sqlx::query("DELETE FROM push_tokens WHERE token_value = $1")
            .bind(token_value)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Removes a token only if `user_id` owns it.
    pub async fn unregister(&self, user_id: i64, token_value: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM push_tokens WHERE token_value = $1 AND owner_user_id = $2")
                .bind(token_value.trim())
                .bind(user_id)
                .execute(self.db.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TokenDirectory for PushTokenService {
    async fn tokens_for(&self, user_ids: &[i64]) -> Result<Vec<PushToken>> {
        PushTokenService::tokens_for(self, user_ids).await
    }

    async fn revoke(&self, token_value: &str) -> Result<()> {
        PushTokenService::revoke(self, token_value).await
    }
}

fn map_token(row: &PgRow) -> PushToken {
    let token_value: String = row.get("token_value");
    let stored_kind: String = row.get("transport_kind");
    let transport_kind = TransportKind::from_db(&stored_kind)
        .unwrap_or_else(|| TransportKind::classify(&token_value));

    PushToken {
        owner_user_id: row.get("owner_user_id"),
        token_value,
        transport_kind,
        platform: row.get("platform"),
        registered_at: row.get("registered_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(user_id: i64, token: &str) -> TokenRegistration {
        TokenRegistration {
            user_id,
            token_value: token.to_string(),
            platform: Some("ios".to_string()),
            explicit_kind: None,
        }
    }

    #[test]
    fn blank_token_is_rejected() {
        let err = registration(7, "   ").validate().unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn missing_user_is_rejected() {
        let err = registration(0, "ExponentPushToken[xyz]").validate().unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn kind_is_inferred_unless_explicit() {
        assert_eq!(
            registration(7, "ExponentPushToken[xyz]").transport_kind(),
            TransportKind::Expo
        );
        assert_eq!(registration(7, "fcm-opaque").transport_kind(), TransportKind::Fcm);

        let mut explicit = registration(7, "fcm-opaque");
        explicit.explicit_kind = Some(TransportKind::Expo);
        assert_eq!(explicit.transport_kind(), TransportKind::Expo);
    }
}
