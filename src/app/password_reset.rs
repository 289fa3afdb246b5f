use anyhow::Result;
use rand::Rng;
use subtle::ConstantTimeEq;

use crate::app::auth::{sha256_hex, AuthService};
use crate::infra::cache::RedisCache;
use crate::infra::mailer::Mailer;

/// Guesses allowed against one issued code before it is burned.
pub const MAX_RESET_ATTEMPTS: u64 = 5;

/// Single-use reset codes kept in Redis with a TTL. Only hashes are stored:
/// the key hashes the normalised email, the value hashes the code.
#[derive(Clone)]
pub struct PasswordResetService {
    auth: AuthService,
    cache: RedisCache,
    mailer: Mailer,
    ttl_seconds: u64,
}

impl PasswordResetService {
    pub fn new(auth: AuthService, cache: RedisCache, mailer: Mailer, ttl_seconds: u64) -> Self {
        Self {
            auth,
            cache,
            mailer,
            ttl_seconds,
        }
    }

    /// Issues a fresh code for `email`. Unknown addresses succeed silently.
    pub async fn request(&self, email: &str) -> Result<()> {
        let Some(user_id) = self.auth.find_user_id_by_email(email).await? else {
            tracing::debug!("password reset requested for unknown email");
            return Ok(());
        };

        let code = generate_code();
        self.cache
            .set_with_ttl(&reset_key(email), &sha256_hex(&code), self.ttl_seconds)
            .await?;
        self.cache.remove(&attempts_key(email)).await?;

        let minutes = (self.ttl_seconds / 60).max(1);
        let text = format!(
            "Your bazaar password reset code is {}. It expires in {} minutes.",
            code, minutes
        );
        if let Err(err) = self
            .mailer
            .send_text(email.trim(), "Your password reset code", &text)
            .await
        {
            tracing::error!(error = ?err, user_id, "failed to send password reset mail");
        }

        tracing::info!(user_id, "password reset code issued");
        Ok(())
    }

    /// Returns `false` when the code is missing, expired, wrong, used, or
    /// burned by too many attempts.
    pub async fn confirm(&self, email: &str, code: &str, new_password: &str) -> Result<bool> {
        let key = reset_key(email);
        let Some(stored) = self.cache.get(&key).await? else {
            return Ok(false);
        };

        // The attempt is counted before comparing, so parallel guesses share the budget.
        let attempts = attempts_key(email);
        let attempt = self
            .cache
            .increment_with_ttl(&attempts, self.ttl_seconds)
            .await?;
        if attempt > MAX_RESET_ATTEMPTS {
            self.burn(&key, &attempts).await?;
            return Ok(false);
        }

        let provided = sha256_hex(code.trim());
        if !bool::from(provided.as_bytes().ct_eq(stored.as_bytes())) {
            if attempt == MAX_RESET_ATTEMPTS {
                tracing::warn!("password reset code burned after repeated wrong guesses");
                self.burn(&key, &attempts).await?;
            }
            return Ok(false);
        }

        // Whoever deletes the key owns the code.
        if !self.cache.remove(&key).await? {
            return Ok(false);
        }

        self.cache.remove(&attempts).await?;

        let Some(user_id) = self.auth.find_user_id_by_email(email).await? else {
            return Ok(false);
        };
        self.auth.set_password(user_id, new_password).await?;

        tracing::info!(user_id, "password reset completed");
        Ok(true)
    }

    async fn burn(&self, key: &str, attempts_key: &str) -> Result<()> {
        self.cache.remove(key).await?;
        self.cache.remove(attempts_key).await?;
        Ok(())
    }
}

pub fn reset_key(email: &str) -> String {
    format!("password_reset:{}", email_digest(email))
}

pub fn attempts_key(email: &str) -> String {
    format!("password_reset_attempts:{}", email_digest(email))
}

fn email_digest(email: &str) -> String {
    sha256_hex(&email.trim().to_lowercase())
}

fn generate_code() -> String {
    let value: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:06}", value)
}
