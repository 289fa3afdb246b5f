pub mod app;
pub mod config;
pub mod domain;
pub mod http;
pub mod infra;
pub mod push;

use anyhow::Result;
use std::sync::Arc;

use crate::app::auth::{AuthKeys, AuthService};
use crate::app::notifications::NotificationService;
use crate::app::notifier::Notifier;
use crate::app::push_tokens::PushTokenService;
use crate::config::AppConfig;
use crate::infra::{cache::RedisCache, db::Db, mailer::Mailer, storage::ObjectStorage};
use crate::push::Transports;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub cache: RedisCache,
    pub storage: ObjectStorage,
    pub mailer: Mailer,
    pub notifier: Notifier,
    pub auth_keys: AuthKeys,
    pub upload_url_ttl_seconds: u64,
    pub upload_max_bytes: i64,
    pub reset_code_ttl_seconds: u64,
}

impl AppState {
    /// Connects every backing service named in `config`.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let db = Db::connect(config).await?;
        let cache = RedisCache::connect(&config.redis_url).await?;
        let storage = ObjectStorage::new(config).await?;
        let transports = Transports::from_config(&config.push)?;
        Self::assemble(config, db, cache, storage, transports)
    }

    /// Wires services around already-connected infrastructure.
    pub fn assemble(
        config: &AppConfig,
        db: Db,
        cache: RedisCache,
        storage: ObjectStorage,
        transports: Transports,
    ) -> Result<Self> {
        let notifier = Notifier::new(
            Arc::new(PushTokenService::new(db.clone())),
            Arc::new(NotificationService::new(db.clone())),
            transports,
        );

        Ok(Self {
            mailer: Mailer::new(config.mail.clone())?,
            notifier,
            auth_keys: AuthKeys {
                access_key: config.paseto_access_key,
                refresh_key: config.paseto_refresh_key,
                access_ttl_minutes: config.access_ttl_minutes,
                refresh_ttl_days: config.refresh_ttl_days,
            },
            upload_url_ttl_seconds: config.upload_url_ttl_seconds,
            upload_max_bytes: config.upload_max_bytes,
            reset_code_ttl_seconds: config.reset_code_ttl_seconds,
            db,
            cache,
            storage,
        })
    }

    pub fn auth_service(&self) -> AuthService {
        AuthService::new(self.db.clone(), self.auth_keys.clone())
    }
}
