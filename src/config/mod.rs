pub mod delivery;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::SocketAddr;
use std::str::FromStr;

pub use delivery::{MailConfig, PushConfig};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub http_addr: SocketAddr,
    pub database_url: String,
    pub db_pool: DbPoolConfig,
    pub redis_url: String,
    pub s3_endpoint: String,
    pub s3_public_endpoint: Option<String>,
    pub s3_region: String,
    pub s3_bucket: String,
    /// Lifetime of presigned photo upload URLs.
    pub upload_url_ttl_seconds: u64,
    pub upload_max_bytes: i64,
    pub paseto_access_key: [u8; 32],
    pub paseto_refresh_key: [u8; 32],
    pub access_ttl_minutes: u64,
    pub refresh_ttl_days: u64,
    pub reset_code_ttl_seconds: u64,
    pub push: PushConfig,
    pub mail: MailConfig,
}

#[derive(Clone, Debug)]
pub struct DbPoolConfig {
    pub max_connections: u32,
    pub connect_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub max_lifetime_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let http_addr = env_or_parse("HTTP_ADDR", "0.0.0.0:8080")?;

        Ok(Self {
            http_addr,
            database_url: env_or_err("DATABASE_URL")?,
            db_pool: DbPoolConfig {
                max_connections: env_or_parse("DB_MAX_CONNECTIONS", "25")?,
                connect_timeout_seconds: env_or_parse("DB_CONNECT_TIMEOUT_SECONDS", "5")?,
                idle_timeout_seconds: env_or_parse("DB_IDLE_TIMEOUT_SECONDS", "300")?,
                max_lifetime_seconds: env_or_parse("DB_MAX_LIFETIME_SECONDS", "1800")?,
            },
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1/"),
            s3_endpoint: env_or_err("S3_ENDPOINT")?,
            s3_public_endpoint: std::env::var("S3_PUBLIC_ENDPOINT").ok(),
            s3_region: env_or("S3_REGION", "us-east-1"),
            s3_bucket: env_or_err("S3_BUCKET")?,
            upload_url_ttl_seconds: env_or_parse("UPLOAD_URL_TTL_SECONDS", "900")?,
            upload_max_bytes: env_or_parse("UPLOAD_MAX_BYTES", "10485760")?,
            paseto_access_key: env_key_32("PASETO_ACCESS_KEY")?,
            paseto_refresh_key: env_key_32("PASETO_REFRESH_KEY")?,
            access_ttl_minutes: env_or_parse("ACCESS_TTL_MINUTES", "15")?,
            refresh_ttl_days: env_or_parse("REFRESH_TTL_DAYS", "30")?,
            reset_code_ttl_seconds: env_or_parse("RESET_CODE_TTL_SECONDS", "900")?,
            push: PushConfig::from_env()?,
            mail: MailConfig::from_env()?,
        })
    }
}

pub(crate) fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_or_err(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {}", key))
}

pub(crate) fn env_or_parse<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    env_or(key, default)
        .parse::<T>()
        .map_err(|err| anyhow!("invalid {}: {}", key, err))
}

fn env_key_32(key: &str) -> Result<[u8; 32]> {
    decode_key_32(key, &env_or_err(key)?)
}

/// PASETO v4.local keys arrive base64-encoded and must be exactly 32 bytes.
fn decode_key_32(name: &str, encoded: &str) -> Result<[u8; 32]> {
    let decoded = STANDARD
        .decode(encoded.trim().as_bytes())
        .map_err(|err| anyhow!("invalid {}: {}", name, err))?;
    decoded
        .try_into()
        .map_err(|_| anyhow!("invalid {}: expected 32 bytes", name))
}
