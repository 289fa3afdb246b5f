use anyhow::{anyhow, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct ObjectStorage {
    client: Client,
    bucket: String,
    public_endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PresignedUpload {
    pub object_key: String,
    pub upload_url: String,
    pub expires_in_seconds: u64,
    pub headers: Vec<UploadHeader>,
}

#[derive(Debug, Serialize)]
pub struct UploadHeader {
    pub name: String,
    pub value: String,
}

impl ObjectStorage {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let region_provider = RegionProviderChain::first_try(Region::new(config.s3_region.clone()));
        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared_config)
            .region(shared_config.region().cloned())
            .endpoint_url(config.s3_endpoint.clone())
            .force_path_style(true);
        if let Some(provider) = shared_config.credentials_provider() {
            s3_builder = s3_builder.credentials_provider(provider);
        }
        let s3_config = s3_builder.build();

        let client = Client::from_conf(s3_config);

        Ok(Self {
            client,
            bucket: config.s3_bucket.clone(),
            public_endpoint: config.s3_public_endpoint.clone(),
        })
    }

    /// Presigns a PUT for `object_key` so the client uploads directly to the
    /// bucket. The URL host is rewritten when a public endpoint is configured.
    pub async fn presign_put(
        &self,
        object_key: String,
        content_type: &str,
        bytes: i64,
        expires_in_seconds: u64,
    ) -> Result<PresignedUpload> {
        let presign_config = PresigningConfig::expires_in(Duration::from_secs(expires_in_seconds))?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(content_type)
            .content_length(bytes)
            .presigned(presign_config)
            .await?;

        let headers = presigned
            .headers()
            .map(|(name, value)| UploadHeader {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect();

        let mut upload_url = presigned.uri().to_string();
        if let Some(ref public_endpoint) = self.public_endpoint {
            match rewrite_presigned_url(&upload_url, public_endpoint) {
                Ok(rewritten) => upload_url = rewritten,
                Err(err) => tracing::warn!(error = ?err, "failed to rewrite presigned upload URL"),
            }
        }

        Ok(PresignedUpload {
            object_key,
            upload_url,
            expires_in_seconds,
            headers,
        })
    }
}

fn rewrite_presigned_url(original: &str, public_endpoint: &str) -> Result<String> {
    let mut original_url = Url::parse(original)?;
    let public_url = if public_endpoint.contains("://") {
        Url::parse(public_endpoint)?
    } else {
        Url::parse(&format!("http://{}", public_endpoint))?
    };

    original_url
        .set_scheme(public_url.scheme())
        .map_err(|_| anyhow!("invalid scheme for public endpoint"))?;
    original_url
        .set_host(public_url.host_str())
        .map_err(|_| anyhow!("invalid host for public endpoint"))?;
    original_url.set_port(public_url.port()).ok();

    Ok(original_url.to_string())
}
