use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::Client;
use tracing::{debug, instrument};

use super::ObjectStore;
use crate::config::S3Config;

/// Error code S3 returns from `GetBucketTagging` on an untagged bucket.
const NO_SUCH_TAG_SET: &str = "NoSuchTagSet";

/// Build an S3 client from the environment plus the optional overrides in
/// the `s3` config section.
pub async fn build_s3_client(config: &S3Config) -> Result<Client> {
    let mut aws_config_loader = aws_config::from_env();

    if let Some(region) = &config.region {
        aws_config_loader = aws_config_loader.region(aws_config::Region::new(region.clone()));
    }
    if let Some(endpoint) = &config.endpoint_url {
        aws_config_loader = aws_config_loader.endpoint_url(endpoint);
    }

    let aws_config = aws_config_loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(config.force_path_style)
        .build();

    let client = Client::from_conf(s3_config);
    tracing::info!(
        region = ?aws_config.region(),
        endpoint = ?config.endpoint_url,
        path_style = config.force_path_style,
        "S3 client initialised"
    );
    Ok(client)
}

/// [`ObjectStore`] backed by `aws-sdk-s3`.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(%bucket))]
    async fn bucket_tags(&self, bucket: &str) -> Result<HashMap<String, String>> {
        let resp = match self.client.get_bucket_tagging().bucket(bucket).send().await {
            Ok(resp) => resp,
            Err(err) => {
                if err.as_service_error().and_then(|e| e.code()) == Some(NO_SUCH_TAG_SET) {
                    debug!("bucket has no tag set");
                    return Ok(HashMap::new());
                }
                return Err(err).with_context(|| format!("S3 GetBucketTagging on {bucket}"));
            }
        };

        let tags: HashMap<String, String> = resp
            .tag_set()
            .iter()
            .map(|tag| (tag.key().to_string(), tag.value().to_string()))
            .collect();

        debug!(count = tags.len(), "bucket tags fetched");
        Ok(tags)
    }

    #[instrument(skip(self), fields(%bucket, %key))]
    async fn object_metadata(&self, bucket: &str, key: &str) -> Result<HashMap<String, String>> {
        let resp = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("S3 HeadObject s3://{bucket}/{key}"))?;

        let metadata = resp.metadata().cloned().unwrap_or_default();
        debug!(count = metadata.len(), "object metadata fetched");
        Ok(metadata)
    }

    #[instrument(skip(self), fields(%bucket, %key, ?version, dest = %dest.display()))]
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> Result<u64> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version.map(str::to_string))
            .send()
            .await
            .with_context(|| format!("S3 GetObject s3://{bucket}/{key}"))?;

        let bytes = resp
            .body
            .collect()
            .await
            .context("read S3 GetObject body")?
            .into_bytes();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create parent dirs for {}", dest.display()))?;
        }

        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("write downloaded object to {}", dest.display()))?;

        debug!(bytes = bytes.len(), "object downloaded");
        Ok(bytes.len() as u64)
    }
}
