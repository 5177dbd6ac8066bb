//! In-memory [`ObjectStore`] for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::ObjectStore;

#[derive(Default)]
pub struct MemoryStore {
    tags: HashMap<String, HashMap<String, String>>,
    objects: HashMap<(String, String), StoredObject>,
    downloads: Mutex<Vec<(String, String, Option<String>)>>,
}

struct StoredObject {
    /// `(version, body)`; the last entry is the latest version.
    versions: Vec<(String, Vec<u8>)>,
    metadata: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, bucket: &str, key: &str, value: &str) -> Self {
        self.tags
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_object(mut self, bucket: &str, key: &str, version: &str, body: Vec<u8>) -> Self {
        self.objects
            .entry((bucket.to_string(), key.to_string()))
            .or_insert_with(|| StoredObject {
                versions: Vec::new(),
                metadata: HashMap::new(),
            })
            .versions
            .push((version.to_string(), body));
        self
    }

    pub fn with_metadata(mut self, bucket: &str, key: &str, name: &str, value: &str) -> Self {
        if let Some(obj) = self.objects.get_mut(&(bucket.to_string(), key.to_string())) {
            obj.metadata.insert(name.to_string(), value.to_string());
        }
        self
    }

    /// Every `(bucket, key, version)` downloaded so far, in order.
    pub fn downloads(&self) -> Vec<(String, String, Option<String>)> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn bucket_tags(&self, bucket: &str) -> Result<HashMap<String, String>> {
        Ok(self.tags.get(bucket).cloned().unwrap_or_default())
    }

    async fn object_metadata(&self, bucket: &str, key: &str) -> Result<HashMap<String, String>> {
        let obj = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .with_context(|| format!("no such object s3://{bucket}/{key}"))?;
        Ok(obj.metadata.clone())
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> Result<u64> {
        let obj = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .with_context(|| format!("no such object s3://{bucket}/{key}"))?;
        let body = match version {
            Some(v) => obj
                .versions
                .iter()
                .find(|(ver, _)| ver == v)
                .map(|(_, body)| body)
                .with_context(|| format!("no version {v} of s3://{bucket}/{key}"))?,
            None => obj
                .versions
                .last()
                .map(|(_, body)| body)
                .context("object has no versions")?,
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, body).await?;

        self.downloads.lock().unwrap().push((
            bucket.to_string(),
            key.to_string(),
            version.map(str::to_string),
        ));
        Ok(body.len() as u64)
    }
}
