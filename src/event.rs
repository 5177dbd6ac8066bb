//! Notification payload parsing.
//!
//! Decodes the S3 event-notification document into an [`Invocation`]: an
//! ordered list of `(bucket, key, version)` triples and a dry-run flag.

use anyhow::{Context, Result};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One uploaded object to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEvent {
    pub bucket: String,
    pub key: String,
    pub version: Option<String>,
}

impl NotificationEvent {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version: version.filter(|v| !v.is_empty()).map(str::to_string),
        }
    }

    pub fn basename(&self) -> &str {
        basename(&self.key)
    }

    pub fn radical(&self) -> &str {
        radical(&self.key)
    }
}

/// A decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub dry_run: bool,
    pub events: Vec<NotificationEvent>,
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawPayload {
    #[serde(rename = "dryRun", default)]
    dry_run: Option<bool>,
    #[serde(rename = "Records", default)]
    records: Vec<RawRecord>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    s3: RawS3,
}

#[derive(Debug, Deserialize)]
struct RawS3 {
    bucket: RawBucket,
    object: RawObject,
}

#[derive(Debug, Deserialize)]
struct RawBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    key: String,
    /// Standard S3 notifications call this `versionId`.
    #[serde(default, alias = "versionId")]
    version: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a notification payload.
///
/// A payload without `Records` (e.g. the `s3:TestEvent` S3 sends when a
/// notification is first configured) yields zero events.
pub fn parse_invocation(payload: &[u8]) -> Result<Invocation> {
    let raw: RawPayload =
        serde_json::from_slice(payload).context("failed to parse notification payload")?;

    let events = raw
        .records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| {
            let key = decode_key(&record.s3.object.key)
                .with_context(|| format!("record {idx}: invalid object key"))?;
            Ok(NotificationEvent::new(
                record.s3.bucket.name,
                key,
                record.s3.object.version.as_deref(),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Invocation {
        dry_run: raw.dry_run.unwrap_or(false),
        events,
    })
}

/// Undo the form-style URL encoding S3 applies to keys in notifications
/// (`+` for space, `%XX` for everything else that needs escaping).
fn decode_key(raw: &str) -> Result<String> {
    let plus_decoded = raw.replace('+', " ");
    let decoded = percent_decode_str(&plus_decoded)
        .decode_utf8()
        .context("object key is not valid UTF-8 after decoding")?;
    anyhow::ensure!(!decoded.is_empty(), "object key is empty");
    Ok(decoded.into_owned())
}

// ---------------------------------------------------------------------------
// Key naming
// ---------------------------------------------------------------------------

/// Final path component of an object key.
///
/// `"a/b/name.tar.gz"` → `"name.tar.gz"`; a key without `/` is returned as is.
pub fn basename(key: &str) -> &str {
    match key.rfind('/') {
        Some(idx) => &key[idx + 1..],
        None => key,
    }
}

/// Basename with everything from the first `.` removed.
///
/// `"a/b/name.tar.gz"` → `"name"`; a basename without `.` is returned as is.
pub fn radical(key: &str) -> &str {
    let base = basename(key);
    match base.find('.') {
        Some(idx) => &base[..idx],
        None => base,
    }
}
