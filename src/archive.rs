//! Archive staging and extraction.
//!
//! Uploaded objects are downloaded to `<archive_dir>/<basename>` and unpacked
//! into `<work_dir>/<radical>`.  Only the formats in [`ArchiveFormat`] are
//! accepted; anything else fails explicitly.  Archive contents are untrusted:
//! entries naming `.git` are refused so an upload can never plant git
//! metadata.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::event::NotificationEvent;
use crate::storage::ObjectStore;

// ---------------------------------------------------------------------------
// Format detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    TarGz,
    Zip,
    Tar,
}

/// Recognised extensions, longest first so `.tar.gz` wins over `.tar`.
const ARCHIVE_EXTENSIONS: &[(&str, ArchiveFormat)] = &[
    (".tar.gz", ArchiveFormat::TarGz),
    (".tgz", ArchiveFormat::TarGz),
    (".zip", ArchiveFormat::Zip),
    (".tar", ArchiveFormat::Tar),
];

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

impl ArchiveFormat {
    /// Format implied by a file name's extension (case-insensitive).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        ARCHIVE_EXTENSIONS
            .iter()
            .find(|(ext, _)| lower.ends_with(ext) && lower.len() > ext.len())
            .map(|(_, format)| *format)
    }

    /// Format implied by the first bytes of a file.
    pub fn from_magic(header: &[u8]) -> Option<Self> {
        if header.starts_with(GZIP_MAGIC) {
            Some(ArchiveFormat::TarGz)
        } else if header.starts_with(ZIP_MAGIC) || header.starts_with(ZIP_EMPTY_MAGIC) {
            Some(ArchiveFormat::Zip)
        } else if header.len() >= TAR_MAGIC_OFFSET + TAR_MAGIC.len()
            && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
        {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

/// Detect the format of the file at `path`: extension first, then content.
pub fn detect_format(path: &Path) -> Result<ArchiveFormat> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if let Some(format) = ArchiveFormat::from_file_name(name) {
        return Ok(format);
    }

    let mut header = Vec::with_capacity(TAR_MAGIC_OFFSET + TAR_MAGIC.len());
    File::open(path)
        .with_context(|| format!("open archive {}", path.display()))?
        .take((TAR_MAGIC_OFFSET + TAR_MAGIC.len()) as u64)
        .read_to_end(&mut header)
        .with_context(|| format!("read archive header {}", path.display()))?;

    match ArchiveFormat::from_magic(&header) {
        Some(format) => Ok(format),
        None => bail!(
            "unrecognised archive format: {} (expected .tar.gz, .tgz, .zip or .tar)",
            path.display()
        ),
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Local paths for one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPaths {
    /// `<archive_dir>/<basename>`
    pub archive: PathBuf,
    /// `<work_dir>/<radical>`
    pub extract_dir: PathBuf,
    /// `<repo_dir>/<radical>.git`
    pub git_dir: PathBuf,
}

impl StagingPaths {
    pub fn for_event(
        event: &NotificationEvent,
        archive_dir: &Path,
        repo_dir: &Path,
        work_dir: &Path,
    ) -> Result<Self> {
        let basename = event.basename();
        let radical = event.radical();
        // Both become single path components below fixed directories.
        for part in [basename, radical] {
            if part.is_empty() || part == "." || part == ".." || part.contains('\0') {
                bail!("object key {:?} does not name a file", event.key);
            }
        }
        let paths = Self {
            archive: archive_dir.join(basename),
            extract_dir: work_dir.join(radical),
            git_dir: repo_dir.join(format!("{radical}.git")),
        };

        // Everything under the extraction directory is committed.
        if paths.archive.starts_with(&paths.extract_dir)
            || paths.git_dir.starts_with(&paths.extract_dir)
            || paths.extract_dir.starts_with(&paths.git_dir)
        {
            bail!(
                "object key {:?} would extract to {}, which overlaps the staged archive or git directory",
                event.key,
                paths.extract_dir.display()
            );
        }
        Ok(paths)
    }
}

/// Download the notified object (at its version) to `paths.archive`.
#[instrument(skip(store, paths), fields(bucket = %event.bucket, key = %event.key, version = ?event.version))]
pub async fn stage_archive(
    store: &dyn ObjectStore,
    event: &NotificationEvent,
    paths: &StagingPaths,
) -> Result<u64> {
    let bytes = store
        .download(
            &event.bucket,
            &event.key,
            event.version.as_deref(),
            &paths.archive,
        )
        .await?;
    debug!(path = %paths.archive.display(), bytes, "archive staged");
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Detect the format of `archive` and unpack it into `dest`.
///
/// Runs on the blocking pool.  Entries that would land outside `dest` are
/// skipped or refused, and any entry naming `.git` fails the extraction.
#[instrument(fields(archive = %archive.display(), dest = %dest.display()))]
pub async fn extract(archive: &Path, dest: &Path) -> Result<ArchiveFormat> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    let format = tokio::task::spawn_blocking(move || -> Result<ArchiveFormat> {
        let format = detect_format(&archive)?;
        extract_sync(&archive, format, &dest)?;
        Ok(format)
    })
    .await
    .context("extraction task panicked")??;

    debug!(?format, "archive extracted");
    Ok(format)
}

fn extract_sync(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("create extraction directory {}", dest.display()))?;

    let file = File::open(archive).with_context(|| format!("open archive {}", archive.display()))?;
    let reader = BufReader::new(file);

    match format {
        ArchiveFormat::TarGz => unpack_tar(tar::Archive::new(GzDecoder::new(reader)), dest)
            .with_context(|| format!("unpack tar.gz {}", archive.display())),
        ArchiveFormat::Tar => unpack_tar(tar::Archive::new(reader), dest)
            .with_context(|| format!("unpack tar {}", archive.display())),
        ArchiveFormat::Zip => unpack_zip(reader, dest)
            .with_context(|| format!("unpack zip {}", archive.display())),
    }
}

/// Refuse paths that name git metadata anywhere (`.git`, any case).
fn reject_git_metadata(path: &Path) -> Result<()> {
    let touches_git = path.components().any(|c| match c {
        Component::Normal(name) => name.eq_ignore_ascii_case(".git"),
        _ => false,
    });
    if touches_git {
        bail!("archive entry {} refers to git metadata", path.display());
    }
    Ok(())
}

fn unpack_tar<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<()> {
    for entry in archive.entries().context("read tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        let path = entry.path().context("decode tar entry path")?.into_owned();
        reject_git_metadata(&path)?;
        if let Some(target) = entry.link_name().context("decode tar link target")? {
            reject_git_metadata(&target)?;
        }

        // `unpack_in` refuses entries that would land outside `dest`.
        if !entry
            .unpack_in(dest)
            .with_context(|| format!("unpack {}", path.display()))?
        {
            debug!(path = %path.display(), "skipped tar entry outside destination");
        }
    }
    Ok(())
}

fn unpack_zip<R: Read + Seek>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(reader).context("read zip directory")?;
    for idx in 0..archive.len() {
        let mut entry = archive
            .by_index(idx)
            .with_context(|| format!("read zip entry {idx}"))?;
        let Some(rel) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            bail!("zip entry {:?} escapes the extraction directory", entry.name());
        };
        reject_git_metadata(&rel)?;
        if entry.is_symlink() {
            bail!("zip entry {} is a symbolic link", rel.display());
        }

        let out = dest.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out)
                .with_context(|| format!("create directory {}", out.display()))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file =
            File::create(&out).with_context(|| format!("create {}", out.display()))?;
        std::io::copy(&mut entry, &mut file)
            .with_context(|| format!("write {}", out.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let mode = (mode & 0o777) | 0o600;
            std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("set permissions on {}", out.display()))?;
        }
    }
    Ok(())
}
