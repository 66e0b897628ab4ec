//! Content-addressed disk cache.
//!
//! Every artifact derived from a source URL is stored under the same
//! [`CacheKey`], one directory per [`ArtifactCategory`]:
//!
//! ```text
//! <root>/videos/<key>.mp4
//! <root>/audio/<key>.<ext>
//! <root>/frames/<key>/frame_0001.png ...
//! ```
//!
//! The directory listing is the index; there is no eviction and no expiry.
//! Writes land in a temporary sibling first and are renamed into place so a
//! reader never sees a half written file.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task;
use walkdir::WalkDir;

use crate::error::{Error, IoContext, Result};
use crate::formats::format_bytes;
use crate::transcode::AudioFormat;

const KEY_HEX_LEN: usize = 32;
pub const FRAME_EXTENSION: &str = "png";

/// First 128 bits of the BLAKE3 digest of a source URL, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_url(url: &str) -> Self {
        let digest = blake3::hash(url.as_bytes());
        let hex = digest.to_hex();
        Self(hex[..KEY_HEX_LEN].to_string())
    }

    /// Accepts a key previously handed out to a client (the `videoId` field).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let valid = value.len() == KEY_HEX_LEN
            && value
                .chars()
                .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactCategory {
    Videos,
    Audio,
    Frames,
}

impl ArtifactCategory {
    pub const ALL: [ArtifactCategory; 3] = [Self::Videos, Self::Frames, Self::Audio];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Videos => "videos",
            Self::Audio => "audio",
            Self::Frames => "frames",
        }
    }
}

impl FromStr for ArtifactCategory {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "videos" | "video" => Ok(Self::Videos),
            "audio" => Ok(Self::Audio),
            "frames" | "frame" => Ok(Self::Frames),
            other => Err(Error::invalid_input(format!(
                "unknown cache category: {other}"
            ))),
        }
    }
}

/// What a purge should delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeTarget {
    All,
    Category(ArtifactCategory),
}

impl PurgeTarget {
    pub fn categories(self) -> Vec<ArtifactCategory> {
        match self {
            Self::All => ArtifactCategory::ALL.to_vec(),
            Self::Category(category) => vec![category],
        }
    }
}

impl FromStr for PurgeTarget {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        if value.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        value
            .parse::<ArtifactCategory>()
            .map(Self::Category)
            .map_err(|_| Error::invalid_input("type must be one of all, videos, frames, audio"))
    }
}

/// A concrete artifact kind, which fixes the category and the on-disk name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Video,
    Audio(AudioFormat),
    Frames,
}

impl Artifact {
    pub fn category(self) -> ArtifactCategory {
        match self {
            Self::Video => ArtifactCategory::Videos,
            Self::Audio(_) => ArtifactCategory::Audio,
            Self::Frames => ArtifactCategory::Frames,
        }
    }

    pub fn file_name(self, key: &CacheKey) -> String {
        match self {
            Self::Video => format!("{key}.mp4"),
            Self::Audio(format) => format!("{key}.{}", format.extension()),
            Self::Frames => key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedArtifact {
    Bytes(Vec<u8>),
    /// Frame images in temporal order.
    Frames(Vec<PathBuf>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub count: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub videos: CategoryStats,
    pub frames: CategoryStats,
    pub audio: CategoryStats,
}

impl CacheStats {
    pub fn total_size(&self) -> u64 {
        self.videos.size + self.frames.size + self.audio.size
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub count: u64,
    pub size: u64,
}

impl PurgeReport {
    pub fn summary(&self) -> String {
        format!(
            "Removed {} cached item(s), freed {}",
            self.count,
            format_bytes(self.size)
        )
    }
}

/// In-process async locks keyed by `(category, key)`, so two requests for
/// the same artifact do not fetch or transcode it twice.
#[derive(Default)]
pub struct KeyLocks {
    inner: Mutex<HashMap<(ArtifactCategory, CacheKey), Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub async fn acquire(&self, category: ArtifactCategory, key: &CacheKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock();
            // Entries only referenced by the map are idle.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry((category, key.clone())).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().len()
    }
}

pub struct DiskCache {
    root: PathBuf,
    locks: KeyLocks,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyLocks::default(),
        }
    }

    pub fn category_dir(&self, category: ArtifactCategory) -> PathBuf {
        self.root.join(category.dir_name())
    }

    pub fn path_for(&self, artifact: Artifact, key: &CacheKey) -> PathBuf {
        self.category_dir(artifact.category())
            .join(artifact.file_name(key))
    }

    pub async fn lock(&self, category: ArtifactCategory, key: &CacheKey) -> OwnedMutexGuard<()> {
        self.locks.acquire(category, key).await
    }

    pub async fn has(&self, artifact: Artifact, key: &CacheKey) -> bool {
        match artifact {
            Artifact::Frames => self
                .frame_files(key)
                .await
                .is_ok_and(|frames| !frames.is_empty()),
            _ => tokio::fs::metadata(self.path_for(artifact, key))
                .await
                .is_ok_and(|meta| meta.is_file()),
        }
    }

    /// Reads an artifact back. Never fetches anything; `None` means absent.
    pub async fn get(&self, artifact: Artifact, key: &CacheKey) -> Result<Option<CachedArtifact>> {
        if let Artifact::Frames = artifact {
            let frames = self.frame_files(key).await?;
            return Ok((!frames.is_empty()).then_some(CachedArtifact::Frames(frames)));
        }

        let path = self.path_for(artifact, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(CachedArtifact::Bytes(bytes))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::io(format!("reading {}", path.display()), err)),
        }
    }

    /// Sorted frame files of a frame-set; empty when the set does not exist.
    pub async fn frame_files(&self, key: &CacheKey) -> Result<Vec<PathBuf>> {
        let dir = self.path_for(Artifact::Frames, key);
        blocking(move || list_frames(&dir)).await
    }

    pub async fn put_bytes(&self, artifact: Artifact, key: &CacheKey, data: Vec<u8>) -> Result<PathBuf> {
        let target = self.path_for(artifact, key);
        blocking(move || {
            write_atomic(&target, |file| {
                io::Write::write_all(file, &data)?;
                Ok(())
            })?;
            Ok(target)
        })
        .await
    }

    /// Moves a finished file (usually from the scratch directory) into the
    /// cache and returns its size. Falls back to a copy when `source` lives on
    /// another filesystem; the source is left in place in that case.
    pub async fn put_file(&self, artifact: Artifact, key: &CacheKey, source: &Path) -> Result<u64> {
        let target = self.path_for(artifact, key);
        let source = source.to_path_buf();
        blocking(move || {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
            }
            if let Err(err) = fs::rename(&source, &target) {
                tracing::debug!(error = %err, source = %source.display(), "rename failed, copying");
                write_atomic(&target, |file| {
                    let mut reader = fs::File::open(&source)?;
                    io::copy(&mut reader, file)?;
                    Ok(())
                })?;
            }
            let meta = fs::metadata(&target).io_context(|| format!("stat {}", target.display()))?;
            Ok(meta.len())
        })
        .await
    }

    /// Replaces the frame-set of `key` with `frames`, renumbering them in the
    /// given order.
    pub async fn put_frames(&self, key: &CacheKey, frames: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
        let target = self.path_for(Artifact::Frames, key);
        let parent = self.category_dir(ArtifactCategory::Frames);
        let staging = parent.join(format!(".{key}.staging-{}", std::process::id()));
        blocking(move || {
            fs::create_dir_all(&parent).io_context(|| format!("creating {}", parent.display()))?;
            if staging.exists() {
                fs::remove_dir_all(&staging)
                    .io_context(|| format!("clearing {}", staging.display()))?;
            }
            fs::create_dir_all(&staging)
                .io_context(|| format!("creating {}", staging.display()))?;

            for (index, frame) in frames.iter().enumerate() {
                let name = frame_file_name(index + 1);
                fs::copy(frame, staging.join(&name))
                    .io_context(|| format!("copying {}", frame.display()))?;
            }

            if target.exists() {
                fs::remove_dir_all(&target)
                    .io_context(|| format!("replacing {}", target.display()))?;
            }
            fs::rename(&staging, &target)
                .io_context(|| format!("publishing {}", target.display()))?;
            list_frames(&target)
        })
        .await
    }

    /// Recursive size of a category directory; 0 when it does not exist.
    pub async fn size_of(&self, category: ArtifactCategory) -> Result<u64> {
        let dir = self.category_dir(category);
        blocking(move || Ok(dir_size(&dir))).await
    }

    /// Number of top-level entries (files or frame-set directories).
    pub async fn count_of(&self, category: ArtifactCategory) -> Result<u64> {
        let dir = self.category_dir(category);
        blocking(move || count_entries(&dir)).await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for category in ArtifactCategory::ALL {
            let entry = CategoryStats {
                count: self.count_of(category).await?,
                size: self.size_of(category).await?,
            };
            match category {
                ArtifactCategory::Videos => stats.videos = entry,
                ArtifactCategory::Frames => stats.frames = entry,
                ArtifactCategory::Audio => stats.audio = entry,
            }
        }
        Ok(stats)
    }

    /// Deletes whole category directories and reports what was removed.
    pub async fn purge(&self, target: PurgeTarget) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        for category in target.categories() {
            let dir = self.category_dir(category);
            let removed = blocking(move || {
                if !dir.exists() {
                    return Ok(PurgeReport::default());
                }
                let removed = PurgeReport {
                    count: count_entries(&dir)?,
                    size: dir_size(&dir),
                };
                fs::remove_dir_all(&dir).io_context(|| format!("removing {}", dir.display()))?;
                Ok(removed)
            })
            .await?;
            tracing::info!(
                category = category.dir_name(),
                count = removed.count,
                bytes = removed.size,
                "purged cache category"
            );
            report.count += removed.count;
            report.size += removed.size;
        }
        Ok(report)
    }
}

pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:04}.{FRAME_EXTENSION}")
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .map_err(|err| Error::io("joining cache task", io::Error::other(err)))?
}

fn write_atomic<F>(target: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    let parent = target
        .parent()
        .ok_or_else(|| Error::invalid_input(format!("{} has no parent", target.display())))?;
    fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;

    let mut staged = NamedTempFile::new_in(parent)
        .io_context(|| format!("staging write in {}", parent.display()))?;
    fill(staged.as_file_mut()).io_context(|| format!("writing {}", target.display()))?;
    staged
        .as_file()
        .sync_all()
        .io_context(|| format!("syncing {}", target.display()))?;
    staged
        .persist(target)
        .map_err(|err| Error::io(format!("persisting {}", target.display()), err.error))?;
    Ok(())
}

fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::io(format!("listing {}", dir.display()), err)),
    };

    let mut frames: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(FRAME_EXTENSION))
        })
        .collect();
    frames.sort();
    Ok(frames)
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

fn count_entries(dir: &Path) -> Result<u64> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(Error::io(format!("listing {}", dir.display()), err)),
    };
    let count = entries
        .flatten()
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .count();
    Ok(count as u64)
}
