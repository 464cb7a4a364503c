//! Artifact staging.
//!
//! New code arrives as a byte stream (an upload body or an [`ArtifactSource`]), is
//! written to a private temporary file, synced, and then renamed into the staging
//! slot. The rename is the publish step, so the slot only ever holds a complete
//! artifact. The supervisor consumes the slot by renaming it again into a
//! per-generation path.
use crate::errors::StagingError;
use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::{Stream, StreamExt, stream};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const SLOT_NAME: &str = "pending-artifact";
const GENERATIONS_DIR: &str = "generations";
const READ_CHUNK: usize = 64 * 1024;

/// A stream of artifact bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StagingError>> + Send>>;

/// Where fetched artifacts come from (a blob store, a directory, ...).
#[async_trait]
pub trait ArtifactSource: Send + Sync + std::fmt::Debug {
    /// Opens the artifact called `name` for reading.
    async fn open(&self, name: &str) -> Result<ByteStream, StagingError>;
}

/// Serves artifacts from files in a local directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactSource for DirectorySource {
    async fn open(&self, name: &str) -> Result<ByteStream, StagingError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(StagingError::Source(format!("invalid artifact name {name:?}")));
        }
        let path = self.root.join(name);
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StagingError::Source(format!("{}: {e}", path.display())))?;

        let chunks = stream::unfold(Some(file), |file| async move {
            let mut file = file?;
            let mut buf = vec![0u8; READ_CHUNK];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some(file)))
                }
                Err(e) => Some((Err(StagingError::Io(e)), None)),
            }
        });
        Ok(Box::pin(chunks))
    }
}

/// The staging directory: temporary uploads, the slot, and adopted generations.
#[derive(Debug)]
pub struct ArtifactStaging {
    dir: PathBuf,
    slot: PathBuf,
    generations: PathBuf,
    uploads: AtomicU64,
}

impl ArtifactStaging {
    /// Prepares `dir` (creating it if needed).
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        let generations = dir.join(GENERATIONS_DIR);
        std::fs::create_dir_all(&generations)?;
        Ok(Self {
            slot: dir.join(SLOT_NAME),
            generations,
            dir,
            uploads: AtomicU64::new(0),
        })
    }

    /// Path of the staging slot.
    pub fn slot(&self) -> &Path {
        &self.slot
    }

    /// Whether a complete artifact is waiting in the slot.
    pub async fn has_pending(&self) -> bool {
        fs::try_exists(&self.slot).await.unwrap_or(false)
    }

    /// Writes `body` durably and publishes it into the slot, replacing any
    /// artifact that was staged but never adopted. Returns the byte count.
    pub async fn stage<S, E>(&self, body: S) -> Result<u64, StagingError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        let seq = self.uploads.fetch_add(1, Ordering::Relaxed);
        let temp = self
            .dir
            .join(format!(".incoming-{}-{seq}", std::process::id()));

        match self.write_durably(&temp, body).await {
            Ok(written) => {
                if let Err(e) = fs::rename(&temp, &self.slot).await {
                    let _ = fs::remove_file(&temp).await;
                    return Err(e.into());
                }
                // The rename only survives a crash once the directory entry is on disk.
                sync_dir(&self.dir).await?;
                info!(bytes = written, slot = %self.slot.display(), "Artifact staged");
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                warn!(error = %e, "Staging failed");
                Err(e)
            }
        }
    }

    /// Stages the artifact `name` from `source`.
    pub async fn stage_from(
        &self,
        source: &dyn ArtifactSource,
        name: &str,
    ) -> Result<u64, StagingError> {
        let body = source.open(name).await?;
        self.stage(body).await
    }

    async fn write_durably<S, E>(&self, path: &Path, body: S) -> Result<u64, StagingError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        let mut file = fs::File::create(path).await?;
        let mut written = 0u64;

        let mut body = std::pin::pin!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StagingError::Stream(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Moves the pending artifact into its own path for `generation`.
    ///
    /// Returns `Ok(None)` when nothing is staged. Once this returns `Some`, the
    /// slot is empty again, whether or not the artifact turns out to be usable.
    pub async fn adopt(
        &self,
        generation: u64,
        executable: bool,
    ) -> Result<Option<PathBuf>, StagingError> {
        let dest = self.generations.join(format!("{generation}-artifact"));
        match fs::rename(&self.slot, &dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if executable {
            set_executable(&dest).await?;
        }
        debug!(generation, path = %dest.display(), "Adopted pending artifact");
        Ok(Some(dest))
    }

    /// Deletes an adopted artifact that is no longer needed. Paths outside the
    /// generations directory (such as an operator-supplied initial artifact) are left alone.
    pub async fn retire(&self, path: &Path) {
        if !path.starts_with(&self.generations) {
            return;
        }
        if let Err(e) = fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove retired artifact");
        }
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
