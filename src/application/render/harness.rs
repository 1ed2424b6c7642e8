use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

const COPY_BUFFER_BYTES: usize = 64 * 1024;

/// Per-job scratch directory at `<root>/<job_id>`, exclusively owned by one worker task.
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub fn path_for(root: &Path, job_id: Uuid) -> PathBuf {
        root.join(job_id.to_string())
    }

    pub async fn create(root: &Path, job_id: Uuid) -> io::Result<Self> {
        let dir = Self::path_for(root, job_id);
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Delete everything inside the workspace but keep the directory.
    pub async fn clear(&self) -> io::Result<()> {
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    /// Remove the workspace of `job_id` under `root`. Already gone counts as success.
    pub async fn discard(root: &Path, job_id: Uuid) -> io::Result<()> {
        match fs::remove_dir_all(Self::path_for(root, job_id)).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid artifact name `{0}`")]
    InvalidName(String),
    #[error("failed to stage artifact: {0}")]
    Io(#[from] io::Error),
    #[error("failed to move artifact into place: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("publish task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedArtifact {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Copy `source` to `<output_dir>/<file_name>` so readers only ever see the complete file.
///
/// The bytes go to a temp file in `output_dir`, are synced to disk and then renamed over
/// the final name. On any failure the temp file is deleted and nothing is published.
pub async fn publish_atomically(
    source: &Path,
    output_dir: &Path,
    file_name: &str,
) -> Result<PublishedArtifact, PublishError> {
    if file_name.is_empty() || file_name.contains(['/', '\\']) || file_name.starts_with('.') {
        return Err(PublishError::InvalidName(file_name.to_string()));
    }

    let source = source.to_path_buf();
    let output_dir = output_dir.to_path_buf();
    let file_name = file_name.to_string();

    tokio::task::spawn_blocking(move || publish_blocking(&source, &output_dir, &file_name))
        .await
        .map_err(|err| PublishError::Join(err.to_string()))?
}

fn publish_blocking(
    source: &Path,
    output_dir: &Path,
    file_name: &str,
) -> Result<PublishedArtifact, PublishError> {
    std::fs::create_dir_all(output_dir)?;

    let mut input = File::open(source)?;
    // Dropping `staged` on an early return deletes it.
    let mut staged = NamedTempFile::new_in(output_dir)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
    let mut bytes: u64 = 0;

    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        staged.write_all(&buffer[..read])?;
        hasher.update(&buffer[..read]);
        bytes += read as u64;
    }

    staged.flush()?;
    staged.as_file().sync_all()?;

    let path = output_dir.join(file_name);
    staged.persist(&path)?;
    sync_directory(output_dir);

    Ok(PublishedArtifact {
        path,
        bytes,
        sha256: hex::encode(hasher.finalize()),
    })
}

#[cfg(unix)]
fn sync_directory(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
        tracing::debug!(
            target = "render_lease::render",
            dir = %dir.display(),
            error = %err,
            "Directory sync after publish failed"
        );
    }
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) {}
