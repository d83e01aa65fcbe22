//! On-disk layout of post directories.

use super::error::PostsError;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

pub const RECORD_FILE: &str = "post.record";
pub const UPLOADS_DIRECTORY: &str = "uploads";

#[derive(Debug, Clone)]
pub struct PostTree {
    root: PathBuf,
}

impl PostTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn directory_for(&self, slug: &str) -> PathBuf {
        self.root.join(slug)
    }

    pub fn record_path(post_directory: &Path) -> PathBuf {
        post_directory.join(RECORD_FILE)
    }

    pub fn uploads_directory(post_directory: &Path) -> PathBuf {
        post_directory.join(UPLOADS_DIRECTORY)
    }

    pub async fn ensure_root(&self) -> Result<(), PostsError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Creates a post directory, refusing to reuse an existing one.
    pub async fn create_directory(&self, path: &Path) -> Result<(), PostsError> {
        match fs::create_dir(path).await {
            Ok(()) => {
                debug!("Created post directory {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(PostsError::AlreadyExists(display_name(path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn ensure_directory(&self, path: &Path) -> Result<(), PostsError> {
        match fs::create_dir(path).await {
            Ok(()) => {
                debug!("Created directory {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves a post directory. The destination must not exist; a plain
    /// rename(2) would silently replace an empty directory.
    pub async fn rename_directory(&self, from: &Path, to: &Path) -> Result<(), PostsError> {
        if fs::try_exists(to).await? {
            return Err(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("rename destination {:?} already exists", to),
            )
            .into());
        }
        if !fs::try_exists(from).await? {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("rename source {:?} does not exist", from),
            )
            .into());
        }

        fs::rename(from, to).await?;
        debug!("Renamed post directory {:?} -> {:?}", from, to);
        Ok(())
    }

    pub async fn remove_directory_recursive(&self, path: &Path) -> Result<(), PostsError> {
        fs::remove_dir_all(path).await?;
        debug!("Removed post directory {:?}", path);
        Ok(())
    }

    /// Replaces the record file through a temporary sibling and a rename, so
    /// readers see either the previous record or the new one.
    pub async fn write_record(&self, post_directory: &Path, bytes: &[u8]) -> Result<(), PostsError> {
        let temp_path = post_directory.join(format!("{}.{}.tmp", RECORD_FILE, Uuid::new_v4()));

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, Self::record_path(post_directory)).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp_path).await
                && cleanup.kind() != ErrorKind::NotFound
            {
                warn!("Failed to remove temporary record {:?}: {}", temp_path, cleanup);
            }
            return Err(e.into());
        }

        debug!("Wrote {} byte record to {:?}", bytes.len(), post_directory);
        Ok(())
    }

    /// Reads the raw record of a post. A missing directory is `PostNotFound`;
    /// a directory without a record is `CorruptRecord`.
    pub async fn read_record(&self, post_directory: &Path) -> Result<Vec<u8>, PostsError> {
        match fs::read(Self::record_path(post_directory)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if fs::try_exists(post_directory).await? {
                    Err(PostsError::CorruptRecord(format!(
                        "{} has no {}",
                        display_name(post_directory),
                        RECORD_FILE
                    )))
                } else {
                    Err(PostsError::PostNotFound(display_name(post_directory)))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists `(slug, path)` for every post directory under the root, sorted
    /// by slug. Plain files (such as the index) and hidden entries are skipped.
    pub async fn post_directories(&self) -> Result<Vec<(String, PathBuf)>, PostsError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut directories = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let path = entry.path();
            match entry.file_name().into_string() {
                Ok(slug) if !slug.starts_with('.') => directories.push((slug, path)),
                Ok(_) => {}
                Err(name) => warn!("Skipping post directory with non UTF-8 name {:?}", name),
            }
        }

        directories.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(directories)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
