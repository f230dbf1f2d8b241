//! Physical artifacts on disk, addressed only by server-generated internal names.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) the storage root. A relative root is a
    /// configuration error.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(AppError::Config(format!(
                "upload root {} is not an absolute path",
                root.display()
            )));
        }
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
            tracing::info!(root = %root.display(), "created upload root");
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, internal_name: &str) -> Result<PathBuf> {
        let valid = !internal_name.is_empty()
            && !internal_name.starts_with('.')
            && internal_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
        if !valid {
            return Err(AppError::Storage(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid internal name {internal_name:?}"),
            )));
        }
        Ok(self.root.join(internal_name))
    }

    /// Write to a temporary sibling and rename into place, so the final name only
    /// ever refers to a complete file.
    pub async fn store(&self, bytes: &[u8], internal_name: &str) -> Result<()> {
        let target = self.path_for(internal_name)?;
        if fs::try_exists(&target).await? {
            return Err(AppError::Storage(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("artifact {internal_name} already exists"),
            )));
        }
        let partial = self.root.join(format!(".{internal_name}.part"));

        let written: io::Result<()> = async {
            let mut file = fs::File::create(&partial).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            fs::rename(&partial, &target).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&partial).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(internal_name, error = %cleanup, "could not remove partial upload");
                }
            }
            return Err(e.into());
        }

        tracing::debug!(internal_name, size = bytes.len(), "artifact stored");
        Ok(())
    }

    /// Open an artifact for streaming, returning the handle and its length.
    pub async fn retrieve(&self, internal_name: &str) -> Result<(fs::File, u64)> {
        let path = self.path_for(internal_name)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AppError::NotFound("File".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(AppError::NotFound("File".to_string()));
        }
        Ok((file, metadata.len()))
    }

    #[cfg(test)]
    pub async fn read(&self, internal_name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(internal_name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(AppError::NotFound("File".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent. A missing artifact is logged and reported as `Ok(false)`.
    pub async fn remove(&self, internal_name: &str) -> Result<bool> {
        let path = self.path_for(internal_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(internal_name, "artifact removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(internal_name, "artifact already absent from storage");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(test)]
    pub async fn exists(&self, internal_name: &str) -> bool {
        match self.path_for(internal_name) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}
