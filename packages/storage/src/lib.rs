//! Shared staging area.
//!
//! A directory visible to both this process and the worker processes.
//! Every job gets its own subdirectory named after its correlation id, so
//! concurrent jobs never write to the same path:
//!
//! ```text
//! <root>/<correlation id>.json        import descriptor
//! <root>/<correlation id>/<file>      staged upload
//! <root>/<correlation id>/obj.json    federation definition
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use dispatch_core::{CorrelationId, ImportDescriptor};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

/// File name of a federation definition inside its job directory.
pub const FEDERATION_DEFINITION_FILE: &str = "obj.json";

/// Characters replaced with `_` before a file name is used on disk.
const UNSAFE_FILE_NAME_CHARS: &[char] = &[
    '*', '"', '/', '\\', '[', ']', ':', ';', '|', '=', ',', '<', '>', '$', ' ',
];

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("refusing to overwrite staged file {0}")]
    AlreadyStaged(PathBuf),

    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
}

impl StagingError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Replace characters that are unsafe in worker-side paths.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if UNSAFE_FILE_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SharedStagingArea {
    root: PathBuf,
}

impl SharedStagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything staged for one job.
    pub fn job_dir(&self, correlation_id: &CorrelationId) -> PathBuf {
        self.root.join(correlation_id.as_str())
    }

    pub fn import_descriptor_path(&self, correlation_id: &CorrelationId) -> PathBuf {
        self.root.join(format!("{}.json", correlation_id.as_str()))
    }

    pub fn federation_definition_path(&self, correlation_id: &CorrelationId) -> PathBuf {
        self.job_dir(correlation_id).join(FEDERATION_DEFINITION_FILE)
    }

    /// Move `source` into the job directory as `file_name`, or copy it when
    /// `use_copy` is set. Returns the staged path.
    pub async fn stage(
        &self,
        correlation_id: &CorrelationId,
        source: &Path,
        file_name: &str,
        use_copy: bool,
    ) -> Result<PathBuf, StagingError> {
        let sanitized = sanitize_file_name(file_name);
        if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
            return Err(StagingError::InvalidFileName(file_name.to_string()));
        }

        let dir = self.job_dir(correlation_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StagingError::io(&dir, e))?;

        let target = dir.join(&sanitized);
        let occupied = tokio::fs::try_exists(&target)
            .await
            .map_err(|e| StagingError::io(&target, e))?;
        if occupied {
            return Err(StagingError::AlreadyStaged(target));
        }

        if use_copy {
            copy(source, &target).await?;
        } else {
            match tokio::fs::rename(source, &target).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::CrossesDevices => {
                    tracing::debug!(
                        source = %source.display(),
                        "rename crosses filesystems, copying instead"
                    );
                    copy(source, &target).await?;
                    tokio::fs::remove_file(source)
                        .await
                        .map_err(|e| StagingError::io(source, e))?;
                }
                Err(e) => return Err(StagingError::io(source, e)),
            }
        }

        tracing::debug!(
            correlation_id = %correlation_id,
            path = %target.display(),
            "staged file"
        );
        Ok(target)
    }

    /// Write `<root>/<correlation id>.json` for the model importer.
    pub async fn write_import_descriptor(
        &self,
        correlation_id: &CorrelationId,
        descriptor: &ImportDescriptor,
    ) -> Result<PathBuf, StagingError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StagingError::io(&self.root, e))?;
        let path = self.import_descriptor_path(correlation_id);
        append_json(&path, descriptor).await?;
        Ok(path)
    }

    /// Write `<root>/<correlation id>/obj.json` for the federation generator.
    pub async fn write_federation_definition(
        &self,
        correlation_id: &CorrelationId,
        definition: &serde_json::Value,
    ) -> Result<PathBuf, StagingError> {
        let dir = self.job_dir(correlation_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StagingError::io(&dir, e))?;
        let path = self.federation_definition_path(correlation_id);
        append_json(&path, definition).await?;
        Ok(path)
    }
}

async fn copy(source: &Path, target: &Path) -> Result<(), StagingError> {
    tokio::fs::copy(source, target)
        .await
        .map(|_| ())
        .map_err(|e| StagingError::io(source, e))
}

async fn append_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StagingError> {
    let bytes = serde_json::to_vec(value)?;
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await
        .map_err(|e| StagingError::io(path, e))?;
    file.write_all(&bytes)
        .await
        .map_err(|e| StagingError::io(path, e))?;
    file.flush().await.map_err(|e| StagingError::io(path, e))
}
