//! Cookie jar storage for the external downloader.
//!
//! Two backends are supported. The inline backend keeps the jar in memory and
//! writes it to a throwaway file for every fetch; the file backend points
//! gallery-dl at a fixed path that is replaced atomically on update.

use std::{
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{config::CredentialSource, error::FetchError};

#[derive(Debug)]
pub struct CredentialStore {
    backend: Backend,
}

#[derive(Debug)]
enum Backend {
    Inline {
        content: RwLock<String>,
        temp_dir: Option<PathBuf>,
    },
    File {
        path: PathBuf,
        write_lock: Mutex<()>,
    },
}

/// Credential location for a single fetch. A temporary jar is deleted when
/// this value is dropped.
#[derive(Debug)]
pub enum StagedCredentials {
    Temporary(NamedTempFile),
    Persistent(PathBuf),
}

impl StagedCredentials {
    pub fn path(&self) -> &Path {
        match self {
            Self::Temporary(file) => file.path(),
            Self::Persistent(path) => path,
        }
    }
}

impl CredentialStore {
    pub fn new(source: CredentialSource) -> Self {
        let backend = match source {
            CredentialSource::Inline { content, temp_dir } => Backend::Inline {
                content: RwLock::new(content),
                temp_dir,
            },
            CredentialSource::File(path) => Backend::File {
                path,
                write_lock: Mutex::new(()),
            },
        };
        Self { backend }
    }

    pub fn describe(&self) -> String {
        match &self.backend {
            Backend::Inline { .. } => "in-memory cookie jar".to_string(),
            Backend::File { path, .. } => format!("cookie file {}", path.display()),
        }
    }

    pub async fn get(&self) -> Result<String, FetchError> {
        match &self.backend {
            Backend::Inline { content, .. } => Ok(content.read().await.clone()),
            Backend::File { path, .. } => match tokio::fs::read_to_string(path).await {
                Ok(content) => Ok(content),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(String::new()),
                Err(error) => Err(FetchError::Storage(format!(
                    "could not read cookie file {}: {error}",
                    path.display()
                ))),
            },
        }
    }

    /// Replaces the stored jar wholesale. The content is not validated;
    /// gallery-dl rejects malformed jars at fetch time.
    pub async fn set(&self, new_content: String) -> Result<(), FetchError> {
        match &self.backend {
            Backend::Inline { content, .. } => {
                *content.write().await = new_content;
            }
            Backend::File { path, write_lock } => {
                let _guard = write_lock.lock().await;
                let target = path.clone();
                tokio::task::spawn_blocking(move || {
                    persist_credentials(&target, new_content.as_bytes())
                })
                .await
                .map_err(|error| FetchError::CredentialWrite(error.to_string()))??;
            }
        }

        info!("Credentials replaced ({})", self.describe());
        Ok(())
    }

    /// Makes the jar available on disk for exactly one fetch. Returns `None`
    /// when no credentials are configured.
    pub async fn stage(&self) -> Result<Option<StagedCredentials>, FetchError> {
        match &self.backend {
            Backend::Inline { content, temp_dir } => {
                let snapshot = content.read().await.clone();
                if snapshot.trim().is_empty() {
                    return Ok(None);
                }

                let temp_dir = temp_dir.clone();
                let file = tokio::task::spawn_blocking(move || {
                    write_temporary_credentials(temp_dir.as_deref(), &snapshot)
                })
                .await
                .map_err(|error| FetchError::CredentialWrite(error.to_string()))??;

                debug!("Staged cookies at {:?}", file.path());
                Ok(Some(StagedCredentials::Temporary(file)))
            }
            Backend::File { path, .. } => match tokio::fs::metadata(path).await {
                Ok(metadata) if metadata.is_file() => {
                    Ok(Some(StagedCredentials::Persistent(path.clone())))
                }
                Ok(_) => Err(FetchError::CredentialWrite(format!(
                    "{} is not a regular file",
                    path.display()
                ))),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
                Err(error) => Err(FetchError::CredentialWrite(format!(
                    "could not access cookie file {}: {error}",
                    path.display()
                ))),
            },
        }
    }
}

fn write_temporary_credentials(
    dir: Option<&Path>,
    content: &str,
) -> Result<NamedTempFile, FetchError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("cookies-").suffix(".txt");
    let created = match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    };
    let mut file = created.map_err(|error| {
        FetchError::CredentialWrite(format!("could not create temporary cookie file: {error}"))
    })?;

    file.write_all(content.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|error| {
            FetchError::CredentialWrite(format!("could not write temporary cookie file: {error}"))
        })?;

    Ok(file)
}

fn persist_credentials(target: &Path, data: &[u8]) -> Result<(), FetchError> {
    let parent = target
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|error| {
        FetchError::CredentialWrite(format!("could not create {}: {error}", parent.display()))
    })?;

    let mut temp = NamedTempFile::new_in(parent).map_err(|error| {
        FetchError::CredentialWrite(format!(
            "could not create temp file in {}: {error}",
            parent.display()
        ))
    })?;
    temp.write_all(data)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|error| {
            FetchError::CredentialWrite(format!(
                "could not write cookies for {}: {error}",
                target.display()
            ))
        })?;

    temp.persist(target).map_err(|error| {
        FetchError::CredentialWrite(format!(
            "could not replace {}: {}",
            target.display(),
            error.error
        ))
    })?;

    Ok(())
}
