//! Retained download files.
//!
//! Every file produced by a download is renamed to an opaque name and
//! registered with a deadline. A single reaper task sleeps until the earliest
//! deadline and deletes whatever is due; registry changes wake it early.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, TimeDelta, Utc};
use rand::{Rng, distr::Alphanumeric};
use serde::Serialize;
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::error::FetchError;

const SUFFIX_LEN: usize = 8;
const MAX_NAME_ATTEMPTS: usize = 8;
const MAX_EXTENSION_LEN: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct RetainedFile {
    pub filename: String,
    /// Path below the download root, always `/`-separated.
    pub relative_path: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub path: PathBuf,
}

/// A retained file as found by [`RetentionManager::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub path: PathBuf,
    /// `None` once the deletion was cancelled.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Registration {
    path: PathBuf,
    deadline: Option<Instant>,
    expires_at: Option<DateTime<Utc>>,
}

/// Every file the manager renamed, keyed by relative path. Only registered
/// files are served.
#[derive(Debug, Default)]
struct ExpiryQueue {
    entries: Mutex<HashMap<String, Registration>>,
    wake: Notify,
}

pub struct RetentionManager {
    root: PathBuf,
    prefix: String,
    retention: Duration,
    queue: Arc<ExpiryQueue>,
    reaper: JoinHandle<()>,
}

impl RetentionManager {
    /// Creates the download root if needed and starts the reaper task.
    pub async fn start(
        root: &Path,
        prefix: impl Into<String>,
        retention: Duration,
    ) -> Result<Self, FetchError> {
        tokio::fs::create_dir_all(root).await.map_err(|error| {
            FetchError::Storage(format!(
                "could not create download root {}: {error}",
                root.display()
            ))
        })?;
        let root = tokio::fs::canonicalize(root).await.map_err(|error| {
            FetchError::Storage(format!(
                "could not resolve download root {}: {error}",
                root.display()
            ))
        })?;

        let queue = Arc::new(ExpiryQueue::default());
        let reaper = tokio::spawn(Arc::clone(&queue).run(root.clone()));

        Ok(Self {
            root,
            prefix: prefix.into(),
            retention,
            queue,
            reaper,
        })
    }

    /// Canonical download root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Renames `source` in place to `<prefix>_<suffix><ext>` and schedules
    /// its deletion once the retention window has elapsed.
    pub async fn retain(&self, source: &Path) -> Result<RetainedFile, FetchError> {
        let source = tokio::fs::canonicalize(source).await.map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                FetchError::FileNotFound(source.display().to_string())
            } else {
                FetchError::Storage(format!("could not resolve {}: {error}", source.display()))
            }
        })?;
        let directory = source
            .parent()
            .filter(|parent| parent.starts_with(&self.root))
            .ok_or_else(|| {
                FetchError::Storage(format!(
                    "{} is outside the download root",
                    source.display()
                ))
            })?
            .to_path_buf();
        let extension = preserved_extension(&source);

        // Held until the entry is registered so concurrent retains cannot
        // pick the same name.
        let mut entries = self.queue.entries.lock().await;

        let mut chosen = None;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let filename = format!("{}_{}{extension}", self.prefix, random_suffix(SUFFIX_LEN));
            let candidate = directory.join(&filename);
            let key = relative_key(&self.root, &candidate)?;
            if entries.contains_key(&key) {
                continue;
            }
            let taken = tokio::fs::try_exists(&candidate).await.map_err(|error| {
                FetchError::Storage(format!("could not check {}: {error}", candidate.display()))
            })?;
            if !taken {
                chosen = Some((filename, candidate, key));
                break;
            }
            debug!("Generated name {filename} already exists, retrying");
        }
        let (filename, target, key) = chosen.ok_or_else(|| {
            FetchError::Storage(format!(
                "could not find a free name in {}",
                directory.display()
            ))
        })?;

        tokio::fs::rename(&source, &target).await.map_err(|error| {
            FetchError::Storage(format!(
                "could not rename {} to {filename}: {error}",
                source.display()
            ))
        })?;

        let created_at = Utc::now();
        let expires_at = created_at + to_time_delta(self.retention);
        entries.insert(
            key.clone(),
            Registration {
                path: target.clone(),
                deadline: Some(Instant::now() + self.retention),
                expires_at: Some(expires_at),
            },
        );
        drop(entries);
        self.queue.wake.notify_one();

        info!(
            "Retained {key} until {}",
            expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        Ok(RetainedFile {
            filename,
            relative_path: key,
            created_at,
            expires_at,
            path: target,
        })
    }

    /// Drops the pending deletion. The file stays on disk and servable.
    pub async fn cancel(&self, relative_path: &str) -> bool {
        let cancelled = {
            let mut entries = self.queue.entries.lock().await;
            match entries.get_mut(relative_path) {
                Some(entry) if entry.deadline.is_some() => {
                    entry.deadline = None;
                    entry.expires_at = None;
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            self.queue.wake.notify_one();
        }
        cancelled
    }

    /// Pushes the deadline of a pending deletion back by `by`.
    pub async fn extend(&self, relative_path: &str, by: Duration) -> Option<DateTime<Utc>> {
        let expires_at = {
            let mut entries = self.queue.entries.lock().await;
            let entry = entries.get_mut(relative_path)?;
            let deadline = entry.deadline.as_mut()?;
            let expires_at = entry.expires_at.as_mut()?;
            *deadline += by;
            *expires_at += to_time_delta(by);
            *expires_at
        };
        self.queue.wake.notify_one();
        Some(expires_at)
    }

    /// Makes the deletion due immediately, cancelled or not.
    pub async fn expire_now(&self, relative_path: &str) -> bool {
        let found = {
            let mut entries = self.queue.entries.lock().await;
            match entries.get_mut(relative_path) {
                Some(entry) => {
                    entry.deadline = Some(Instant::now());
                    entry.expires_at = Some(Utc::now());
                    true
                }
                None => false,
            }
        };
        if found {
            self.queue.wake.notify_one();
        }
        found
    }

    pub async fn expires_at(&self, relative_path: &str) -> Option<DateTime<Utc>> {
        self.queue
            .entries
            .lock()
            .await
            .get(relative_path)
            .and_then(|entry| entry.expires_at)
    }

    /// Number of files still waiting for deletion.
    pub async fn pending(&self) -> usize {
        self.queue
            .entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.deadline.is_some())
            .count()
    }

    /// Maps a relative path from a request to a registered file under the
    /// root. Anything the manager did not retain is `FileNotFound`.
    pub async fn resolve(&self, relative_path: &str) -> Result<ResolvedFile, FetchError> {
        let not_found = || FetchError::FileNotFound(relative_path.to_string());

        let mut parts = Vec::new();
        for component in Path::new(relative_path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                _ => return Err(not_found()),
            }
        }
        if parts.is_empty() {
            return Err(not_found());
        }
        let key = parts.join("/");

        let registered = self
            .queue
            .entries
            .lock()
            .await
            .get(&key)
            .map(|entry| (entry.path.clone(), entry.expires_at));
        let Some((path, expires_at)) = registered else {
            debug!("No retained file is registered as {key}");
            return Err(not_found());
        };

        let canonical = tokio::fs::canonicalize(&path)
            .await
            .map_err(|_| not_found())?;
        if !canonical.starts_with(&self.root) {
            warn!(
                "Blocked a request for a file outside the download root: {:?}",
                canonical
            );
            return Err(not_found());
        }

        match tokio::fs::metadata(&canonical).await {
            Ok(metadata) if metadata.is_file() => Ok(ResolvedFile {
                path: canonical,
                expires_at,
            }),
            _ => Err(not_found()),
        }
    }

    /// Deletes leftovers from a previous run. Expiry deadlines only live in
    /// memory, so anything older than the retention window is fair game.
    pub async fn sweep_stale(&self) -> usize {
        if self.retention.is_zero() {
            return 0;
        }

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!("Could not open the download root for cleanup: {error}");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    warn!("Could not iterate the download root for cleanup: {error}");
                    break;
                }
            };

            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!("Could not read metadata of {:?}: {error}", path);
                    continue;
                }
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < self.retention {
                continue;
            }

            let result = if metadata.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("Could not remove stale entry {:?}: {error}", path),
            }
        }

        if removed > 0 {
            info!("Removed {removed} stale entries from the download root");
        }
        removed
    }
}

impl Drop for RetentionManager {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

impl ExpiryQueue {
    async fn run(self: Arc<Self>, root: PathBuf) {
        loop {
            let next_deadline = self
                .entries
                .lock()
                .await
                .values()
                .filter_map(|entry| entry.deadline)
                .min();

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {}
                        () = self.wake.notified() => continue,
                    }
                }
                None => {
                    self.wake.notified().await;
                    continue;
                }
            }

            self.remove_due(&root).await;
        }
    }

    async fn remove_due(&self, root: &Path) {
        let now = Instant::now();
        let due: Vec<(String, PathBuf)> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry.path)))
                .collect()
        };

        for (key, path) in due {
            match remove_retained_file(root, &path).await {
                Ok(true) => info!("Expired {key}"),
                Ok(false) => debug!("{key} was already gone at expiry"),
                Err(error) => warn!("Could not delete expired file {key}: {error}"),
            }
        }
    }
}

/// Deletes a retained file. A file that is already gone is not an error.
/// The job directory holding it is removed once it is empty.
async fn remove_retained_file(root: &Path, path: &Path) -> std::io::Result<bool> {
    let removed = match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(error) if error.kind() == ErrorKind::NotFound => false,
        Err(error) => return Err(error),
    };

    if let Some(parent) = path.parent()
        && parent != root
        && parent.starts_with(root)
    {
        match tokio::fs::remove_dir(parent).await {
            Ok(()) => debug!("Removed empty job directory {:?}", parent),
            Err(error)
                if matches!(
                    error.kind(),
                    ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
                ) => {}
            Err(error) => warn!("Could not remove job directory {:?}: {error}", parent),
        }
    }

    Ok(removed)
}

fn relative_key(root: &Path, path: &Path) -> Result<String, FetchError> {
    let relative = path.strip_prefix(root).map_err(|_| {
        FetchError::Storage(format!("{} is outside the download root", path.display()))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Keeps the source extension when it is a plain alphanumeric token.
fn preserved_extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|character| character.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

fn random_suffix(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: Duration = Duration::from_secs(600);

    fn assert_opaque_name(filename: &str, extension: &str) {
        let suffix = filename
            .strip_prefix("KitsuneGram_")
            .and_then(|rest| rest.strip_suffix(extension))
            .unwrap_or_else(|| panic!("unexpected name {filename}"));
        assert_eq!(suffix.len(), 8, "{filename}");
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()), "{filename}");
    }

    async fn manager_with_file(name: &str) -> (tempfile::TempDir, RetentionManager, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("job");
        std::fs::create_dir_all(&job).unwrap();
        let source = job.join(name);
        std::fs::write(&source, b"media").unwrap();
        let manager = RetentionManager::start(dir.path(), "KitsuneGram", RETENTION)
            .await
            .unwrap();
        (dir, manager, source)
    }

    #[tokio::test]
    async fn retain_renames_in_place_and_keeps_extension() {
        let (_dir, manager, source) = manager_with_file("xyz.jpg").await;

        let retained = manager.retain(&source).await.unwrap();

        assert_opaque_name(&retained.filename, ".jpg");
        assert!(!source.exists());
        assert_eq!(std::fs::read(&retained.path).unwrap(), b"media");
        assert_eq!(retained.path.parent(), Some(manager.root().join("job").as_path()));
        assert_eq!(retained.relative_path, format!("job/{}", retained.filename));
        assert_eq!(retained.expires_at - retained.created_at, TimeDelta::seconds(600));
        assert_eq!(manager.pending().await, 1);
    }

    #[tokio::test]
    async fn files_without_extension_get_a_bare_name() {
        let (_dir, manager, source) = manager_with_file("README").await;
        let retained = manager.retain(&source).await.unwrap();
        assert_opaque_name(&retained.filename, "");
    }

    #[tokio::test]
    async fn retaining_a_missing_file_is_not_found() {
        let (_dir, manager, source) = manager_with_file("xyz.jpg").await;
        let missing = source.with_file_name("gone.jpg");
        let error = manager.retain(&missing).await.unwrap_err();
        assert!(matches!(error, FetchError::FileNotFound(_)), "{error:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn retained_file_is_deleted_after_the_retention_window() {
        let (_dir, manager, source) = manager_with_file("xyz.jpg").await;
        let retained = manager.retain(&source).await.unwrap();

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert!(retained.path.exists());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!retained.path.exists());
        assert_eq!(manager.pending().await, 0);
        // The emptied job directory goes with it.
        assert!(!manager.root().join("job").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_expiry_keeps_the_file() {
        let (_dir, manager, source) = manager_with_file("a.png").await;
        let retained = manager.retain(&source).await.unwrap();

        assert!(manager.cancel(&retained.relative_path).await);
        assert!(!manager.cancel(&retained.relative_path).await);
        assert_eq!(manager.pending().await, 0);
        assert_eq!(manager.expires_at(&retained.relative_path).await, None);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(retained.path.exists());
        let resolved = manager.resolve(&retained.relative_path).await.unwrap();
        assert_eq!(resolved.path, retained.path);
        assert_eq!(resolved.expires_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn extended_expiry_moves_the_deadline() {
        let (_dir, manager, source) = manager_with_file("a.mp4").await;
        let retained = manager.retain(&source).await.unwrap();

        let expires_at = manager
            .extend(&retained.relative_path, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(expires_at, retained.expires_at + TimeDelta::seconds(300));

        tokio::time::sleep(Duration::from_secs(700)).await;
        assert!(retained.path.exists());

        tokio::time::sleep(Duration::from_secs(201)).await;
        assert!(!retained.path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_now_deletes_without_waiting() {
        let (_dir, manager, source) = manager_with_file("a.jpg").await;
        let retained = manager.retain(&source).await.unwrap();

        assert!(manager.expire_now(&retained.relative_path).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!retained.path.exists());
        assert!(!manager.expire_now(&retained.relative_path).await);
    }

    #[tokio::test]
    async fn deleting_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("KitsuneGram_abcdEFGH.jpg");
        std::fs::write(&path, b"x").unwrap();

        assert!(remove_retained_file(dir.path(), &path).await.unwrap());
        assert!(!remove_retained_file(dir.path(), &path).await.unwrap());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn job_directory_survives_while_it_still_holds_files() {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("job");
        std::fs::create_dir_all(&job).unwrap();
        std::fs::write(job.join("a.jpg"), b"x").unwrap();
        std::fs::write(job.join("b.jpg"), b"x").unwrap();

        assert!(remove_retained_file(dir.path(), &job.join("a.jpg")).await.unwrap());
        assert!(job.exists());
        assert!(remove_retained_file(dir.path(), &job.join("b.jpg")).await.unwrap());
        assert!(!job.exists());
    }

    #[tokio::test]
    async fn resolve_rejects_traversal_and_missing_files() {
        let (_dir, manager, source) = manager_with_file("xyz.jpg").await;
        let retained = manager.retain(&source).await.unwrap();

        let resolved = manager.resolve(&retained.relative_path).await.unwrap();
        assert_eq!(resolved.path, retained.path);
        assert_eq!(resolved.expires_at, Some(retained.expires_at));
        let doubled_slash = retained.relative_path.replacen('/', "//", 1);
        assert_eq!(manager.resolve(&doubled_slash).await.unwrap().path, retained.path);

        for bad in ["", "../outside.txt", "/etc/passwd", "job/../../outside.txt", "job", "job/nope.jpg"] {
            let error = manager.resolve(bad).await.unwrap_err();
            assert!(matches!(error, FetchError::FileNotFound(_)), "{bad}: {error:?}");
        }
    }

    #[tokio::test]
    async fn files_the_manager_never_retained_are_not_served() {
        let (_dir, manager, source) = manager_with_file("xyz.jpg").await;
        let retained = manager.retain(&source).await.unwrap();

        let stray = manager.root().join("job").join("unprinted.jpg");
        std::fs::write(&stray, b"x").unwrap();
        std::fs::write(manager.root().join("loose.jpg"), b"x").unwrap();

        for path in ["job/unprinted.jpg", "loose.jpg"] {
            let error = manager.resolve(path).await.unwrap_err();
            assert!(matches!(error, FetchError::FileNotFound(_)), "{path}: {error:?}");
        }
        assert!(manager.resolve(&retained.relative_path).await.is_ok());
    }

    fn backdate(path: &Path, by: Duration) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_only_entries_older_than_retention() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("stale.jpg");
        let fresh = dir.path().join("fresh.jpg");
        std::fs::write(&stale, b"x").unwrap();
        std::fs::write(&fresh, b"x").unwrap();
        backdate(&stale, Duration::from_secs(3600));

        let manager = RetentionManager::start(dir.path(), "KitsuneGram", RETENTION)
            .await
            .unwrap();
        assert_eq!(manager.sweep_stale().await, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn zero_retention_never_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("stale.jpg");
        std::fs::write(&stale, b"x").unwrap();
        backdate(&stale, Duration::from_secs(3600));

        let manager = RetentionManager::start(dir.path(), "KitsuneGram", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(manager.sweep_stale().await, 0);
        assert!(stale.exists());
    }
}
