use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{process::Command, time::timeout};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::{Config, non_empty},
    credentials::{CredentialStore, StagedCredentials},
    error::FetchError,
    retention::{RetainedFile, RetentionManager},
};

/// gallery-dl prefixes files it skipped because they already exist.
const SKIPPED_FILE_MARKER: &str = "# ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Print direct media URLs without downloading anything.
    ListUrls,
    /// Download media into a job directory and retain the files.
    Download,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub mode: FetchMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteItem {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FetchItem {
    Remote(RemoteItem),
    Retained(RetainedFile),
}

#[derive(Debug)]
pub struct FetchResult {
    pub items: Vec<FetchItem>,
    /// Whatever the tool wrote to stderr on a successful run.
    pub diagnostics: String,
}

#[derive(Debug)]
struct ToolOutput {
    stdout: String,
    stderr: String,
}

/// How to invoke gallery-dl.
#[derive(Debug, Clone)]
pub struct GalleryDl {
    program: PathBuf,
    base_args: Vec<String>,
    timeout: Duration,
    max_items: usize,
}

impl GalleryDl {
    pub fn new(
        program: impl Into<PathBuf>,
        base_args: Vec<String>,
        timeout: Duration,
        max_items: usize,
    ) -> Self {
        Self {
            program: program.into(),
            base_args,
            timeout,
            max_items,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.gallery_dl_bin.clone(),
            config.gallery_dl_args.clone(),
            config.tool_timeout,
            config.max_items,
        )
    }

    fn list_args(&self, url: &str, cookies: Option<&Path>) -> Vec<String> {
        let mut args = cookie_args(cookies);
        args.push("-g".to_string());
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    fn download_args(&self, url: &str, cookies: Option<&Path>, job_dir: &Path) -> Vec<String> {
        let mut args = cookie_args(cookies);
        args.push("-D".to_string());
        args.push(job_dir.to_string_lossy().into_owned());
        args.push("--range".to_string());
        args.push(format!("1-{}", self.max_items));
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<ToolOutput, FetchError> {
        debug!("Running {:?} with {:?}", self.program, args);

        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                FetchError::ExternalTool(format!(
                    "gallery-dl did not finish within {} seconds",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    FetchError::ExternalTool(format!(
                        "{} is not installed. Install gallery-dl or set GALLERY_DL_BIN.",
                        self.program.display()
                    ))
                } else {
                    FetchError::ExternalTool(format!("could not run gallery-dl: {error}"))
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            warn!("gallery-dl failed ({}): {}", output.status, stderr.trim());
            let message = non_empty(&stderr)
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("gallery-dl exited with {}", output.status));
            return Err(FetchError::ExternalTool(message));
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

fn cookie_args(cookies: Option<&Path>) -> Vec<String> {
    match cookies {
        Some(path) => vec![
            "--cookies".to_string(),
            path.to_string_lossy().into_owned(),
        ],
        None => Vec::new(),
    }
}

/// Runs gallery-dl for one request and maps its output.
pub struct Fetcher {
    tool: GalleryDl,
    credentials: Arc<CredentialStore>,
    retention: Arc<RetentionManager>,
}

impl Fetcher {
    pub fn new(
        tool: GalleryDl,
        credentials: Arc<CredentialStore>,
        retention: Arc<RetentionManager>,
    ) -> Self {
        Self {
            tool,
            credentials,
            retention,
        }
    }

    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, FetchError> {
        let url = validate_url(&request.url)?;

        match request.mode {
            FetchMode::ListUrls => {
                let output = {
                    let staged = self.credentials.stage().await?;
                    let cookies = staged.as_ref().map(StagedCredentials::path);
                    self.tool.run(self.tool.list_args(&url, cookies)).await?
                };

                let items: Vec<FetchItem> = parse_url_list(&output.stdout)
                    .into_iter()
                    .map(FetchItem::Remote)
                    .collect();
                info!("Listed {} media URLs for {url}", items.len());
                Ok(self.finish(items, output.stderr))
            }
            FetchMode::Download => {
                let (job_dir, output) = {
                    let staged = self.credentials.stage().await?;
                    let cookies = staged.as_ref().map(StagedCredentials::path);
                    let job_dir = self.create_job_dir().await?;

                    match self
                        .tool
                        .run(self.tool.download_args(&url, cookies, &job_dir))
                        .await
                    {
                        Ok(output) => (job_dir, output),
                        Err(error) => {
                            cleanup_job_dir(&job_dir).await;
                            return Err(error);
                        }
                    }
                };

                let mut retained = Vec::new();
                let mut failure = None;
                for printed in downloaded_paths(&output.stdout) {
                    let Some(path) = resolve_candidate(&job_dir, printed).await else {
                        debug!("Skipping {printed:?}: not a file of this download");
                        continue;
                    };
                    match self.retention.retain(&path).await {
                        Ok(file) => retained.push(file),
                        Err(error) => {
                            failure = Some(error);
                            break;
                        }
                    }
                }

                discard_unretained(&job_dir, &retained).await;
                if let Some(error) = failure {
                    return Err(error);
                }

                info!("Retained {} files for {url}", retained.len());
                let items = retained.into_iter().map(FetchItem::Retained).collect();
                Ok(self.finish(items, output.stderr))
            }
        }
    }

    fn finish(&self, items: Vec<FetchItem>, stderr: String) -> FetchResult {
        FetchResult {
            items,
            diagnostics: stderr.trim().to_string(),
        }
    }

    /// Creates a fresh directory for one download and returns its canonical
    /// path.
    async fn create_job_dir(&self) -> Result<PathBuf, FetchError> {
        let job_dir = self.retention.root().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&job_dir).await.map_err(|error| {
            FetchError::Storage(format!("could not prepare download directory: {error}"))
        })?;

        match tokio::fs::canonicalize(&job_dir).await {
            Ok(canonical) => Ok(canonical),
            Err(error) => {
                cleanup_job_dir(&job_dir).await;
                Err(FetchError::Storage(format!(
                    "could not resolve download directory: {error}"
                )))
            }
        }
    }
}

/// Accepts a printed line only when it names an existing regular file inside
/// this download's job directory.
async fn resolve_candidate(job_dir: &Path, printed: &str) -> Option<PathBuf> {
    let printed_path = PathBuf::from(printed);
    let candidates = if printed_path.is_absolute() {
        vec![printed_path]
    } else {
        vec![printed_path.clone(), job_dir.join(&printed_path)]
    };

    for candidate in candidates {
        let metadata = match tokio::fs::metadata(&candidate).await {
            Ok(metadata) => metadata,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not inspect downloaded file {:?}: {error}", candidate);
                }
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let Ok(canonical) = tokio::fs::canonicalize(&candidate).await else {
            continue;
        };
        if !canonical.starts_with(job_dir) {
            warn!(
                "Ignoring a file outside the download directory: {:?}",
                canonical
            );
            continue;
        }
        return Some(canonical);
    }

    None
}

fn validate_url(input: &str) -> Result<String, FetchError> {
    let url = input.trim();
    if url.is_empty() {
        return Err(FetchError::InvalidUrl("enter a post URL".to_string()));
    }

    let parsed = Url::parse(url).map_err(|error| FetchError::InvalidUrl(format!("{url}: {error}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(FetchError::InvalidUrl(format!(
            "{url}: only http and https URLs are supported"
        )));
    }

    Ok(url.to_string())
}

/// One item per non-empty line, named after the final path segment.
pub fn parse_url_list(stdout: &str) -> Vec<RemoteItem> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|url| RemoteItem {
            filename: url.rsplit('/').next().unwrap_or(url).to_string(),
            url: url.to_string(),
        })
        .collect()
}

fn downloaded_paths(stdout: &str) -> impl Iterator<Item = &str> {
    stdout
        .lines()
        .map(|line| {
            line.strip_prefix(SKIPPED_FILE_MARKER)
                .unwrap_or(line)
                .trim()
        })
        .filter(|line| !line.is_empty())
}

/// Deletes whatever the tool left in the job directory besides the retained
/// files. Without retained files the directory goes too.
async fn discard_unretained(job_dir: &Path, retained: &[RetainedFile]) {
    if retained.is_empty() {
        cleanup_job_dir(job_dir).await;
        return;
    }

    let mut entries = match tokio::fs::read_dir(job_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            warn!("Could not open download directory {:?}: {error}", job_dir);
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate download directory {:?}: {error}", job_dir);
                break;
            }
        };

        let path = entry.path();
        if retained.iter().any(|file| file.path.starts_with(&path)) {
            continue;
        }

        let result = match entry.file_type().await {
            Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        match result {
            Ok(()) => debug!("Discarded unretained {:?}", path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not discard {:?}: {error}", path),
        }
    }
}

async fn cleanup_job_dir(job_dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(job_dir).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("Could not clean up download directory {:?}: {error}", job_dir);
    }
}
