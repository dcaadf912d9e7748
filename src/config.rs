use std::{path::PathBuf, time::Duration};

use tracing::warn;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_DOWNLOAD_DIR: &str = "download";
const DEFAULT_STATIC_DIR: &str = "static";
const DEFAULT_GALLERY_DL_BIN: &str = "gallery-dl";
const DEFAULT_TOOL_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_MAX_ITEMS: usize = 25;
const DEFAULT_RETENTION_SECONDS: u64 = 600;
const DEFAULT_FILE_PREFIX: &str = "KitsuneGram";
const DEFAULT_RATE_LIMIT_PER_MINUTE: usize = 5;

/// Where the cookie jar handed to gallery-dl lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Kept in memory and written to a throwaway file for each fetch.
    Inline {
        content: String,
        temp_dir: Option<PathBuf>,
    },
    /// A fixed file overwritten when new cookies are uploaded.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub download_root: PathBuf,
    pub static_dir: PathBuf,
    pub gallery_dl_bin: PathBuf,
    pub gallery_dl_args: Vec<String>,
    pub tool_timeout: Duration,
    pub max_items: usize,
    pub retention: Duration,
    pub file_prefix: String,
    pub rate_limit_per_minute: usize,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
    pub credentials: CredentialSource,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            download_root: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            gallery_dl_bin: PathBuf::from(DEFAULT_GALLERY_DL_BIN),
            gallery_dl_args: Vec::new(),
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECONDS),
            max_items: DEFAULT_MAX_ITEMS,
            retention: Duration::from_secs(DEFAULT_RETENTION_SECONDS),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            trust_proxy_headers: false,
            allowed_origins: Vec::new(),
            credentials: CredentialSource::Inline {
                content: String::new(),
                temp_dir: None,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable lookup. Unparseable values
    /// fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };
        let number = |name: &str| {
            let raw = text(name)?;
            match raw.parse::<u64>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring {name}={raw:?}: not a non-negative integer");
                    None
                }
            }
        };

        let bind_addr = text("APP_ADDR")
            .or_else(|| {
                text("PORT")
                    .and_then(|value| value.parse::<u16>().ok())
                    .map(|port| format!("0.0.0.0:{port}"))
            })
            .unwrap_or(defaults.bind_addr);

        let credentials = match text("COOKIES_FILE") {
            Some(path) => CredentialSource::File(PathBuf::from(path)),
            None => CredentialSource::Inline {
                content: lookup("COOKIES").unwrap_or_default(),
                temp_dir: text("COOKIES_TEMP_DIR").map(PathBuf::from),
            },
        };

        Self {
            bind_addr,
            download_root: text("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_root),
            static_dir: text("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            gallery_dl_bin: text("GALLERY_DL_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.gallery_dl_bin),
            gallery_dl_args: text("GALLERY_DL_ARGS")
                .map(|value| value.split_whitespace().map(ToString::to_string).collect())
                .unwrap_or_default(),
            tool_timeout: number("GALLERY_DL_TIMEOUT_SECONDS")
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.tool_timeout),
            max_items: number("MAX_DOWNLOAD_ITEMS")
                .and_then(|value| usize::try_from(value).ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_items),
            retention: number("RETENTION_SECONDS")
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            file_prefix: text("FILE_PREFIX")
                .filter(|prefix| is_safe_prefix(prefix))
                .unwrap_or(defaults.file_prefix),
            rate_limit_per_minute: number("RATE_LIMIT_PER_MINUTE")
                .and_then(|value| usize::try_from(value).ok())
                .unwrap_or(defaults.rate_limit_per_minute),
            trust_proxy_headers: lookup("TRUST_PROXY_HEADERS")
                .as_deref()
                .and_then(parse_bool)
                .unwrap_or(false),
            allowed_origins: text("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            credentials,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn is_safe_prefix(prefix: &str) -> bool {
    prefix
        .chars()
        .all(|character| character.is_ascii_alphanumeric() || matches!(character, '-' | '_'))
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
