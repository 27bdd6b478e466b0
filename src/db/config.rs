//! Engine configuration.
//!
//! Mirrors the option surface of the server launcher: repository
//! directories (optionally as `file://` URIs with per-directory options),
//! index storage, cache size, parallelism and the squash switch.

use std::path::PathBuf;

use thiserror::Error;
use url::Url;

/// Configuration errors, surfaced before the engine serves anything.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("invalid directory uri: {0}")]
    InvalidUri(String),

    #[error("unsupported library format: {0}")]
    UnsupportedFormat(String),
}

/// Repository library layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LibraryFormat {
    #[default]
    Git,
    Siva,
}

impl LibraryFormat {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "git" => Ok(LibraryFormat::Git),
            "siva" => Ok(LibraryFormat::Siva),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// One directory to load, with its per-directory options resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectorySpec {
    pub path: PathBuf,
    pub format: LibraryFormat,
    pub bare: bool,
    pub rooted: bool,
    pub bucket: u32,
}

/// Engine configuration options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database name exposed to clients.
    pub database_name: String,
    /// Repository directories; plain paths or `file://` URIs.
    pub directories: Vec<String>,
    /// Default library format for directories without an explicit one.
    pub format: LibraryFormat,
    pub bare: bool,
    pub rooted: bool,
    pub bucket: u32,
    /// Persistent index storage root.
    pub index_dir: PathBuf,
    pub cache_size_mib: usize,
    /// 0 means one partition per core; 1 disables parallelism.
    pub parallelism: usize,
    pub disable_squash: bool,
    pub read_only: bool,
    /// Skip rows/repositories with git errors instead of failing queries.
    pub skip_git_errors: bool,
    /// Endpoint of the external source-analysis service.
    pub analysis_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_name: "gitql".into(),
            directories: Vec::new(),
            format: LibraryFormat::Git,
            bare: false,
            rooted: true,
            bucket: 2,
            index_dir: PathBuf::from("/var/lib/gitql/index"),
            cache_size_mib: 512,
            parallelism: 1,
            disable_squash: false,
            read_only: false,
            skip_git_errors: false,
            analysis_endpoint: None,
            log_level: "info".into(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_directory(mut self, dir: impl Into<String>) -> Self {
        self.directories.push(dir.into());
        self
    }

    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }

    pub fn with_index_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.index_dir = dir.into();
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_squash(mut self, enabled: bool) -> Self {
        self.disable_squash = !enabled;
        self
    }

    pub fn with_skip_git_errors(mut self, enabled: bool) -> Self {
        self.skip_git_errors = enabled;
        self
    }

    pub fn with_read_only(mut self, enabled: bool) -> Self {
        self.read_only = enabled;
        self
    }

    /// Effective exchange width: 0 resolves to the core count.
    pub fn effective_parallelism(&self) -> usize {
        match self.parallelism {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }

    pub fn cache_size_bytes(&self) -> usize {
        self.cache_size_mib * 1024 * 1024
    }

    /// Resolve every configured directory into a spec.
    pub fn directory_specs(&self) -> Result<Vec<DirectorySpec>, ConfigError> {
        self.directories
            .iter()
            .map(|d| self.parse_directory(d))
            .collect()
    }

    /// A directory is a plain path, or a `file://host/path?key=value` URI.
    /// Recognized keys: format, bare, rooted, bucket.
    fn parse_directory(&self, dir: &str) -> Result<DirectorySpec, ConfigError> {
        let mut spec = DirectorySpec {
            path: PathBuf::from(dir),
            format: self.format,
            bare: self.bare,
            rooted: self.rooted,
            bucket: self.bucket,
        };

        if !dir.contains("://") {
            return Ok(spec);
        }

        let url = Url::parse(dir).map_err(|e| ConfigError::InvalidUri(format!("{}: {}", dir, e)))?;
        if url.scheme() != "file" {
            return Err(ConfigError::InvalidUri(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        spec.path = PathBuf::from(url.path());

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "format" => spec.format = LibraryFormat::parse(&value)?,
                "bare" => spec.bare = parse_bool(&value)?,
                "rooted" => spec.rooted = parse_bool(&value)?,
                "bucket" => {
                    spec.bucket = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidOption(format!("bucket={}", value)))?
                }
                other => {
                    return Err(ConfigError::InvalidOption(format!(
                        "unknown directory option: {}",
                        other
                    )))
                }
            }
        }
        Ok(spec)
    }
}

fn parse_bool(s: &str) -> Result<bool, ConfigError> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigError::InvalidOption(format!(
            "expected true or false, got {}",
            other
        ))),
    }
}
