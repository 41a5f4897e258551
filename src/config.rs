#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::logging::LogFormat;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_MEDIA_ROOT: &str = "data";
pub const DEFAULT_YOUGEN_PORT: u16 = 8000;
pub const DEFAULT_YOUGEN_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PROGRESS_QUEUE_CAPACITY: usize = 256;

/// SQLite database file relative to the media root.
pub const DATABASE_FILE: &str = "yougen.db";
/// Directory (relative to the media root) that receives fetched media.
pub const DOWNLOADS_SUBDIR: &str = "downloads";

/// Upper bounds for every call that leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTimeouts {
    pub metadata: Duration,
    pub fetch: Duration,
    pub llm: Duration,
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(DEFAULT_METADATA_TIMEOUT_SECS),
            fetch: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            llm: Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_bin: PathBuf,
    pub llm: LlmSettings,
    pub timeouts: ProviderTimeouts,
    pub progress_queue_capacity: usize,
    pub log_format: LogFormat,
}

impl RuntimeConfig {
    pub fn database_path(&self) -> PathBuf {
        self.media_root.join(DATABASE_FILE)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.media_root.join(DOWNLOADS_SUBDIR)
    }
}

/// Values supplied on the command line. They win over the environment and the
/// `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let media_root = overrides
        .media_root
        .or_else(|| lookup("MEDIA_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT));
    let port = overrides
        .port
        .or_else(|| lookup("YOUGEN_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_YOUGEN_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("YOUGEN_HOST"))
        .unwrap_or_else(|| DEFAULT_YOUGEN_HOST.to_string());
    let ytdlp_bin = lookup("YTDLP_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));

    let llm = LlmSettings {
        api_key: lookup("GROQ_API_KEY"),
        model: lookup("GROQ_MODEL").unwrap_or_else(|| DEFAULT_GROQ_MODEL.to_string()),
        base_url: lookup("GROQ_BASE_URL")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_GROQ_BASE_URL.to_string()),
    };

    let timeouts = ProviderTimeouts {
        metadata: seconds_or(
            lookup("METADATA_TIMEOUT_SECS"),
            DEFAULT_METADATA_TIMEOUT_SECS,
        ),
        fetch: seconds_or(lookup("FETCH_TIMEOUT_SECS"), DEFAULT_FETCH_TIMEOUT_SECS),
        llm: seconds_or(lookup("LLM_TIMEOUT_SECS"), DEFAULT_LLM_TIMEOUT_SECS),
    };

    let progress_queue_capacity = lookup("PROGRESS_QUEUE_CAPACITY")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_PROGRESS_QUEUE_CAPACITY);

    let log_format = match lookup("YOUGEN_LOG_FORMAT") {
        Some(value) => value
            .parse::<LogFormat>()
            .map_err(anyhow::Error::msg)
            .context("parsing YOUGEN_LOG_FORMAT")?,
        None => LogFormat::default(),
    };

    Ok(RuntimeConfig {
        media_root,
        host,
        port,
        ytdlp_bin,
        llm,
        timeouts,
        progress_queue_capacity,
        log_format,
    })
}

/// Zero and unparsable values fall back to the default; a zero timeout would
/// fail every call.
fn seconds_or(value: Option<String>, default: u64) -> Duration {
    let secs = value
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
