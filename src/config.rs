use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::extractor::{ExtractorOptions, MissingSourceBehavior};
use crate::fallback::ClientRotation;
use crate::retry::{self, RetryPolicy};
use crate::transcode::Transcoder;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CACHE_ROOT: &str = "cache";
pub const DEFAULT_PUBLIC_ROOT: &str = "public/temp";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub cache_root: PathBuf,
    pub public_root: PathBuf,
    pub temp_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub missing_source: MissingSourceBehavior,
    pub clients: ClientRotation,
    pub retry: RetryPolicy,
}

impl RuntimeSettings {
    pub fn extractor_options(&self) -> ExtractorOptions {
        ExtractorOptions {
            cache_root: self.cache_root.clone(),
            public_root: self.public_root.clone(),
            temp_root: self.temp_root.clone(),
            transcoder: Transcoder::new(&self.ffmpeg, &self.ffprobe),
            retry: self.retry,
            rotation: self.clients.clone(),
            missing_source: self.missing_source,
        }
    }
}

/// Command-line values; each one beats the environment and the env file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub cache_root: Option<PathBuf>,
    pub public_root: Option<PathBuf>,
    pub temp_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let path_or = |override_value: Option<PathBuf>, key: &str, default: &str| {
        override_value
            .or_else(|| lookup(key).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(default))
    };

    let cache_root = path_or(overrides.cache_root, "YTBSHOW_CACHE_ROOT", DEFAULT_CACHE_ROOT);
    let public_root = path_or(overrides.public_root, "YTBSHOW_PUBLIC_ROOT", DEFAULT_PUBLIC_ROOT);
    let temp_root = overrides
        .temp_root
        .or_else(|| lookup("YTBSHOW_TEMP_ROOT").map(PathBuf::from))
        .unwrap_or_else(env::temp_dir);
    let port = overrides
        .port
        .or_else(|| lookup("YTBSHOW_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup("YTBSHOW_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let yt_dlp = path_or(None, "YT_DLP_PATH", "yt-dlp");
    let ffmpeg = path_or(None, "FFMPEG_PATH", "ffmpeg");
    let ffprobe = path_or(None, "FFPROBE_PATH", "ffprobe");

    let missing_source = match lookup("YTBSHOW_MISSING_SOURCE") {
        Some(raw) => MissingSourceBehavior::parse(&raw).unwrap_or_else(|| {
            tracing::warn!(value = %raw, "unknown YTBSHOW_MISSING_SOURCE, using not_found");
            MissingSourceBehavior::NotFound
        }),
        None => MissingSourceBehavior::default(),
    };

    let clients = match lookup("YTBSHOW_CLIENTS") {
        Some(raw) => ClientRotation::parse(&raw).context("parsing YTBSHOW_CLIENTS")?,
        None => ClientRotation::default(),
    };

    let retry = RetryPolicy {
        max_attempts: lookup("YTBSHOW_RETRY_ATTEMPTS")
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(retry::DEFAULT_MAX_ATTEMPTS),
        initial_delay: lookup("YTBSHOW_RETRY_INITIAL_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(retry::DEFAULT_INITIAL_DELAY),
        max_delay: lookup("YTBSHOW_RETRY_MAX_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(retry::DEFAULT_MAX_DELAY),
        backoff_factor: lookup("YTBSHOW_RETRY_FACTOR")
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value >= 1.0)
            .unwrap_or(retry::DEFAULT_BACKOFF_FACTOR),
    };

    Ok(RuntimeSettings {
        cache_root,
        public_root,
        temp_root,
        host,
        port,
        yt_dlp,
        ffmpeg,
        ffprobe,
        missing_source,
        clients,
        retry,
    })
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
