#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_VIDEO_ROOT: &str = "converted-videos";
pub const DEFAULT_FONT_ROOT: &str = "converted-fonts";
pub const DEFAULT_UPLOAD_ROOT: &str = "uploads";
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &["https://nusky7studio.es", "http://localhost:1234"];
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_AGE_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_FONTTOOLS_BIN: &str = "fonttools";

/// Paths of the external programs the converters shell out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub ytdlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub fonttools: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ytdlp: PathBuf::from(DEFAULT_YTDLP_BIN),
            ffmpeg: PathBuf::from(DEFAULT_FFMPEG_BIN),
            fonttools: PathBuf::from(DEFAULT_FONTTOOLS_BIN),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub video_root: PathBuf,
    pub font_root: PathBuf,
    pub upload_root: PathBuf,
    pub host: String,
    pub port: u16,
    /// Base used when building absolute download links for fonts.
    pub public_url: String,
    pub allowed_origins: Vec<String>,
    pub sweep_interval: Duration,
    pub max_age: Duration,
    pub tool_timeout: Option<Duration>,
    pub max_upload_bytes: usize,
    pub tools: ToolPaths,
}

pub fn load_runtime_settings() -> Result<RuntimeSettings> {
    resolve_runtime_settings(RuntimeOverrides::default())
}

/// Values given on the command line. They beat both the process environment
/// and the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub video_root: Option<PathBuf>,
    pub font_root: Option<PathBuf>,
    pub upload_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub public_url: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let path_or = |override_value: Option<PathBuf>, key: &str, default: &str| {
        override_value
            .or_else(|| lookup(key).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(default))
    };
    let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());

    let video_root = path_or(overrides.video_root, "CONVERTER_VIDEO_ROOT", DEFAULT_VIDEO_ROOT);
    let font_root = path_or(overrides.font_root, "CONVERTER_FONT_ROOT", DEFAULT_FONT_ROOT);
    let upload_root = path_or(
        overrides.upload_root,
        "CONVERTER_UPLOAD_ROOT",
        DEFAULT_UPLOAD_ROOT,
    );
    let port = overrides
        .port
        .or_else(|| lookup("CONVERTER_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = non_blank(overrides.host)
        .or_else(|| lookup("CONVERTER_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let public_url = non_blank(overrides.public_url)
        .or_else(|| lookup("CONVERTER_PUBLIC_URL"))
        .unwrap_or_else(|| format!("http://localhost:{port}"))
        .trim_end_matches('/')
        .to_string();
    let allowed_origins = lookup("CONVERTER_ALLOWED_ORIGINS")
        .map(|raw| split_list(&raw))
        .filter(|origins| !origins.is_empty())
        .unwrap_or_else(|| {
            DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|origin| origin.to_string())
                .collect()
        });
    let sweep_interval = parsed("CONVERTER_SWEEP_INTERVAL_SECS")
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    let max_age = parsed("CONVERTER_MAX_AGE_SECS").unwrap_or(DEFAULT_MAX_AGE_SECS);
    let tool_timeout = parsed("CONVERTER_TOOL_TIMEOUT_SECS")
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);
    let max_upload_bytes = lookup("CONVERTER_MAX_UPLOAD_BYTES")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|bytes| *bytes > 0)
        .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
    let tools = ToolPaths {
        ytdlp: path_or(None, "CONVERTER_YTDLP_BIN", DEFAULT_YTDLP_BIN),
        ffmpeg: path_or(None, "CONVERTER_FFMPEG_BIN", DEFAULT_FFMPEG_BIN),
        fonttools: path_or(None, "CONVERTER_FONTTOOLS_BIN", DEFAULT_FONTTOOLS_BIN),
    };

    RuntimeSettings {
        video_root,
        font_root,
        upload_root,
        host,
        port,
        public_url,
        allowed_origins,
        sweep_interval: Duration::from_secs(sweep_interval),
        max_age: Duration::from_secs(max_age),
        tool_timeout,
        max_upload_bytes,
        tools,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
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
