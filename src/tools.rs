#![forbid(unsafe_code)]

//! Thin async wrappers around the external programs doing the real work:
//! yt-dlp downloads, ffmpeg re-encodes and fontTools converts fonts. Each one
//! sits behind a trait so the converters can be exercised with fakes.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ToolPaths;

/// Containers the downloader is asked to produce audio in.
pub const AUDIO_CONTAINER: &str = "mp3";
/// Container the video path delivers.
pub const VIDEO_CONTAINER: &str = "mp4";

/// Output flavours supported by the font transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontFormat {
    Woff,
    Woff2,
    Ttf,
}

impl FontFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "woff" => Some(Self::Woff),
            "woff2" => Some(Self::Woff2),
            "ttf" => Some(Self::Ttf),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Woff => "woff",
            Self::Woff2 => "woff2",
            Self::Ttf => "ttf",
        }
    }

    /// fontTools `--flavor` value; plain sfnt output needs none.
    fn flavor(self) -> Option<&'static str> {
        match self {
            Self::Woff => Some("woff"),
            Self::Woff2 => Some("woff2"),
            Self::Ttf => None,
        }
    }
}

#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Downloads `url` and extracts its audio track into `output_dir` as
    /// `<stem>.<audio_format>`.
    async fn extract_audio(
        &self,
        url: &str,
        output_dir: &Path,
        stem: &str,
        audio_format: &str,
    ) -> Result<PathBuf>;

    /// Downloads `url` as a single file in its native container, preferring
    /// `preferred_container`. Returns the path actually written, which is
    /// `<output_dir>/<stem>.<ext>`.
    async fn download_video(
        &self,
        url: &str,
        output_dir: &Path,
        stem: &str,
        preferred_container: &str,
    ) -> Result<PathBuf>;
}

#[async_trait]
pub trait MediaTranscoder: Send + Sync {
    /// Re-encodes `input` into `output`, choosing the container from
    /// `container`.
    async fn transcode(&self, input: &Path, output: &Path, container: &str) -> Result<()>;
}

#[async_trait]
pub trait FontTranscoder: Send + Sync {
    /// Converts `input` into `format`, writing into `output_dir`. Returns
    /// every file it generated there.
    async fn convert(
        &self,
        input: &Path,
        output_dir: &Path,
        format: FontFormat,
    ) -> Result<Vec<PathBuf>>;
}

/// How much of a failing tool's stderr ends up in the log.
const STDERR_TAIL_LINES: usize = 10;

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}

/// Runs a prepared command to completion, capturing its output. A timeout,
/// when configured, kills the child and turns into an error.
pub async fn run_tool(mut command: Command, label: &str, timeout: Option<Duration>) -> Result<Output> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(tool = label, command = ?command.as_std(), "launching external tool");

    let pending = command.output();
    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, pending)
            .await
            .map_err(|_| anyhow!("{label} timed out after {}s", limit.as_secs()))?,
        None => pending.await,
    }
    .with_context(|| format!("launching {label}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = last_lines(&stderr, STDERR_TAIL_LINES);
        warn!(tool = label, status = %output.status, stderr = %tail, "external tool failed");
        bail!("{label} exited with {}", output.status);
    }
    Ok(output)
}

/// Runs `<program> <flag>` and returns the first line it printed.
pub async fn probe_tool(program: &Path, flag: &str) -> Result<String> {
    let mut command = Command::new(program);
    command.arg(flag);
    let output = run_tool(command, &program.display().to_string(), Some(Duration::from_secs(10)))
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text.lines().next().unwrap_or_default().trim().to_string())
}

/// Checks all configured tools once at startup. Missing tools only warn: the
/// service still answers and conversions that need them fail individually.
pub async fn probe_all(paths: &ToolPaths) {
    let checks = [
        (&paths.ytdlp, "--version"),
        (&paths.ffmpeg, "-version"),
        (&paths.fonttools, "--version"),
    ];
    for (program, flag) in checks {
        match probe_tool(program, flag).await {
            Ok(version) => info!(tool = %program.display(), version, "external tool available"),
            Err(err) => warn!(tool = %program.display(), error = %err, "external tool unavailable"),
        }
    }
}

/// yt-dlp backed downloader.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl YtDlp {
    pub fn new(program: PathBuf, timeout: Option<Duration>) -> Self {
        Self { program, timeout }
    }

    fn command(&self, args: Vec<OsString>) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args);
        command
    }
}

fn output_template(output_dir: &Path, stem: &str) -> OsString {
    output_dir.join(format!("{stem}.%(ext)s")).into_os_string()
}

fn audio_args(url: &str, output_dir: &Path, stem: &str, audio_format: &str) -> Vec<OsString> {
    vec![
        "--no-playlist".into(),
        "--no-progress".into(),
        "--no-warnings".into(),
        "--extract-audio".into(),
        "--audio-format".into(),
        audio_format.into(),
        "--output".into(),
        output_template(output_dir, stem),
        "--".into(),
        url.into(),
    ]
}

fn video_args(url: &str, output_dir: &Path, stem: &str, container: &str) -> Vec<OsString> {
    vec![
        "--no-playlist".into(),
        "--no-progress".into(),
        "--no-warnings".into(),
        "--format".into(),
        format!("{container}/bestvideo*+bestaudio/best").into(),
        "--output".into(),
        output_template(output_dir, stem),
        "--print".into(),
        "after_move:filepath".into(),
        "--".into(),
        url.into(),
    ]
}

/// Picks the last non-empty line of yt-dlp's `--print` output.
fn printed_path(stdout: &[u8]) -> Option<PathBuf> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(PathBuf::from)
}

#[async_trait]
impl MediaDownloader for YtDlp {
    async fn extract_audio(
        &self,
        url: &str,
        output_dir: &Path,
        stem: &str,
        audio_format: &str,
    ) -> Result<PathBuf> {
        let command = self.command(audio_args(url, output_dir, stem, audio_format));
        run_tool(command, "yt-dlp", self.timeout).await?;
        Ok(output_dir.join(format!("{stem}.{audio_format}")))
    }

    async fn download_video(
        &self,
        url: &str,
        output_dir: &Path,
        stem: &str,
        preferred_container: &str,
    ) -> Result<PathBuf> {
        let command = self.command(video_args(url, output_dir, stem, preferred_container));
        let output = run_tool(command, "yt-dlp", self.timeout).await?;
        printed_path(&output.stdout).ok_or_else(|| anyhow!("yt-dlp did not report an output file"))
    }
}

/// ffmpeg backed transcoder.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl Ffmpeg {
    pub fn new(program: PathBuf, timeout: Option<Duration>) -> Self {
        Self { program, timeout }
    }
}

fn ffmpeg_args(input: &Path, output: &Path, container: &str) -> Vec<OsString> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        input.as_os_str().to_owned(),
        "-f".into(),
        container.into(),
        output.as_os_str().to_owned(),
    ]
}

#[async_trait]
impl MediaTranscoder for Ffmpeg {
    async fn transcode(&self, input: &Path, output: &Path, container: &str) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.args(ffmpeg_args(input, output, container));
        run_tool(command, "ffmpeg", self.timeout).await?;
        Ok(())
    }
}

/// fontTools (`fonttools ttLib`) backed font transcoder.
#[derive(Debug, Clone)]
pub struct FontTools {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl FontTools {
    pub fn new(program: PathBuf, timeout: Option<Duration>) -> Self {
        Self { program, timeout }
    }
}

fn fonttools_args(input: &Path, output: &Path, format: FontFormat) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["ttLib".into()];
    if let Some(flavor) = format.flavor() {
        args.push("--flavor".into());
        args.push(flavor.into());
    }
    args.push("-o".into());
    args.push(output.as_os_str().to_owned());
    args.push(input.as_os_str().to_owned());
    args
}

#[async_trait]
impl FontTranscoder for FontTools {
    async fn convert(
        &self,
        input: &Path,
        output_dir: &Path,
        format: FontFormat,
    ) -> Result<Vec<PathBuf>> {
        let stem = input
            .file_stem()
            .ok_or_else(|| anyhow!("font input {} has no file name", input.display()))?;
        let mut name = stem.to_os_string();
        name.push(".");
        name.push(format.extension());
        let output = output_dir.join(name);

        let mut command = Command::new(&self.program);
        command.args(fonttools_args(input, &output, format));
        run_tool(command, "fonttools", self.timeout).await?;
        Ok(vec![output])
    }
}
