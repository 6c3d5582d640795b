#![forbid(unsafe_code)]

//! Remote video conversion: mp3 extraction and mp4 delivery.

use anyhow::anyhow;
use std::{path::Path, sync::Arc};
use tempfile::TempPath;
use tracing::{error, info};

use crate::{
    artifacts::{Artifact, ArtifactFamily, ArtifactNamer, ArtifactStore, discard_partials},
    error::{ConvertError, ConvertResult},
    tools::{AUDIO_CONTAINER, MediaDownloader, MediaTranscoder, VIDEO_CONTAINER},
};

const AUDIO_PREFIX: &str = "audio";
const VIDEO_PREFIX: &str = "video";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    Mp3,
    Mp4,
}

impl VideoFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "mp3" => Some(Self::Mp3),
            "mp4" => Some(Self::Mp4),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => AUDIO_CONTAINER,
            Self::Mp4 => VIDEO_CONTAINER,
        }
    }
}

/// A validated `/convert-video` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub url: String,
    pub format: VideoFormat,
}

impl ConversionRequest {
    pub fn parse(url: Option<&str>, format: Option<&str>) -> ConvertResult<Self> {
        let url = url.map(str::trim).filter(|value| !value.is_empty());
        let format = format.map(str::trim).filter(|value| !value.is_empty());
        let (Some(url), Some(format)) = (url, format) else {
            return Err(ConvertError::invalid("url and format are required"));
        };
        let format = VideoFormat::parse(format).ok_or_else(|| {
            ConvertError::invalid("unsupported format; only \"mp3\" and \"mp4\" are accepted")
        })?;
        if !has_web_scheme(url) {
            return Err(ConvertError::invalid("url must start with http:// or https://"));
        }
        Ok(Self {
            url: url.to_string(),
            format,
        })
    }
}

fn has_web_scheme(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    ["http://", "https://"]
        .iter()
        .any(|scheme| lower.starts_with(scheme) && lower.len() > scheme.len())
}

/// Drives the downloader and transcoder for a single request and leaves
/// exactly one artifact behind on success, none on failure.
pub struct VideoConverter {
    store: Arc<ArtifactStore>,
    namer: Arc<ArtifactNamer>,
    downloader: Arc<dyn MediaDownloader>,
    transcoder: Arc<dyn MediaTranscoder>,
}

impl VideoConverter {
    pub fn new(
        store: Arc<ArtifactStore>,
        namer: Arc<ArtifactNamer>,
        downloader: Arc<dyn MediaDownloader>,
        transcoder: Arc<dyn MediaTranscoder>,
    ) -> Self {
        Self {
            store,
            namer,
            downloader,
            transcoder,
        }
    }

    pub async fn convert(&self, request: &ConversionRequest) -> ConvertResult<Artifact> {
        info!(url = %request.url, format = request.format.extension(), "starting video conversion");
        let artifact = match request.format {
            VideoFormat::Mp3 => self.extract_audio(&request.url).await?,
            VideoFormat::Mp4 => self.fetch_video(&request.url).await?,
        };
        info!(filename = %artifact.filename, "video conversion finished");
        Ok(artifact)
    }

    async fn extract_audio(&self, url: &str) -> ConvertResult<Artifact> {
        let root = self.store.root(ArtifactFamily::Video);
        let (stamp, created_at) = self.namer.next_stamp();
        let stem = format!("{AUDIO_PREFIX}-{stamp}");
        let filename = format!("{stem}.{AUDIO_CONTAINER}");

        let stored_path = self.store.output_path(ArtifactFamily::Video, &filename);

        let produced = self
            .downloader
            .extract_audio(url, root, &stem, AUDIO_CONTAINER)
            .await;
        let failure = match produced {
            Ok(_) => {
                if non_empty_file(&stored_path).await {
                    None
                } else {
                    Some(anyhow!("downloader produced no audio for {url}"))
                }
            }
            Err(err) => Some(err),
        };
        if let Some(err) = failure {
            discard_partials(root, &stem).await;
            error!(url, error = ?err, "audio extraction failed");
            return Err(ConvertError::failed("could not extract the audio as mp3", err));
        }

        Ok(Artifact {
            stored_path,
            filename,
            created_at,
            family: ArtifactFamily::Video,
        })
    }

    async fn fetch_video(&self, url: &str) -> ConvertResult<Artifact> {
        let root = self.store.root(ArtifactFamily::Video);
        let (stamp, created_at) = self.namer.next_stamp();
        let download_stem = format!("{VIDEO_PREFIX}-{stamp}");

        let downloaded = match self
            .downloader
            .download_video(url, root, &download_stem, VIDEO_CONTAINER)
            .await
        {
            Ok(path) => path,
            Err(err) => return Err(self.download_failed(url, &download_stem, err).await),
        };
        if !self.store.contains(ArtifactFamily::Video, &downloaded).await {
            let err = anyhow!("downloader reported {} outside of the output root", downloaded.display());
            return Err(self.download_failed(url, &download_stem, err).await);
        }

        // Removed on drop unless it becomes the artifact itself.
        let temp = match TempPath::try_from_path(downloaded.clone()) {
            Ok(temp) => temp,
            Err(err) => return Err(self.download_failed(url, &download_stem, err.into()).await),
        };

        if has_extension(&downloaded, VIDEO_CONTAINER) {
            let stored_path = temp
                .keep()
                .map_err(|err| ConvertError::failed("could not download the video", err.error.into()))?;
            let filename = file_name_of(&stored_path);
            info!(filename = %filename, "download already in target container");
            return Ok(Artifact {
                filename,
                stored_path,
                created_at,
                family: ArtifactFamily::Video,
            });
        }

        let output_stem = format!("{AUDIO_PREFIX}-{stamp}");
        let filename = format!("{output_stem}.{VIDEO_CONTAINER}");
        let output = self.store.output_path(ArtifactFamily::Video, &filename);
        info!(input = %downloaded.display(), output = %output.display(), "re-encoding download");

        let result = self
            .transcoder
            .transcode(&temp, &output, VIDEO_CONTAINER)
            .await;
        drop(temp);
        if let Err(err) = result {
            discard_partials(root, &output_stem).await;
            error!(url, error = ?err, "transcoding failed");
            return Err(ConvertError::failed("could not convert the video to mp4", err));
        }

        Ok(Artifact {
            filename,
            stored_path: output,
            created_at,
            family: ArtifactFamily::Video,
        })
    }

    async fn download_failed(&self, url: &str, stem: &str, err: anyhow::Error) -> ConvertError {
        discard_partials(self.store.root(ArtifactFamily::Video), stem).await;
        error!(url, error = ?err, "video download failed");
        ConvertError::failed("could not download the video", err)
    }
}

async fn non_empty_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn has_extension(path: &Path, expected: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(expected))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    /// Writes canned bytes where a real downloader would.
    struct FakeDownloader {
        native_ext: &'static str,
        fail: bool,
        leave_partial: bool,
        /// Report the canonical absolute path the way yt-dlp prints it.
        canonical_report: bool,
    }

    #[async_trait]
    impl MediaDownloader for FakeDownloader {
        async fn extract_audio(
            &self,
            _url: &str,
            output_dir: &Path,
            stem: &str,
            audio_format: &str,
        ) -> Result<PathBuf> {
            if self.leave_partial {
                std::fs::write(output_dir.join(format!("{stem}.webm.part")), b"half").unwrap();
            }
            if self.fail {
                bail!("network unreachable");
            }
            let path = output_dir.join(format!("{stem}.{audio_format}"));
            std::fs::write(&path, b"ID3 audio bytes").unwrap();
            Ok(path)
        }

        async fn download_video(
            &self,
            _url: &str,
            output_dir: &Path,
            stem: &str,
            _preferred_container: &str,
        ) -> Result<PathBuf> {
            if self.fail {
                std::fs::write(output_dir.join(format!("{stem}.mp4.part")), b"half").unwrap();
                bail!("HTTP Error 403");
            }
            let path = output_dir.join(format!("{stem}.{}", self.native_ext));
            std::fs::write(&path, b"native video bytes").unwrap();
            if self.canonical_report {
                return Ok(std::fs::canonicalize(&path).unwrap());
            }
            Ok(path)
        }
    }

    #[derive(Default)]
    struct RecordingTranscoder {
        calls: Mutex<Vec<(PathBuf, PathBuf)>>,
        fail: bool,
    }

    #[async_trait]
    impl MediaTranscoder for RecordingTranscoder {
        async fn transcode(&self, input: &Path, output: &Path, _container: &str) -> Result<()> {
            self.calls
                .lock()
                .push((input.to_path_buf(), output.to_path_buf()));
            assert!(input.exists(), "input must exist while transcoding");
            std::fs::write(output, b"partial mp4").unwrap();
            if self.fail {
                bail!("Invalid data found when processing input");
            }
            std::fs::write(output, b"re-encoded mp4").unwrap();
            Ok(())
        }
    }

    struct Harness {
        _temp: TempDir,
        store: Arc<ArtifactStore>,
        converter: VideoConverter,
        transcoder: Arc<RecordingTranscoder>,
    }

    const START_MS: i64 = 1_714_564_800_000;

    async fn harness(downloader: FakeDownloader, transcoder: RecordingTranscoder) -> Harness {
        let temp = tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(
            temp.path().join("converted-videos"),
            temp.path().join("converted-fonts"),
            temp.path().join("uploads"),
        ));
        store.prepare().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_millis_opt(START_MS).unwrap(),
        ));
        let namer = Arc::new(ArtifactNamer::new(clock));
        let transcoder = Arc::new(transcoder);
        let converter = VideoConverter::new(
            store.clone(),
            namer,
            Arc::new(downloader),
            transcoder.clone(),
        );
        Harness {
            _temp: temp,
            store,
            converter,
            transcoder,
        }
    }

    fn downloader(native_ext: &'static str) -> FakeDownloader {
        FakeDownloader {
            native_ext,
            fail: false,
            leave_partial: false,
            canonical_report: false,
        }
    }

    fn request(format: VideoFormat) -> ConversionRequest {
        ConversionRequest {
            url: "https://www.youtube.com/watch?v=abc".into(),
            format,
        }
    }

    fn root_entries(store: &ArtifactStore) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(store.root(ArtifactFamily::Video))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn request_parsing_validates_fields() {
        let ok = ConversionRequest::parse(Some(" https://x.test/v "), Some("mp3")).unwrap();
        assert_eq!(ok.url, "https://x.test/v");
        assert_eq!(ok.format, VideoFormat::Mp3);

        for (url, format) in [
            (None, Some("mp3")),
            (Some("https://x.test/v"), None),
            (Some("   "), Some("mp4")),
            (Some("https://x.test/v"), Some("avi")),
            (Some("https://x.test/v"), Some("MP3")),
            (Some("--exec=rm -rf /"), Some("mp3")),
            (Some("file:///etc/passwd"), Some("mp4")),
            (Some("https://"), Some("mp4")),
        ] {
            let err = ConversionRequest::parse(url, format).unwrap_err();
            assert!(matches!(err, ConvertError::InvalidRequest(_)), "{url:?} {format:?}");
        }
    }

    #[tokio::test]
    async fn mp3_returns_non_empty_artifact() {
        let h = harness(downloader("webm"), RecordingTranscoder::default()).await;
        let artifact = h.converter.convert(&request(VideoFormat::Mp3)).await.unwrap();

        assert_eq!(artifact.filename, format!("audio-{START_MS}.mp3"));
        assert_eq!(artifact.family, ArtifactFamily::Video);
        let bytes = std::fs::read(&artifact.stored_path).unwrap();
        assert!(!bytes.is_empty());
        assert!(h.transcoder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn mp3_failure_removes_partials() {
        let h = harness(
            FakeDownloader {
                native_ext: "webm",
                fail: true,
                leave_partial: true,
                canonical_report: false,
            },
            RecordingTranscoder::default(),
        )
        .await;
        let err = h.converter.convert(&request(VideoFormat::Mp3)).await.unwrap_err();

        assert!(matches!(err, ConvertError::ConversionFailed { .. }));
        assert_eq!(err.to_string(), "could not extract the audio as mp3");
        assert!(root_entries(&h.store).is_empty());
    }

    #[tokio::test]
    async fn native_mp4_skips_transcoder() {
        let h = harness(downloader("mp4"), RecordingTranscoder::default()).await;
        let artifact = h.converter.convert(&request(VideoFormat::Mp4)).await.unwrap();

        assert_eq!(artifact.filename, format!("video-{START_MS}.mp4"));
        assert_eq!(std::fs::read(&artifact.stored_path).unwrap(), b"native video bytes");
        assert!(h.transcoder.calls.lock().is_empty());
        assert_eq!(root_entries(&h.store), vec![artifact.filename]);
    }

    #[tokio::test]
    async fn foreign_container_is_transcoded_and_temp_removed() {
        let h = harness(downloader("webm"), RecordingTranscoder::default()).await;
        let artifact = h.converter.convert(&request(VideoFormat::Mp4)).await.unwrap();

        assert_eq!(artifact.filename, format!("audio-{START_MS}.mp4"));
        assert_eq!(std::fs::read(&artifact.stored_path).unwrap(), b"re-encoded mp4");
        let calls = h.transcoder.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.ends_with(format!("video-{START_MS}.webm")));
        assert!(!calls[0].0.exists());
        assert_eq!(root_entries(&h.store), vec![artifact.filename]);
    }

    #[tokio::test]
    async fn transcoder_failure_cleans_everything() {
        let h = harness(
            downloader("mkv"),
            RecordingTranscoder {
                fail: true,
                ..RecordingTranscoder::default()
            },
        )
        .await;
        let err = h.converter.convert(&request(VideoFormat::Mp4)).await.unwrap_err();

        assert!(matches!(err, ConvertError::ConversionFailed { .. }));
        assert!(root_entries(&h.store).is_empty());
    }

    #[tokio::test]
    async fn download_failure_cleans_partials() {
        let h = harness(
            FakeDownloader {
                native_ext: "mp4",
                fail: true,
                leave_partial: false,
                canonical_report: false,
            },
            RecordingTranscoder::default(),
        )
        .await;
        let err = h.converter.convert(&request(VideoFormat::Mp4)).await.unwrap_err();
        assert_eq!(err.to_string(), "could not download the video");
        assert!(root_entries(&h.store).is_empty());
    }

    /// `path` expressed relative to the working directory, as a default
    /// `converted-videos` root would be.
    #[cfg(unix)]
    fn relative_to_cwd(path: &Path) -> PathBuf {
        let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();
        let target = path.canonicalize().unwrap();
        let mut relative = PathBuf::new();
        for _ in cwd.components().skip(1) {
            relative.push("..");
        }
        relative.join(target.strip_prefix("/").unwrap())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn absolute_report_for_relative_root_is_accepted() {
        let temp = tempdir().unwrap();
        let base = relative_to_cwd(temp.path());
        assert!(base.is_relative());
        let store = Arc::new(ArtifactStore::new(
            base.join("converted-videos"),
            base.join("converted-fonts"),
            base.join("uploads"),
        ));
        store.prepare().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_millis_opt(START_MS).unwrap(),
        ));
        let converter = VideoConverter::new(
            store.clone(),
            Arc::new(ArtifactNamer::new(clock)),
            Arc::new(FakeDownloader {
                canonical_report: true,
                ..downloader("mp4")
            }),
            Arc::new(RecordingTranscoder::default()),
        );

        let artifact = converter.convert(&request(VideoFormat::Mp4)).await.unwrap();
        assert_eq!(artifact.filename, format!("video-{START_MS}.mp4"));
        assert_eq!(std::fs::read(&artifact.stored_path).unwrap(), b"native video bytes");
        assert_eq!(root_entries(&store), vec![artifact.filename]);
    }

    #[tokio::test]
    async fn sequential_requests_get_distinct_names() {
        let h = harness(downloader("mp4"), RecordingTranscoder::default()).await;
        let first = h.converter.convert(&request(VideoFormat::Mp3)).await.unwrap();
        let second = h.converter.convert(&request(VideoFormat::Mp3)).await.unwrap();
        assert_ne!(first.filename, second.filename);
        assert_eq!(root_entries(&h.store).len(), 2);
    }

    #[test]
    fn extension_check_ignores_case() {
        assert!(has_extension(Path::new("/a/video-1.MP4"), "mp4"));
        assert!(!has_extension(Path::new("/a/video-1.webm"), "mp4"));
        assert!(!has_extension(Path::new("/a/video-1"), "mp4"));
    }
}
