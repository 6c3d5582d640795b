#![forbid(unsafe_code)]

//! Uploaded font conversion.

use anyhow::{Context, anyhow};
use std::{path::PathBuf, sync::Arc};
use tempfile::TempPath;
use tracing::{error, info};

use crate::{
    artifacts::{Artifact, ArtifactFamily, ArtifactStore, discard_partials},
    clock::Clock,
    error::{ConvertError, ConvertResult},
    security::sanitize_upload_stem,
    tools::{FontFormat, FontTranscoder},
};

/// A validated `/convert-font` upload, still held in memory.
#[derive(Debug, Clone)]
pub struct FontConversionRequest {
    pub original_name: String,
    pub bytes: Vec<u8>,
    pub format: FontFormat,
}

impl FontConversionRequest {
    /// Validates the multipart fields before anything touches the disk.
    pub fn parse(
        file: Option<(Option<String>, Vec<u8>)>,
        format: Option<&str>,
    ) -> ConvertResult<Self> {
        let Some((original_name, bytes)) = file.filter(|(_, bytes)| !bytes.is_empty()) else {
            return Err(ConvertError::invalid("no font file was provided"));
        };
        let format = format.and_then(FontFormat::parse).ok_or_else(|| {
            ConvertError::invalid(
                "unsupported format; only \"woff\", \"woff2\" and \"ttf\" are accepted",
            )
        })?;
        Ok(Self {
            original_name: original_name.unwrap_or_default(),
            bytes,
            format,
        })
    }

    /// `<sanitized base name>.<format>`
    pub fn output_filename(&self) -> String {
        format!(
            "{}.{}",
            sanitize_upload_stem(&self.original_name),
            self.format.extension()
        )
    }
}

/// Result of a font conversion, including the absolute link clients use to
/// fetch it from the static route.
#[derive(Debug, Clone)]
pub struct FontConversion {
    pub artifact: Artifact,
    pub download_url: String,
}

pub struct FontConverter {
    store: Arc<ArtifactStore>,
    transcoder: Arc<dyn FontTranscoder>,
    clock: Arc<dyn Clock>,
    public_url: String,
}

impl FontConverter {
    pub fn new(
        store: Arc<ArtifactStore>,
        transcoder: Arc<dyn FontTranscoder>,
        clock: Arc<dyn Clock>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transcoder,
            clock,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn convert(&self, request: FontConversionRequest) -> ConvertResult<FontConversion> {
        let filename = request.output_filename();
        let format = request.format;
        info!(upload = %request.original_name, filename = %filename, "starting font conversion");

        // Deleted when this guard goes out of scope, whatever the outcome.
        let scratch = self
            .write_scratch(request.bytes)
            .await
            .map_err(|err| failed(&filename, err))?;

        let root = self.store.root(ArtifactFamily::Font);
        let generated = match self.transcoder.convert(&scratch, root, format).await {
            Ok(generated) => generated,
            Err(err) => {
                // The tool names its outputs after the scratch file.
                if let Some(stem) = scratch.file_stem().and_then(|stem| stem.to_str()) {
                    discard_partials(root, stem).await;
                }
                return Err(failed(&filename, err));
            }
        };

        // Every generated file is removed on drop unless it is kept below.
        let mut outputs = generated
            .into_iter()
            .map(TempPath::try_from_path)
            .collect::<std::io::Result<Vec<_>>>()
            .context("tracking font transcoder outputs")
            .map_err(|err| failed(&filename, err))?;

        let suffix = format!(".{}", format.extension());
        let position = outputs
            .iter()
            .position(|path| path.to_string_lossy().ends_with(&suffix))
            .ok_or_else(|| failed(&filename, anyhow!("font transcoder produced no {suffix} file")))?;
        let produced = outputs.swap_remove(position);

        let stored_path = self.store.output_path(ArtifactFamily::Font, &filename);
        tokio::fs::rename(&produced, &stored_path)
            .await
            .with_context(|| format!("renaming {} to {}", produced.display(), stored_path.display()))
            .map_err(|err| failed(&filename, err))?;
        // Disarm the guard: without a rename it still names the artifact.
        produced
            .keep()
            .map_err(|err| failed(&filename, err.error.into()))?;
        drop(outputs);
        drop(scratch);

        info!(filename = %filename, "font conversion finished");
        Ok(FontConversion {
            download_url: format!(
                "{}/{}/{}",
                self.public_url,
                ArtifactFamily::Font.route(),
                filename
            ),
            artifact: Artifact {
                filename,
                stored_path,
                created_at: self.clock.now(),
                family: ArtifactFamily::Font,
            },
        })
    }

    async fn write_scratch(&self, bytes: Vec<u8>) -> anyhow::Result<TempPath> {
        let dir: PathBuf = self.store.upload_root().to_path_buf();
        let scratch = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("font-")
                .tempfile_in(&dir)
                .with_context(|| format!("creating scratch file in {}", dir.display()))
                .map(|file| file.into_temp_path())
        })
        .await
        .context("scratch file task panicked")??;
        tokio::fs::write(&scratch, bytes)
            .await
            .with_context(|| format!("writing {}", scratch.display()))?;
        Ok(scratch)
    }
}

fn failed(filename: &str, err: anyhow::Error) -> ConvertError {
    error!(filename, error = ?err, "font conversion failed");
    ConvertError::failed("font conversion failed", err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    /// Mimics a transcoder that names its output after the scratch input.
    #[derive(Default)]
    struct FakeFontTranscoder {
        fail: bool,
        fail_after_write: bool,
        wrong_extension: bool,
        extra_output: bool,
        inputs: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl FontTranscoder for FakeFontTranscoder {
        async fn convert(
            &self,
            input: &Path,
            output_dir: &Path,
            format: FontFormat,
        ) -> Result<Vec<PathBuf>> {
            self.inputs.lock().push(input.to_path_buf());
            assert_eq!(std::fs::read(input).unwrap(), b"\x00\x01\x00\x00font");
            if self.fail {
                bail!("Not a TrueType or OpenType font");
            }
            let ext = if self.wrong_extension {
                "otf"
            } else {
                format.extension()
            };
            let stem = input.file_stem().unwrap().to_string_lossy().into_owned();
            let out = output_dir.join(format!("{stem}.{ext}"));
            std::fs::write(&out, format!("converted {ext}")).unwrap();
            if self.fail_after_write {
                bail!("killed after 30s");
            }
            let mut generated = vec![out];
            if self.extra_output {
                let extra = output_dir.join(format!("{stem}.glyphs.txt"));
                std::fs::write(&extra, "debug dump").unwrap();
                generated.insert(0, extra);
            }
            Ok(generated)
        }
    }

    struct Harness {
        _temp: TempDir,
        store: Arc<ArtifactStore>,
        transcoder: Arc<FakeFontTranscoder>,
        converter: FontConverter,
    }

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn harness(transcoder: FakeFontTranscoder) -> Harness {
        let temp = tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(
            temp.path().join("converted-videos"),
            temp.path().join("converted-fonts"),
            temp.path().join("uploads"),
        ));
        store.prepare().await.unwrap();
        let transcoder = Arc::new(transcoder);
        let clock = Arc::new(ManualClock::new(created()));
        let converter = FontConverter::new(
            store.clone(),
            transcoder.clone(),
            clock,
            "http://localhost:4000/",
        );
        Harness {
            _temp: temp,
            store,
            transcoder,
            converter,
        }
    }

    fn upload(name: &str, format: FontFormat) -> FontConversionRequest {
        FontConversionRequest {
            original_name: name.to_string(),
            bytes: b"\x00\x01\x00\x00font".to_vec(),
            format,
        }
    }

    fn uploads_empty(store: &ArtifactStore) -> bool {
        std::fs::read_dir(store.upload_root()).unwrap().next().is_none()
    }

    fn font_entries(store: &ArtifactStore) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(store.root(ArtifactFamily::Font))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn parse_requires_file_and_known_format() {
        let file = || Some((Some("a.ttf".to_string()), b"data".to_vec()));
        assert!(FontConversionRequest::parse(file(), Some("woff2")).is_ok());

        for (file, format) in [
            (None, Some("woff")),
            (Some((Some("a.ttf".to_string()), Vec::new())), Some("woff")),
            (file(), None),
            (file(), Some("eot")),
        ] {
            let err = FontConversionRequest::parse(file, format).unwrap_err();
            assert!(matches!(err, ConvertError::InvalidRequest(_)));
        }
    }

    #[test]
    fn output_filename_uses_sanitized_stem() {
        assert_eq!(upload("Lato-Bold.ttf", FontFormat::Woff).output_filename(), "Lato-Bold.woff");
        assert_eq!(
            upload("../../evil.otf", FontFormat::Woff2).output_filename(),
            "evil.woff2"
        );
        assert_eq!(upload("", FontFormat::Ttf).output_filename(), "font.ttf");
    }

    #[tokio::test]
    async fn every_format_produces_named_artifact_and_removes_scratch() {
        for format in [FontFormat::Woff, FontFormat::Woff2, FontFormat::Ttf] {
            let h = harness(FakeFontTranscoder::default()).await;
            let result = h
                .converter
                .convert(upload("Inter Regular.ttf", format))
                .await
                .unwrap();

            let expected = format!("Inter_Regular.{}", format.extension());
            assert_eq!(result.artifact.filename, expected);
            assert_eq!(
                result.download_url,
                format!("http://localhost:4000/converted-fonts/{expected}")
            );
            assert_eq!(
                std::fs::read_to_string(&result.artifact.stored_path).unwrap(),
                format!("converted {}", format.extension())
            );
            assert_eq!(result.artifact.created_at, created());
            assert_eq!(font_entries(&h.store), vec![expected]);
            assert!(uploads_empty(&h.store));
            let inputs = h.transcoder.inputs.lock().clone();
            assert!(!inputs[0].exists());
        }
    }

    #[tokio::test]
    async fn transcoder_failure_still_removes_scratch() {
        let h = harness(FakeFontTranscoder {
            fail: true,
            ..FakeFontTranscoder::default()
        })
        .await;
        let err = h
            .converter
            .convert(upload("a.ttf", FontFormat::Woff2))
            .await
            .unwrap_err();

        assert!(matches!(err, ConvertError::ConversionFailed { .. }));
        assert_eq!(err.to_string(), "font conversion failed");
        assert!(uploads_empty(&h.store));
    }

    #[tokio::test]
    async fn missing_expected_output_is_a_failure() {
        let h = harness(FakeFontTranscoder {
            wrong_extension: true,
            ..FakeFontTranscoder::default()
        })
        .await;
        let err = h
            .converter
            .convert(upload("a.ttf", FontFormat::Woff))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::ConversionFailed { .. }));
        assert!(uploads_empty(&h.store));
        assert!(font_entries(&h.store).is_empty());
    }

    #[tokio::test]
    async fn output_written_before_failure_is_removed() {
        let h = harness(FakeFontTranscoder {
            fail_after_write: true,
            ..FakeFontTranscoder::default()
        })
        .await;
        let err = h
            .converter
            .convert(upload("a.ttf", FontFormat::Woff2))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "font conversion failed");
        assert!(font_entries(&h.store).is_empty());
        assert!(uploads_empty(&h.store));
    }

    #[tokio::test]
    async fn unselected_outputs_are_removed() {
        let h = harness(FakeFontTranscoder {
            extra_output: true,
            ..FakeFontTranscoder::default()
        })
        .await;
        let result = h
            .converter
            .convert(upload("Lato.ttf", FontFormat::Woff))
            .await
            .unwrap();

        assert_eq!(result.artifact.filename, "Lato.woff");
        assert_eq!(font_entries(&h.store), vec!["Lato.woff".to_string()]);
    }
}
