#![forbid(unsafe_code)]

//! Artifact store: two flat directories, one per artifact family, addressed
//! by generated file names.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    error::{ConvertError, ConvertResult},
    security::is_plain_file_name,
};

/// URL prefixes under which each family is served statically.
pub const VIDEO_ROUTE: &str = "converted-videos";
pub const FONT_ROUTE: &str = "converted-fonts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactFamily {
    Video,
    Font,
}

impl ArtifactFamily {
    pub fn route(self) -> &'static str {
        match self {
            Self::Video => VIDEO_ROUTE,
            Self::Font => FONT_ROUTE,
        }
    }
}

/// A finished conversion output owned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub stored_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub family: ArtifactFamily,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    video_root: PathBuf,
    font_root: PathBuf,
    upload_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(video_root: PathBuf, font_root: PathBuf, upload_root: PathBuf) -> Self {
        Self {
            video_root,
            font_root,
            upload_root,
        }
    }

    /// Creates every directory the store writes into.
    pub async fn prepare(&self) -> Result<()> {
        for dir in [&self.video_root, &self.font_root, &self.upload_root] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn root(&self, family: ArtifactFamily) -> &Path {
        match family {
            ArtifactFamily::Video => &self.video_root,
            ArtifactFamily::Font => &self.font_root,
        }
    }

    pub fn upload_root(&self) -> &Path {
        &self.upload_root
    }

    /// Roots the retention sweeper is responsible for.
    pub fn artifact_roots(&self) -> Vec<PathBuf> {
        vec![self.video_root.clone(), self.font_root.clone()]
    }

    /// Location for a name the server generated itself.
    pub fn output_path(&self, family: ArtifactFamily, filename: &str) -> PathBuf {
        self.root(family).join(filename)
    }

    /// Maps a client supplied file name to an existing artifact. The name
    /// must be a single path component and the canonical target has to stay
    /// inside the canonical family root, which also rules out symlinks that
    /// point elsewhere.
    pub async fn resolve(&self, family: ArtifactFamily, filename: &str) -> ConvertResult<PathBuf> {
        if !is_plain_file_name(filename) {
            return Err(ConvertError::not_found("file not found"));
        }
        let root = tokio::fs::canonicalize(self.root(family))
            .await
            .map_err(|_| ConvertError::not_found("file not found"))?;
        let candidate = tokio::fs::canonicalize(root.join(filename))
            .await
            .map_err(|_| ConvertError::not_found("file not found"))?;
        if !candidate.starts_with(&root) {
            warn!(requested = filename, "rejected artifact path outside of its root");
            return Err(ConvertError::not_found("file not found"));
        }
        let metadata = tokio::fs::metadata(&candidate)
            .await
            .map_err(|_| ConvertError::not_found("file not found"))?;
        if !metadata.is_file() {
            return Err(ConvertError::not_found("file not found"));
        }
        Ok(candidate)
    }

    /// True when `path` is an existing direct child of the family root. Used
    /// to vet paths reported back by external tools, which may spell the root
    /// differently (absolute vs relative, through symlinks).
    pub async fn contains(&self, family: ArtifactFamily, path: &Path) -> bool {
        let (Ok(root), Ok(candidate)) = (
            tokio::fs::canonicalize(self.root(family)).await,
            tokio::fs::canonicalize(path).await,
        ) else {
            return false;
        };
        candidate.parent() == Some(root.as_path())
            && candidate
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(is_plain_file_name)
    }
}

/// Hands out millisecond timestamps for file names. Stamps strictly increase
/// within one process even when the clock stalls or steps backwards.
pub struct ArtifactNamer {
    clock: Arc<dyn Clock>,
    last: Mutex<i64>,
}

impl ArtifactNamer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Mutex::new(i64::MIN),
        }
    }

    pub fn next_stamp(&self) -> (i64, DateTime<Utc>) {
        let now = self.clock.now();
        let mut last = self.last.lock();
        let stamp = now.timestamp_millis().max(last.saturating_add(1));
        *last = stamp;
        (stamp, now)
    }
}

/// Removes every file in `dir` whose name starts with `<stem>.`, which covers
/// the final output as well as `.part` files and intermediates a failed tool
/// run leaves behind.
pub async fn discard_partials(dir: &Path, stem: &str) {
    let prefix = format!("{stem}.");
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "could not list directory for cleanup");
            return;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "could not list directory for cleanup");
                break;
            }
        };
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed partial output"),
            Err(err) => warn!(path = %path.display(), error = %err, "could not remove partial output"),
        }
    }
}
