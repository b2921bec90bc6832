use std::{
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::Utc;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use crate::{error::Result, reading::Reading};

const EXTENSION: &str = "json";

/// The write-ahead directory submissions are staged in before they are merged
/// into the store.
///
/// Artifact names are `<source-key>-<millis>-<token>.json`, where the source
/// key is derived from the reading's id. Two submissions never share a name,
/// and every artifact can be traced back to its source without reading it.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

/// A staged reading waiting to be merged, or left behind by a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl StagingArea {
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably writes a reading to a fresh artifact and returns its path.
    pub async fn stage(&self, reading: &Reading) -> io::Result<PathBuf> {
        let name = format!(
            "{}-{}-{:016x}.{EXTENSION}",
            source_key(reading.id()),
            Utc::now().timestamp_millis(),
            rand::random::<u64>(),
        );
        let path = self.dir.join(name);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        let written = match file.write_all(&reading.to_json()).await {
            Ok(()) => file.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            drop(file);
            self.discard(&path).await;
            return Err(e);
        }
        debug!(path = %path.display(), id = reading.id(), "staged reading");
        Ok(path)
    }

    /// Removes an artifact. One that is already gone counts as removed.
    pub async fn discard(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not remove staged artifact")
            }
        }
    }

    pub async fn read(&self, artifact: &Artifact) -> Result<Reading> {
        let body = fs::read(&artifact.path).await?;
        Ok(Reading::parse(&body)?)
    }

    /// Lists every artifact currently staged, in no particular order.
    pub async fn artifacts(&self) -> io::Result<Vec<Artifact>> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != EXTENSION) {
                continue;
            }
            // submissions discard their artifacts concurrently with listing
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if !metadata.is_file() {
                continue;
            }
            artifacts.push(Artifact {
                path,
                modified: metadata.modified()?,
            });
        }
        Ok(artifacts)
    }

    /// Removes the artifacts a source left behind that were last written
    /// before `before`. Returns how many were removed.
    pub async fn remove_for_source(
        &self,
        id: &str,
        before: SystemTime,
    ) -> io::Result<usize> {
        let prefix = format!("{}-", source_key(id));
        let mut removed = 0;
        for artifact in self.artifacts().await? {
            let owned = artifact
                .path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with(&prefix));
            if owned && artifact.modified < before {
                self.discard(&artifact.path).await;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// A filesystem-safe key for a source id.
fn source_key(id: &str) -> String {
    blake3::hash(id.as_bytes()).to_hex().as_str()[..16].to_owned()
}
