use std::{
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex, time::Instant};
use tracing::{debug, warn};

use crate::{reading::Reading, store::RecordStore};

/// One committed record, as a line of the main store file.
#[derive(Debug, Serialize, Deserialize)]
struct Line {
    reading: Reading,
    received_at: DateTime<Utc>,
}

/// A copy of the store's contents, numbered so that an older copy is never
/// written over a newer one.
#[derive(Debug)]
pub struct Snapshot {
    generation: u64,
    taken_at: Instant,
    records: Vec<(Reading, Instant)>,
}

impl Snapshot {
    pub fn capture(generation: u64, store: &RecordStore) -> Self {
        Self {
            generation,
            taken_at: Instant::now(),
            records: store
                .records()
                .map(|r| (r.reading.clone(), r.received_at))
                .collect(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let wall = Utc::now();
        let mut out = Vec::new();
        for (reading, received_at) in &self.records {
            let age = self.taken_at.saturating_duration_since(*received_at);
            let age = chrono::Duration::from_std(age)
                .unwrap_or_else(|_| chrono::Duration::zero());
            serde_json::to_writer(
                &mut out,
                &Line {
                    reading: reading.clone(),
                    received_at: wall - age,
                },
            )?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

/// The main store file: every committed record, one per line, oldest first.
///
/// The file is replaced whole on every write (temp file, then rename), so a
/// crash leaves either the previous or the next version in place.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    /// Generation of the last snapshot written.
    written: Mutex<u64>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the committed records back, oldest first, with the wall-clock
    /// time each was received. A missing file is an empty store; lines that
    /// cannot be parsed are skipped.
    pub async fn load(&self) -> io::Result<Vec<(Reading, SystemTime)>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Line>(line) {
                Ok(line) => records.push((line.reading, line.received_at.into())),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = n + 1,
                    error = %e,
                    "skipping unreadable store line"
                ),
            }
        }
        Ok(records)
    }

    /// Writes a snapshot unless a newer one has already been written. Returns
    /// whether the file was replaced.
    pub async fn write(&self, snapshot: Snapshot) -> io::Result<bool> {
        let mut written = self.written.lock().await;
        if snapshot.generation <= *written {
            return Ok(false);
        }
        let body = snapshot.encode()?;

        let tmp = self.path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;

        *written = snapshot.generation;
        debug!(
            generation = snapshot.generation,
            records = snapshot.records.len(),
            "store file written"
        );
        Ok(true)
    }
}

/// Maps a wall-clock time onto the local monotonic clock, as an age from now.
pub(crate) fn instant_at(at: SystemTime) -> Instant {
    let now = Instant::now();
    let age = SystemTime::now().duration_since(at).unwrap_or_default();
    now.checked_sub(age).unwrap_or(now)
}
