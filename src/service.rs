use std::{io, path::PathBuf, time::SystemTime};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::{
    fs,
    sync::Mutex as AsyncMutex,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    clock::LamportClock,
    config::Config,
    journal::{instant_at, Journal, Snapshot},
    reading::{Reading, ReadingError},
    recovery::{self, RecoveryReport},
    staging::StagingArea,
    store::{RecordStore, Upsert},
};

/// The result of one request, as seen by the peer that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// First reading from a source.
    Created,
    /// Reading from a source the store already held.
    Updated,
    Found(Reading),
    NotFound,
    /// A submission with an empty body.
    NoContent,
    Malformed(String),
    InternalError(String),
    BadRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub outcome: Outcome,
    /// The aggregator's logical time when the response was produced.
    pub clock: u64,
}

/// The aggregator: owns the logical clock, the record store, the staging area
/// and the main store file, and turns requests into [`Response`]s.
///
/// Handlers share it behind an `Arc`. The clock is updated atomically on its
/// own; the store is only ever touched inside short critical sections that
/// never await. Changes are made to a copy of the store, written to the main
/// store file, and only then installed, one commit at a time, so a failed
/// write leaves nothing behind in memory.
pub struct Aggregator {
    clock: LamportClock,
    store: Mutex<RecordStore>,
    /// Held across a whole commit. Numbers main store file snapshots.
    generation: AsyncMutex<u64>,
    staging: StagingArea,
    journal: Journal,
    expiry: Duration,
}

impl Aggregator {
    /// Loads the main store file, replays anything left in staging, and
    /// returns an aggregator ready to serve.
    pub async fn open(config: &Config) -> io::Result<Self> {
        fs::create_dir_all(&config.data_dir).await?;
        let staging = StagingArea::open(config.staging_dir()).await?;
        let journal = Journal::new(config.store_file());
        let mut store = RecordStore::new(config.max_records, config.retention);

        let now = SystemTime::now();
        let mut stale = 0;
        let mut committed = HashMap::new();
        for (reading, received_at) in journal.load().await? {
            if now.duration_since(received_at).unwrap_or_default() > config.expiry {
                stale += 1;
                continue;
            }
            committed.insert(reading.id().to_owned(), received_at);
            store.upsert(reading, instant_at(received_at));
        }

        let generation = 1;
        let RecoveryReport {
            recovered,
            expired,
            corrupt,
            superseded,
        } = recovery::recover(
            &staging,
            &mut store,
            &journal,
            &committed,
            generation,
            config.expiry,
        )
        .await?;
        info!(
            records = store.len(),
            stale, recovered, expired, corrupt, superseded,
            data_dir = %config.data_dir.display(),
            "store ready"
        );

        Ok(Self {
            clock: LamportClock::new(),
            store: Mutex::new(store),
            generation: AsyncMutex::new(generation),
            staging,
            journal,
            expiry: config.expiry,
        })
    }

    /// Admits a reading sent at logical time `sent_at`.
    ///
    /// The reading is staged to disk, merged into the store, written to the
    /// main store file, and only then unstaged. Failures are returned as
    /// outcomes and leave neither a staged artifact nor a merged record
    /// behind.
    pub async fn submit(&self, sent_at: u64, body: &[u8]) -> Response {
        self.clock.observe(sent_at);

        let reading = match Reading::parse(body) {
            Ok(reading) => reading,
            Err(ReadingError::Empty) => return self.respond(Outcome::NoContent),
            Err(e) => {
                warn!(error = %e, "rejecting malformed reading");
                return self.respond(Outcome::Malformed(e.to_string()));
            }
        };
        let id = reading.id().to_owned();

        let staged = match self.staging.stage(&reading).await {
            Ok(path) => path,
            Err(e) => {
                warn!(id, error = %e, "could not stage reading");
                return self.respond(Outcome::InternalError(e.to_string()));
            }
        };

        let committed = self
            .commit(|store| (store.upsert(reading, Instant::now()), true))
            .await;
        self.staging.discard(&staged).await;

        let upsert = match committed {
            Ok(upsert) => upsert,
            Err(e) => {
                warn!(id, error = %e, "could not write store file");
                return self.respond(Outcome::InternalError(e.to_string()));
            }
        };

        let response = self.respond(match upsert {
            Upsert::Created => Outcome::Created,
            Upsert::Updated => Outcome::Updated,
        });
        debug!(id, ?upsert, clock = response.clock, "reading admitted");
        response
    }

    /// Answers with the newest reading overall, or the newest from `id`.
    pub fn query(&self, sent_at: u64, id: Option<&str>) -> Response {
        self.clock.observe(sent_at);
        let found = {
            let store = self.store.lock();
            match id {
                Some(id) => store.latest_for(id).cloned(),
                None => store.latest().cloned(),
            }
        };
        self.respond(match found {
            Some(reading) => Outcome::Found(reading),
            None => Outcome::NotFound,
        })
    }

    /// Answers a request that could not be understood. `sent_at` is the
    /// sender's time if it could be read.
    pub fn reject(&self, sent_at: Option<u64>, reason: impl Into<String>) -> Response {
        if let Some(sent_at) = sent_at {
            self.clock.observe(sent_at);
        }
        self.respond(Outcome::BadRequest(reason.into()))
    }

    /// Removes every source silent for longer than the expiry cutoff and
    /// commits the change to the main store file. Returns the evicted ids.
    /// If the file cannot be written the sources stay until the next call.
    pub async fn evict_silent(&self) -> io::Result<Vec<String>> {
        let expiry = self.expiry;
        self.commit(|store| {
            let evicted = store.evict_older_than(expiry, Instant::now());
            let changed = !evicted.is_empty();
            (evicted, changed)
        })
        .await
    }

    /// Applies `change` to a copy of the store, writes the copy to the main
    /// store file, and installs it. `change` also reports whether it altered
    /// anything; if not, nothing is written. Commits run one at a time, so the
    /// store seen by queries only ever moves from one written snapshot to the
    /// next.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut RecordStore) -> (T, bool),
    ) -> io::Result<T> {
        let mut generation = self.generation.lock().await;
        let mut next = self.store.lock().clone();
        let (out, changed) = change(&mut next);
        if !changed {
            return Ok(out);
        }

        let snapshot = Snapshot::capture(*generation + 1, &next);
        self.journal.write(snapshot).await?;
        *generation += 1;
        *self.store.lock() = next;
        Ok(out)
    }

    /// Deletes staged artifacts `id` left behind before the expiry window.
    pub async fn discard_staged_for(&self, id: &str) -> io::Result<usize> {
        let before = SystemTime::now()
            .checked_sub(self.expiry)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.staging.remove_for_source(id, before).await
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging.dir().to_path_buf()
    }

    fn respond(&self, outcome: Outcome) -> Response {
        Response {
            clock: self.clock.tick(),
            outcome,
        }
    }
}
