use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use typed_builder::TypedBuilder;

pub const DEFAULT_PORT: u16 = 4567;
/// Most records the store keeps at once.
pub const MAX_RECORDS: usize = 20;
/// A source silent for longer than this is evicted.
pub const EXPIRY: Duration = Duration::from_secs(30);

const STORE_FILE: &str = "store.jsonl";
const STAGING_DIR: &str = "staging";

/// How the store treats repeated submissions from one source once the size
/// bound is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Retention {
    /// One record per source; a new submission replaces the old one. When the
    /// bound is hit the globally oldest record goes.
    #[default]
    LatestPerSource,
    /// Every submission is kept as its own record, oldest first out. Queries
    /// still answer with the newest record for a source.
    FullHistory,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct Config {
    #[builder(default = SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)))]
    pub listen_addr: SocketAddr,
    /// Holds the main store file and the staging directory.
    #[builder(default = PathBuf::from("data"), setter(into))]
    pub data_dir: PathBuf,
    #[builder(default = MAX_RECORDS)]
    pub max_records: usize,
    #[builder(default = EXPIRY)]
    pub expiry: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub sweep_interval: Duration,
    /// Connections with no complete request for this long are closed.
    #[builder(default = Duration::from_secs(60))]
    pub idle_timeout: Duration,
    #[builder(default)]
    pub retention: Retention,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join(STAGING_DIR)
    }
}
