//! STATIONHUB aggregates weather readings pushed by many intermittently
//! connected content sources into a single bounded store, and serves the
//! latest readings back to readers. Every request and response carries a
//! Lamport timestamp so causal order can be reconstructed across processes.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod journal;
pub mod reading;
pub mod recovery;
pub mod server;
pub mod service;
pub mod staging;
pub mod store;
pub mod sweeper;
pub mod wire;

pub use client::Client;
pub use clock::LamportClock;
pub use config::{Config, Retention};
pub use error::{Error, Result};
pub use reading::Reading;
pub use server::Server;
pub use service::{Aggregator, Outcome, Response};
pub use store::{RecordStore, Upsert};
