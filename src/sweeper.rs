use std::sync::Arc;

use tokio::{
    select,
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::service::Aggregator;

/// Periodically evicts sources that have stopped submitting.
///
/// Elapsed time is the only signal: a slow source and a dead one look the
/// same until the expiry cutoff passes. The period only needs to be well
/// inside that cutoff.
pub struct Sweeper {
    hub: Arc<Aggregator>,
    period: Duration,
}

impl Sweeper {
    pub fn new(hub: Arc<Aggregator>, period: Duration) -> Self {
        Self { hub, period }
    }

    /// Runs the sweeper on its own task until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel).instrument(debug_span!("sweeper")))
    }

    async fn run(self, cancel: CancellationToken) {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(period = ?self.period, "sweeper started");
        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        debug!("sweeper stopped");
    }

    /// One pass: evicts silent sources and removes what they left in staging.
    pub async fn sweep_once(&self) -> Vec<String> {
        let evicted = match self.hub.evict_silent().await {
            Ok(evicted) => evicted,
            Err(e) => {
                warn!(error = %e, "sweep could not commit evictions");
                return Vec::new();
            }
        };
        for id in &evicted {
            match self.hub.discard_staged_for(id).await {
                Ok(0) => info!(id, "evicted silent source"),
                Ok(removed) => info!(id, removed, "evicted silent source and its staged readings"),
                Err(e) => warn!(id, error = %e, "evicted silent source, staging not cleaned"),
            }
        }
        evicted
    }
}
