use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    time::{self, Duration},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    config::Config,
    service::{Aggregator, Response},
    sweeper::Sweeper,
    wire::{self, FrameError, RawRequest, RawResponse, Rejection, Request},
};

/// Accepts connections and serves each on its own task, with the sweeper
/// running alongside.
pub struct Server {
    listener: TcpListener,
    hub: Arc<Aggregator>,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl Server {
    /// Opens the aggregator (recovering whatever a previous run left behind)
    /// and binds the listener. No request is accepted before recovery is done.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let hub = Arc::new(Aggregator::open(config).await?);
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            listener,
            hub,
            idle_timeout: config.idle_timeout,
            sweep_interval: config.sweep_interval,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        self.hub.clone()
    }

    /// Serves until `cancel` fires, then stops accepting, lets in-flight
    /// requests finish and returns.
    pub async fn run(self, cancel: CancellationToken) -> io::Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "aggregator listening");

        let sweeper = Sweeper::new(self.hub.clone(), self.sweep_interval).spawn(cancel.child_token());
        let connections = TaskTracker::new();

        loop {
            let (stream, peer) = select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "could not accept connection");
                        continue;
                    }
                },
            };
            let connection = Connection {
                hub: self.hub.clone(),
                idle_timeout: self.idle_timeout,
                cancel: cancel.child_token(),
            };
            connections.spawn(
                connection
                    .serve(stream)
                    .instrument(debug_span!("connection", %peer)),
            );
        }

        info!("aggregator shutting down");
        connections.close();
        connections.wait().await;
        if let Err(e) = sweeper.await {
            warn!(error = %e, "sweeper task failed");
        }
        Ok(())
    }
}

struct Connection {
    hub: Arc<Aggregator>,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl Connection {
    /// Serves requests from one peer until it hangs up, goes idle, sends
    /// something that cannot be framed, or the server shuts down.
    async fn serve(self, stream: TcpStream) {
        debug!("connection opened");
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        loop {
            let next = select! {
                _ = self.cancel.cancelled() => break,
                next = time::timeout(self.idle_timeout, wire::read_request(&mut reader)) => next,
            };
            let (response, keep_open) = match next {
                Err(_) => {
                    debug!("closing idle connection");
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Err(FrameError::Io(e))) => {
                    debug!(error = %e, "connection failed");
                    break;
                }
                Ok(Err(e)) => {
                    // the stream cannot be resynchronised after a framing error
                    warn!(error = %e, "unreadable request");
                    (self.hub.reject(None, e.to_string()), false)
                }
                Ok(Ok(Some(raw))) => (self.dispatch(raw).await, true),
            };

            let raw = RawResponse::from(&response);
            if let Err(e) = wire::write_response(&mut write, &raw).await {
                debug!(error = %e, "could not send response");
                break;
            }
            if !keep_open {
                break;
            }
        }
        debug!("connection closed");
    }

    async fn dispatch(&self, raw: RawRequest) -> Response {
        match raw.classify() {
            Ok(Request::Put { clock, body }) => self.hub.submit(clock, &body).await,
            Ok(Request::Get { clock, id }) => self.hub.query(clock, id.as_deref()),
            Err(Rejection { clock, reason }) => {
                warn!(reason, "bad request");
                self.hub.reject(clock, reason)
            }
        }
    }
}
