use tokio::{
    io::BufReader,
    net::TcpStream,
    time::{self, Duration},
};
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use crate::{
    clock::LamportClock,
    error::{Error, Result},
    reading::Reading,
    service::Response,
    wire::{self, FrameError, Request},
};

/// Talks to an aggregator, one connection per request, keeping its own
/// Lamport clock in step with the aggregator's.
///
/// Content sources use [`Client::put`]; readers use [`Client::get`].
#[derive(Debug, TypedBuilder)]
pub struct Client {
    /// `host:port` of the aggregator.
    #[builder(setter(into))]
    server: String,
    /// Extra attempts after a request fails to reach the aggregator.
    #[builder(default = 3)]
    retries: u32,
    #[builder(default = Duration::from_secs(1))]
    retry_delay: Duration,
    #[builder(default, setter(skip))]
    clock: LamportClock,
}

impl Client {
    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub async fn put(&self, reading: &Reading) -> Result<Response> {
        self.put_raw(reading.to_json()).await
    }

    /// Sends a body as is, whether or not it is a valid reading.
    pub async fn put_raw(&self, body: Vec<u8>) -> Result<Response> {
        self.send(|clock| Request::Put {
            clock,
            body: body.clone(),
        })
        .await
    }

    pub async fn get(&self, id: Option<&str>) -> Result<Response> {
        self.send(|clock| Request::Get {
            clock,
            id: id.map(str::to_owned),
        })
        .await
    }

    async fn send(&self, request: impl Fn(u64) -> Request) -> Result<Response> {
        let mut attempt = 0;
        loop {
            match self.exchange(&request(self.clock.tick())).await {
                Ok(response) => {
                    self.clock.observe(response.clock);
                    debug!(server = self.server, clock = response.clock, outcome = ?response.outcome, "response");
                    return Ok(response);
                }
                Err(e) if attempt < self.retries && is_transient(&e) => {
                    attempt += 1;
                    warn!(server = self.server, attempt, error = %e, "request failed, retrying");
                    time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn exchange(&self, request: &Request) -> Result<Response> {
        let stream = TcpStream::connect(&self.server).await?;
        let (read, mut write) = stream.into_split();
        wire::write_request(&mut write, request).await?;
        let raw = wire::read_response(&mut BufReader::new(read)).await?;
        Response::try_from(raw)
    }
}

/// Failures worth another attempt: the aggregator could not be reached or
/// went away mid-exchange.
fn is_transient(e: &Error) -> bool {
    matches!(
        e,
        Error::Io(_) | Error::Frame(FrameError::Io(_) | FrameError::UnexpectedEof)
    )
}
