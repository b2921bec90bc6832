//! Text framing for requests and responses, modelled on HTTP/1.1:
//!
//! ```text
//! PUT /weather.json HTTP/1.1
//! Lamport-Clock: 7
//! Content-Length: 21
//!
//! {"id":"IDS60901",...}
//! ```
//!
//! Lines may end in CRLF or LF. Only what the aggregator needs is understood;
//! everything else in the header block is ignored.

use std::io;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::Error,
    reading::Reading,
    service::{Outcome, Response},
};

pub const RESOURCE: &str = "/weather.json";
pub const CLOCK_HEADER: &str = "Lamport-Clock";
/// Older content sources send their time under this name.
const LEGACY_CLOCK_HEADER: &str = "Lamport-Time";
const CONTENT_LENGTH: &str = "Content-Length";
const MALFORMED_REASON: &str = "Malformed Reading";
/// Bytes of a station id that must be escaped in a query value.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

const MAX_LINE: u64 = 8 * 1024;
const MAX_HEADERS: usize = 64;
const MAX_BODY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection closed mid-message")]
    UnexpectedEof,
    #[error("line longer than 8 KiB")]
    LineTooLong,
    #[error("too many header lines")]
    TooManyHeaders,
    #[error("bad start line `{0}`")]
    BadStartLine(String),
    #[error("bad header line `{0}`")]
    BadHeader(String),
    #[error("bad content length `{0}`")]
    BadContentLength(String),
    #[error("body of {0} bytes exceeds limit")]
    BodyTooLarge(usize),
}

/// A request as framed on the wire, not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A response as framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A request the aggregator knows how to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Put { clock: u64, body: Vec<u8> },
    Get { clock: u64, id: Option<String> },
}

/// Why a well-framed request cannot be served, and the sender's time if it
/// could still be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub clock: Option<u64>,
    pub reason: String,
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

impl RawRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    /// The sender's logical time. A request without one is taken to come
    /// from a peer that has seen nothing yet.
    pub fn clock(&self) -> Result<u64, String> {
        match self
            .header(CLOCK_HEADER)
            .or_else(|| self.header(LEGACY_CLOCK_HEADER))
        {
            None => Ok(0),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| format!("bad {CLOCK_HEADER} `{value}`")),
        }
    }

    /// Interprets the request, or explains why it cannot be served.
    pub fn classify(self) -> Result<Request, Rejection> {
        let clock = self.clock().map_err(|reason| Rejection { clock: None, reason })?;
        let reject = |reason: String| Rejection {
            clock: Some(clock),
            reason,
        };

        let (path, query) = match self.target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (self.target.as_str(), None),
        };
        if path != RESOURCE {
            return Err(reject(format!("unknown resource `{path}`")));
        }

        match self.method.as_str() {
            "PUT" => Ok(Request::Put {
                clock,
                body: self.body,
            }),
            "GET" => Ok(Request::Get {
                clock,
                id: query.and_then(station_filter),
            }),
            other => Err(reject(format!("unsupported method `{other}`"))),
        }
    }
}

/// Picks the station id out of a query string such as `id=IDS60901`,
/// undoing percent-encoding.
fn station_filter(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "id" || *k == "stationId")
        .map(|(_, v)| percent_decode_str(v).decode_utf8_lossy().into_owned())
        .filter(|v| !v.is_empty())
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn clock(&self) -> Option<u64> {
        self.header(CLOCK_HEADER)?.trim().parse().ok()
    }
}

impl From<&Response> for RawResponse {
    fn from(response: &Response) -> Self {
        let (status, reason, body) = match &response.outcome {
            Outcome::Created => (201, "Created", Vec::new()),
            Outcome::Updated => (200, "OK", Vec::new()),
            Outcome::Found(reading) => (200, "OK", reading.to_json()),
            Outcome::NotFound => (404, "Not Found", Vec::new()),
            Outcome::NoContent => (204, "No Content", Vec::new()),
            Outcome::Malformed(why) => (500, MALFORMED_REASON, why.clone().into_bytes()),
            Outcome::InternalError(why) => (500, "Internal Server Error", why.clone().into_bytes()),
            Outcome::BadRequest(why) => (400, "Bad Request", why.clone().into_bytes()),
        };
        let mut headers = vec![(CLOCK_HEADER.to_owned(), response.clock.to_string())];
        if matches!(response.outcome, Outcome::Found(_)) {
            headers.push(("Content-Type".to_owned(), "application/json".to_owned()));
        }
        Self {
            status,
            reason: reason.to_owned(),
            headers,
            body,
        }
    }
}

impl TryFrom<RawResponse> for Response {
    type Error = Error;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let clock = raw
            .clock()
            .ok_or_else(|| Error::Unexpected(format!("no {CLOCK_HEADER} header")))?;
        let text = || String::from_utf8_lossy(&raw.body).into_owned();
        let outcome = match raw.status {
            201 => Outcome::Created,
            200 if raw.body.is_empty() => Outcome::Updated,
            200 => Outcome::Found(Reading::parse(&raw.body)?),
            204 => Outcome::NoContent,
            404 => Outcome::NotFound,
            400 => Outcome::BadRequest(text()),
            500 if raw.reason == MALFORMED_REASON => Outcome::Malformed(text()),
            500 => Outcome::InternalError(text()),
            other => {
                return Err(Error::Unexpected(format!(
                    "status {other} {}",
                    raw.reason
                )))
            }
        };
        Ok(Response { outcome, clock })
    }
}

/// Reads one line without its terminator. `None` means the peer closed the
/// connection before sending anything.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader).take(MAX_LINE + 1).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() as u64 > MAX_LINE {
        return Err(FrameError::LineTooLong);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Reads a start line (skipping blank lines between messages), the header
/// block and the body. `None` means a clean close between messages.
async fn read_message<R>(
    reader: &mut R,
) -> Result<Option<(String, Vec<(String, String)>, Vec<u8>)>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let start = loop {
        match read_line(reader).await? {
            None => return Ok(None),
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line,
        }
    };

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader).await?.ok_or(FrameError::UnexpectedEof)?;
        if line.is_empty() {
            break;
        }
        if headers.len() == MAX_HEADERS {
            return Err(FrameError::TooManyHeaders);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::BadHeader(line.clone()))?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }

    let len = match header(&headers, CONTENT_LENGTH) {
        None => 0,
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| FrameError::BadContentLength(value.to_owned()))?,
    };
    if len > MAX_BODY {
        return Err(FrameError::BodyTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof,
        _ => FrameError::Io(e),
    })?;

    Ok(Some((start, headers, body)))
}

pub async fn read_request<R>(reader: &mut R) -> Result<Option<RawRequest>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let Some((start, headers, body)) = read_message(reader).await? else {
        return Ok(None);
    };
    let mut parts = start.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(FrameError::BadStartLine(start));
    };
    Ok(Some(RawRequest {
        method: method.to_owned(),
        target: target.to_owned(),
        headers,
        body,
    }))
}

pub async fn read_response<R>(reader: &mut R) -> Result<RawResponse, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let (start, headers, body) = read_message(reader).await?.ok_or(FrameError::UnexpectedEof)?;
    let mut parts = start.splitn(3, ' ');
    let status = match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code.parse().ok(),
        _ => None,
    };
    let status = status.ok_or_else(|| FrameError::BadStartLine(start.clone()))?;
    Ok(RawResponse {
        status,
        reason: parts.next().unwrap_or_default().trim().to_owned(),
        headers,
        body,
    })
}

async fn write_message<W>(
    writer: &mut W,
    start: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(start.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    writer.write_all(&out).await?;
    writer.flush().await
}

pub async fn write_response<W>(writer: &mut W, response: &RawResponse) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let start = format!("HTTP/1.1 {} {}", response.status, response.reason);
    write_message(writer, &start, &response.headers, &response.body).await
}

pub async fn write_request<W>(writer: &mut W, request: &Request) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (start, clock, body) = match request {
        Request::Put { clock, body } => (format!("PUT {RESOURCE} HTTP/1.1"), clock, body.as_slice()),
        Request::Get { clock, id } => {
            let target = match id {
                Some(id) => format!("{RESOURCE}?id={}", utf8_percent_encode(id, QUERY_VALUE)),
                None => RESOURCE.to_owned(),
            };
            (format!("GET {target} HTTP/1.1"), clock, &[][..])
        }
    };
    let mut headers = vec![
        ("User-Agent".to_owned(), "stationhub/1.0".to_owned()),
        (CLOCK_HEADER.to_owned(), clock.to_string()),
    ];
    if matches!(request, Request::Put { .. }) {
        headers.push(("Content-Type".to_owned(), "application/json".to_owned()));
    }
    write_message(writer, &start, &headers, body).await
}

#[cfg(test)]
mod tests {
    use tokio::io::BufReader;

    use super::*;

    async fn parse(text: &str) -> Result<Option<RawRequest>, FrameError> {
        read_request(&mut BufReader::new(text.as_bytes())).await
    }

    #[tokio::test]
    async fn reads_a_put() {
        let raw = parse(
            "PUT /weather.json HTTP/1.1\r\nlamport-clock: 7\r\nContent-Length: 11\r\n\r\n{\"id\":\"S1\"}",
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            raw.classify().unwrap(),
            Request::Put {
                clock: 7,
                body: b"{\"id\":\"S1\"}".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn reads_back_to_back_requests_with_bare_newlines() {
        let text = "GET /weather.json?stationId=S2 HTTP/1.1\nLamport-Time: 3\n\n\
                    GET /weather.json HTTP/1.1\n\n";
        let mut reader = BufReader::new(text.as_bytes());
        let first = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(
            first.classify().unwrap(),
            Request::Get {
                clock: 3,
                id: Some("S2".into())
            }
        );
        let second = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.classify().unwrap(), Request::Get { clock: 0, id: None });
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejections_keep_the_clock_when_readable() {
        let raw = parse("DELETE /weather.json HTTP/1.1\r\nLamport-Clock: 9\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        let rejection = raw.classify().unwrap_err();
        assert_eq!(rejection.clock, Some(9));

        let raw = parse("GET /other HTTP/1.1\r\n\r\n").await.unwrap().unwrap();
        assert_eq!(raw.classify().unwrap_err().clock, Some(0));

        let raw = parse("GET /weather.json HTTP/1.1\r\nLamport-Clock: soon\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.classify().unwrap_err().clock, None);
    }

    #[tokio::test]
    async fn framing_errors() {
        assert!(matches!(parse("GARBAGE\r\n\r\n").await, Err(FrameError::BadStartLine(_))));
        assert!(matches!(
            parse("PUT /weather.json HTTP/1.1\r\nContent-Length: 10\r\n\r\n{}").await,
            Err(FrameError::UnexpectedEof)
        ));
        assert!(matches!(
            parse("PUT /weather.json HTTP/1.1\r\nContent-Length: x\r\n\r\n").await,
            Err(FrameError::BadContentLength(_))
        ));
        assert!(matches!(
            parse("PUT /weather.json HTTP/1.1\r\nno colon here\r\n\r\n").await,
            Err(FrameError::BadHeader(_))
        ));
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(9000));
        assert!(matches!(parse(&long).await, Err(FrameError::LineTooLong)));
    }

    #[tokio::test]
    async fn responses_survive_the_wire() {
        let reading = Reading::parse(br#"{"id":"S1","air_temp":"13.3"}"#).unwrap();
        let cases = [
            Outcome::Created,
            Outcome::Updated,
            Outcome::Found(reading),
            Outcome::NotFound,
            Outcome::NoContent,
            Outcome::Malformed("bad".into()),
            Outcome::InternalError("disk".into()),
            Outcome::BadRequest("what".into()),
        ];
        for (n, outcome) in cases.into_iter().enumerate() {
            let response = Response {
                outcome,
                clock: n as u64 + 1,
            };
            let mut buf = Vec::new();
            write_response(&mut buf, &RawResponse::from(&response)).await.unwrap();
            let raw = read_response(&mut BufReader::new(buf.as_slice())).await.unwrap();
            assert_eq!(Response::try_from(raw).unwrap(), response);
        }
    }

    #[tokio::test]
    async fn requests_survive_the_wire() {
        let requests = [
            Request::Put {
                clock: 4,
                body: br#"{"id":"S1"}"#.to_vec(),
            },
            Request::Get {
                clock: 5,
                id: Some("S1".into()),
            },
            Request::Get { clock: 6, id: None },
        ];
        for request in requests {
            let mut buf = Vec::new();
            write_request(&mut buf, &request).await.unwrap();
            let raw = read_request(&mut BufReader::new(buf.as_slice())).await.unwrap().unwrap();
            assert_eq!(raw.classify().unwrap(), request);
        }
    }

    #[tokio::test]
    async fn station_ids_are_escaped_in_the_query() {
        for id in ["A B", "A&B", "k=v", "../S1", "50%", "Zürich"] {
            let request = Request::Get {
                clock: 1,
                id: Some(id.into()),
            };
            let mut buf = Vec::new();
            write_request(&mut buf, &request).await.unwrap();
            let start = buf.split(|b| *b == b'\r').next().unwrap();
            assert_eq!(start.iter().filter(|b| **b == b' ').count(), 2);

            let raw = read_request(&mut BufReader::new(buf.as_slice())).await.unwrap().unwrap();
            assert_eq!(raw.classify().unwrap(), request);
        }
    }

    #[tokio::test]
    async fn hand_written_queries_are_decoded() {
        let raw = parse("GET /weather.json?stationId=IDS%2060901&x=1 HTTP/1.1\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            raw.classify().unwrap(),
            Request::Get {
                clock: 0,
                id: Some("IDS 60901".into())
            }
        );
    }
}
