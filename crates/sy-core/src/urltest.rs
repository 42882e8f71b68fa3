//! Canary probing: measure one outbound's latency against a small HTTP
//! endpoint.

use crate::adapter::{IoStream, Outbound};
use crate::context::InboundContext;
use crate::types::{Endpoint, Host, Network};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A status line longer than this is not a canary worth waiting on.
const MAX_STATUS_LINE: usize = 512;

/// Probe `url` through `outbound` and return the elapsed milliseconds.
///
/// For `http` URLs this is a HEAD round-trip to the first response byte;
/// for `https` the connection established through the outbound is the
/// measurement, as the core carries no TLS stack. Timeout counts as
/// failure.
pub async fn url_test(
    outbound: &dyn Outbound,
    url: &str,
    timeout: Duration,
) -> io::Result<u16> {
    let canary = CanaryUrl::parse(url)?;
    let started = Instant::now();

    let probe = async {
        let ctx = InboundContext::default();
        let destination = Endpoint::new(Host::parse(&canary.host), canary.port);
        let stream = outbound.dial(&ctx, Network::Tcp, &destination).await?;
        if canary.tls {
            Ok(())
        } else {
            head_round_trip(stream, &canary).await
        }
    };

    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(())) => Ok(elapsed_millis(started)),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "canary probe timed out",
        )),
    }
}

fn elapsed_millis(started: Instant) -> u16 {
    u16::try_from(started.elapsed().as_millis()).unwrap_or(u16::MAX)
}

/// Send a HEAD request and wait for a usable status line.
async fn head_round_trip(mut stream: IoStream, canary: &CanaryUrl) -> io::Result<()> {
    let request = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        canary.path, canary.host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut header = Vec::with_capacity(128);
    let mut chunk = [0u8; 256];
    let status = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "canary closed before a status line",
            ));
        }
        header.extend_from_slice(&chunk[..n]);
        match parse_status_line(&header) {
            StatusLine::Code(code) => break code,
            StatusLine::Malformed => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "canary response is not http",
                ));
            }
            StatusLine::Incomplete if header.len() > MAX_STATUS_LINE => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "canary status line too long",
                ));
            }
            StatusLine::Incomplete => {}
        }
    };

    // 2xx and 3xx both prove the path works; 204 is the usual reply.
    if matches!(status, 200..=399) {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("canary answered {status}"),
        ))
    }
}

enum StatusLine {
    /// No complete line buffered yet; keep reading.
    Incomplete,
    Malformed,
    Code(u16),
}

/// Pull the status code out of an `HTTP/x.y <code> ...` line once a full
/// line has arrived.
fn parse_status_line(buf: &[u8]) -> StatusLine {
    let Some(end) = buf.windows(2).position(|w| w == b"\r\n") else {
        return StatusLine::Incomplete;
    };
    let Some(rest) = buf[..end].strip_prefix(b"HTTP/".as_slice()) else {
        return StatusLine::Malformed;
    };
    let mut fields = rest.splitn(3, |b| *b == b' ');
    let _version = fields.next();
    match fields.next() {
        Some(code) if code.len() == 3 && code.iter().all(u8::is_ascii_digit) => {
            let value = code
                .iter()
                .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0'));
            StatusLine::Code(value)
        }
        _ => StatusLine::Malformed,
    }
}

/// A parsed canary endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CanaryUrl {
    host: String,
    port: u16,
    tls: bool,
    path: String,
}

impl CanaryUrl {
    fn parse(url: &str) -> io::Result<Self> {
        let (tls, rest) = match url.split_once("://") {
            Some(("http", rest)) => (false, rest),
            Some(("https", rest)) => (true, rest),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported canary url: {url}"),
                ));
            }
        };

        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], rest[slash..].to_string()),
            None => (rest, "/".to_string()),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("bad canary port: {port}"),
                    )
                })?;
                (host, port)
            }
            None => (authority, if tls { 443 } else { 80 }),
        };
        if host.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "canary url has no host",
            ));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
            path,
        })
    }
}
