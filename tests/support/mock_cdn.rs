//! Mock CDN responders for transfer tests.
//!
//! Each responder records the `Range` header of every request it answers so
//! tests can assert how a transfer resumed or restarted. `StallingServer`
//! speaks raw HTTP/1.1 for bodies wiremock cannot cut off mid-stream.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::{Request, Respond, ResponseTemplate};

/// Lowercase hex SHA-1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Deterministic, non-repeating-looking test content.
pub fn sample_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Range headers seen by a responder, in request order.
#[derive(Clone, Default)]
pub struct RangeLog(Arc<Mutex<Vec<Option<String>>>>);

impl RangeLog {
    pub fn record(&self, request: &Request) -> Option<u64> {
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.push(range)
    }

    fn push(&self, range: Option<String>) -> Option<u64> {
        let offset = range.as_deref().and_then(parse_range_start);
        self.0.lock().expect("range log poisoned").push(range);
        offset
    }

    pub fn ranges(&self) -> Vec<Option<String>> {
        self.0.lock().expect("range log poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().expect("range log poisoned").len()
    }
}

fn parse_range_start(header: &str) -> Option<u64> {
    header.strip_prefix("bytes=")?.strip_suffix('-')?.parse().ok()
}

/// Serves `content`, honoring `bytes=N-` ranges with 206 and 416.
pub struct RangedFile {
    pub content: Vec<u8>,
    pub log: RangeLog,
}

impl RangedFile {
    pub fn new(content: Vec<u8>) -> (Self, RangeLog) {
        let log = RangeLog::default();
        (
            Self {
                content,
                log: log.clone(),
            },
            log,
        )
    }
}

impl Respond for RangedFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.content.len();
        match self.log.record(request) {
            None => ResponseTemplate::new(200).set_body_bytes(self.content.clone()),
            Some(start) => {
                let start = usize::try_from(start).unwrap_or(usize::MAX);
                if start >= len {
                    ResponseTemplate::new(416)
                        .insert_header("content-range", format!("bytes */{len}").as_str())
                } else {
                    ResponseTemplate::new(206)
                        .insert_header(
                            "content-range",
                            format!("bytes {start}-{}/{len}", len - 1).as_str(),
                        )
                        .set_body_bytes(self.content[start..].to_vec())
                }
            }
        }
    }
}

/// Answers with the n-th template for the n-th request, repeating the last one.
pub struct Sequence {
    pub responses: Vec<ResponseTemplate>,
    pub calls: AtomicUsize,
    pub log: RangeLog,
}

impl Sequence {
    pub fn new(responses: Vec<ResponseTemplate>) -> (Self, RangeLog) {
        let log = RangeLog::default();
        (
            Self {
                responses,
                calls: AtomicUsize::new(0),
                log: log.clone(),
            },
            log,
        )
    }
}

impl Respond for Sequence {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.log.record(request);
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = call.min(self.responses.len().saturating_sub(1));
        self.responses[index].clone()
    }
}

/// A 200 response carrying `body`, held back for `delay`.
pub fn delayed(body: &[u8], delay: Duration) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_bytes(body.to_vec())
        .set_delay(delay)
}

/// Serves `content` over plain TCP, stalling the first full-body response.
///
/// A request without `Range` is told the whole length but receives only
/// `stall_after` bytes before the connection goes silent. `bytes=N-` requests
/// get the rest with 206.
pub struct StallingServer {
    addr: SocketAddr,
    log: RangeLog,
}

impl StallingServer {
    pub async fn start(content: Vec<u8>, stall_after: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind a local port");
        let addr = listener.local_addr().expect("listener has an address");
        let log = RangeLog::default();
        let content = Arc::new(content);

        let accept_log = log.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let content = Arc::clone(&content);
                let log = accept_log.clone();
                tokio::spawn(async move {
                    let _ = serve_stalling(socket, &content, stall_after, &log).await;
                });
            }
        });

        Self { addr, log }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn ranges(&self) -> Vec<Option<String>> {
        self.log.ranges()
    }
}

async fn serve_stalling(
    mut socket: TcpStream,
    content: &[u8],
    stall_after: usize,
    log: &RangeLog,
) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = socket.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..read]);
    }
    let range = String::from_utf8_lossy(&head).lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("range")
            .then(|| value.trim().to_string())
    });

    let len = content.len();
    match log.push(range) {
        None => {
            let header = format!("HTTP/1.1 200 OK\r\ncontent-length: {len}\r\n\r\n");
            socket.write_all(header.as_bytes()).await?;
            socket.write_all(&content[..stall_after.min(len)]).await?;
            socket.flush().await?;
            // Hold the connection open without sending the rest.
            std::future::pending::<()>().await;
            Ok(())
        }
        Some(start) => {
            let start = usize::try_from(start).unwrap_or(len).min(len);
            let header = format!(
                "HTTP/1.1 206 Partial Content\r\ncontent-range: bytes {start}-{}/{len}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                len.saturating_sub(1),
                len - start
            );
            socket.write_all(header.as_bytes()).await?;
            socket.write_all(&content[start..]).await?;
            socket.flush().await
        }
    }
}
