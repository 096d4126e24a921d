//! Resumable, verified transfer of a single file.
//!
//! [`TransferClient::transfer`] returns a controllable [`Operation`] driven by
//! one task that exclusively owns the response stream and the file writer.
//!
//! # Protocol
//!
//! 1. If the destination already holds bytes, request `Range: bytes={size}-`
//!    and append; otherwise create/truncate it. Parent directories are created.
//! 2. When resuming and the partial file already has the expected size, skip
//!    straight to verification.
//! 3. `416` on a ranged request deletes the file and restarts without a range.
//!    Any status other than 200/206 fails. A ranged request must be answered
//!    with 206.
//! 4. Each chunk is reported as [`TransferProgress`].
//! 5. After the last chunk is flushed the transfer is no longer cancelable.
//!    The size must match (fatal otherwise); a wrong digest deletes the file
//!    and restarts from scratch, at most `max_retry` times.
//! 6. Allow-listed network failures and attempt timeouts restart the attempt
//!    from the on-disk size with a longer timeout, at most `max_retry` times.
//!
//! Pausing flushes and closes the file and keeps it; resuming re-derives the
//! range from its size. Canceling deletes it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::RANGE;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::client::TransferClient;
use super::constants::WRITE_BUFFER_CAPACITY;
use super::error::TransferError;
use super::hash::{HashAlgorithm, file_digest};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use crate::operation::{
    ControlError, ControlHandler, Operation, OperationBuilder, OperationContext, OperationError,
};

/// A running transfer.
pub type TransferOperation = Operation<TransferReport, TransferError, TransferProgress>;

/// What to fetch and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Source URL.
    pub url: String,
    /// Destination file.
    pub destination: PathBuf,
    /// Expected digest, lowercase hex.
    pub expected_hash: String,
    /// Expected size in bytes.
    pub expected_size: u64,
    /// Check the digest once the body is on disk.
    pub verify_hash: bool,
    /// Check the size once the body is on disk.
    pub verify_size: bool,
}

impl TransferRequest {
    /// Creates a request with both verifications enabled.
    pub fn new(
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        expected_hash: impl Into<String>,
        expected_size: u64,
    ) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            expected_hash: expected_hash.into(),
            expected_size,
            verify_hash: true,
            verify_size: true,
        }
    }

    /// Enables or disables digest verification.
    #[must_use]
    pub fn with_verify_hash(mut self, verify: bool) -> Self {
        self.verify_hash = verify;
        self
    }

    /// Enables or disables size verification.
    #[must_use]
    pub fn with_verify_size(mut self, verify: bool) -> Self {
        self.verify_size = verify;
        self
    }
}

/// Progress of the current attempt, reported once per received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes in this chunk.
    pub chunk_size: u64,
    /// Bytes received by the current attempt so far.
    pub downloaded_size: u64,
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Destination file.
    pub path: PathBuf,
    /// Final size on disk.
    pub size: u64,
    /// Whether any attempt continued a partial file.
    pub resumed: bool,
    /// Restarts after transient failures.
    pub retries: u32,
    /// Fresh restarts after a hash mismatch.
    pub restarts: u32,
}

impl TransferClient {
    /// Starts transferring `request`.
    ///
    /// Verification runs only when both the request and the client options
    /// enable it. Must be called from within a tokio runtime.
    pub fn transfer(&self, request: TransferRequest) -> TransferOperation {
        let options = self.options();
        let request = TransferRequest {
            verify_hash: request.verify_hash && options.verify_hash,
            verify_size: request.verify_size && options.verify_size,
            ..request
        };
        debug!(url = %request.url, path = %request.destination.display(), "transfer queued for start");

        let (commands, inbox) = mpsc::unbounded_channel();
        let builder = OperationBuilder::new()
            .on_pause(command_handler(commands.clone(), DriverCommand::Pause, None))
            .on_resume(command_handler(commands.clone(), DriverCommand::Resume, None))
            .on_cancel(command_handler(
                commands,
                DriverCommand::Cancel,
                Some(request.destination.clone()),
            ));

        let http = self.inner().clone();
        let policy = options.retry_policy();
        let algorithm = options.hash_algorithm;
        builder.spawn(move |context| {
            Driver {
                http,
                request,
                policy,
                algorithm,
                context,
                commands: inbox,
                phase: Phase::Idle,
                paused: false,
                cancelable: true,
                resuming: false,
                attempt: 0,
                retries: 0,
                restarts: 0,
                resumed: false,
            }
            .run()
        })
    }

    /// Returns a factory that starts `request` when called, for use with the scheduler.
    pub fn factory(
        &self,
        request: TransferRequest,
    ) -> impl FnOnce() -> TransferOperation + Send + 'static {
        let client = self.clone();
        move || client.transfer(request)
    }
}

type Ack = oneshot::Sender<Result<(), ControlError<TransferError>>>;

enum DriverCommand {
    Pause(Ack),
    Resume(Ack),
    Cancel(Ack),
}

/// Forwards a control call to the driver and waits for its answer.
///
/// Once the driver has finished there is nothing left to pause or resume;
/// a cancel is past the point of no return and names `verified`.
fn command_handler(
    commands: mpsc::UnboundedSender<DriverCommand>,
    command: fn(Ack) -> DriverCommand,
    verified: Option<PathBuf>,
) -> impl ControlHandler<TransferError> + 'static {
    move || {
        let commands = commands.clone();
        let verified = verified.clone();
        async move {
            let (ack, reply) = oneshot::channel();
            let _ = commands.send(command(ack));
            if let Ok(outcome) = reply.await {
                return outcome;
            }
            match verified {
                Some(path) => Err(ControlError::rejected(
                    TransferError::no_longer_cancellable(path),
                )),
                None => Ok(()),
            }
        }
    }
}

enum Phase {
    Idle,
    Connecting {
        response: BoxFuture<'static, reqwest::Result<reqwest::Response>>,
        deadline: Instant,
        timeout: Duration,
    },
    Streaming {
        body: BoxStream<'static, reqwest::Result<Bytes>>,
        writer: BufWriter<File>,
        downloaded: u64,
        timeout: Duration,
    },
    Verifying {
        digest: BoxFuture<'static, Option<String>>,
        size: u64,
    },
    Paused,
}

enum Event {
    Command(Option<DriverCommand>),
    Response(reqwest::Result<reqwest::Response>),
    Chunk(Option<reqwest::Result<Bytes>>),
    TimedOut(Duration),
    Digest(Option<String>),
}

impl Phase {
    /// Cancel-safe: every in-progress future lives in the phase itself.
    async fn next_event(&mut self) -> Event {
        match self {
            Self::Connecting {
                response,
                deadline,
                timeout,
            } => tokio::select! {
                result = response => Event::Response(result),
                () = tokio::time::sleep_until(*deadline) => Event::TimedOut(*timeout),
            },
            Self::Streaming { body, timeout, .. } => {
                match tokio::time::timeout(*timeout, body.next()).await {
                    Ok(chunk) => Event::Chunk(chunk),
                    Err(_) => Event::TimedOut(*timeout),
                }
            }
            Self::Verifying { digest, .. } => Event::Digest(digest.await),
            Self::Idle | Self::Paused => std::future::pending().await,
        }
    }
}

enum Flow {
    Continue,
    Done(TransferReport),
}

struct Driver {
    http: reqwest::Client,
    request: TransferRequest,
    policy: RetryPolicy,
    algorithm: HashAlgorithm,
    context: OperationContext<TransferError, TransferProgress>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    phase: Phase,
    paused: bool,
    cancelable: bool,
    /// The current attempt sent a `Range` header.
    resuming: bool,
    /// 0-indexed attempt within the current retry chain.
    attempt: u32,
    retries: u32,
    restarts: u32,
    resumed: bool,
}

impl Driver {
    #[instrument(skip(self), fields(url = %self.request.url, path = %self.request.destination.display()))]
    async fn run(mut self) -> Result<TransferReport, OperationError<TransferError>> {
        if Url::parse(&self.request.url).is_err() {
            return Err(TransferError::invalid_url(&self.request.url).into());
        }
        self.begin_attempt().await?;

        loop {
            let event = tokio::select! {
                biased;
                command = self.commands.recv() => Event::Command(command),
                event = self.phase.next_event() => event,
            };

            let flow = match event {
                Event::Command(Some(command)) => self.on_command(command).await?,
                Event::Command(None) => return Err(OperationError::Aborted),
                Event::Response(result) => self.on_response(result).await?,
                Event::Chunk(chunk) => self.on_chunk(chunk).await?,
                Event::TimedOut(timeout) => {
                    self.close_streams_logged().await;
                    let error = TransferError::timeout(&self.request.url, timeout);
                    self.retry_or_fail(error).await?
                }
                Event::Digest(digest) => self.on_digest(digest).await?,
            };

            if let Flow::Done(report) = flow {
                info!(
                    size = report.size,
                    resumed = report.resumed,
                    retries = report.retries,
                    restarts = report.restarts,
                    "transfer complete"
                );
                return Ok(report);
            }
        }
    }

    async fn begin_attempt(&mut self) -> Result<(), TransferError> {
        let path = self.request.destination.as_path();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| TransferError::io(parent, source))?;
        }

        let offset = on_disk_size(path).await;
        let timeout = self.policy.timeout_for(self.attempt);
        let mut request = self.http.get(&self.request.url);
        self.resuming = offset > 0;
        if self.resuming {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        debug!(
            offset,
            attempt = self.attempt,
            timeout_ms = timeout.as_millis(),
            "starting attempt"
        );

        self.cancelable = true;
        self.phase = Phase::Connecting {
            response: Box::pin(request.send()),
            deadline: Instant::now() + timeout,
            timeout,
        };
        Ok(())
    }

    async fn on_response(
        &mut self,
        result: reqwest::Result<reqwest::Response>,
    ) -> Result<Flow, TransferError> {
        self.phase = Phase::Idle;
        let response = match result {
            Ok(response) => response,
            Err(source) => {
                let error = if source.is_timeout() {
                    TransferError::timeout(&self.request.url, self.policy.timeout_for(self.attempt))
                } else {
                    TransferError::network(&self.request.url, source)
                };
                return self.retry_or_fail(error).await;
            }
        };

        let path = self.request.destination.clone();
        if self.resuming && on_disk_size(&path).await == self.request.expected_size {
            debug!("partial file already has the expected size");
            return self.begin_verification().await;
        }

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && self.resuming {
            warn!("range not satisfiable, restarting from scratch");
            remove_partial(&path).await?;
            self.attempt = 0;
            self.begin_attempt().await?;
            return Ok(Flow::Continue);
        }
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::http_status(&self.request.url, status.as_u16()));
        }
        if self.resuming && status != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::range_not_supported(&self.request.url));
        }

        let file = open_destination(&path, self.resuming).await?;
        self.resumed |= self.resuming;
        self.phase = Phase::Streaming {
            body: Box::pin(response.bytes_stream()),
            writer: BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file),
            downloaded: 0,
            timeout: self.policy.timeout_for(self.attempt),
        };
        Ok(Flow::Continue)
    }

    async fn on_chunk(&mut self, chunk: Option<reqwest::Result<Bytes>>) -> Result<Flow, TransferError> {
        match chunk {
            Some(Ok(bytes)) => {
                let Phase::Streaming {
                    writer, downloaded, ..
                } = &mut self.phase
                else {
                    return Ok(Flow::Continue);
                };
                writer
                    .write_all(&bytes)
                    .await
                    .map_err(|source| TransferError::io(&self.request.destination, source))?;
                *downloaded += bytes.len() as u64;
                let progress = TransferProgress {
                    chunk_size: bytes.len() as u64,
                    downloaded_size: *downloaded,
                };
                self.context.progress(&progress);
                Ok(Flow::Continue)
            }
            Some(Err(source)) => {
                self.close_streams_logged().await;
                let error = TransferError::network(&self.request.url, source);
                self.retry_or_fail(error).await
            }
            None => {
                self.close_streams().await?;
                self.begin_verification().await
            }
        }
    }

    async fn begin_verification(&mut self) -> Result<Flow, TransferError> {
        self.cancelable = false;
        self.phase = Phase::Idle;

        let path = self.request.destination.clone();
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|source| TransferError::io(&path, source))?
            .len();
        if self.request.verify_size && size != self.request.expected_size {
            return Err(TransferError::size_mismatch(
                path,
                self.request.expected_size,
                size,
            ));
        }
        if !self.request.verify_hash {
            return Ok(Flow::Done(self.report(size)));
        }

        let algorithm = self.algorithm;
        debug!(size, ?algorithm, "verifying digest");
        self.phase = Phase::Verifying {
            digest: Box::pin(async move { file_digest(&path, algorithm).await }),
            size,
        };
        Ok(Flow::Continue)
    }

    async fn on_digest(&mut self, digest: Option<String>) -> Result<Flow, TransferError> {
        let Phase::Verifying { size, .. } = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return Ok(Flow::Continue);
        };
        let path = self.request.destination.clone();
        let Some(actual) = digest else {
            return Err(TransferError::unreadable_file(path));
        };
        if actual.eq_ignore_ascii_case(&self.request.expected_hash) {
            return Ok(Flow::Done(self.report(size)));
        }
        if self.restarts >= self.policy.max_retry() {
            return Err(TransferError::hash_mismatch(
                path,
                self.request.expected_hash.clone(),
                actual,
            ));
        }

        self.restarts += 1;
        warn!(
            expected = %self.request.expected_hash,
            actual = %actual,
            restart = self.restarts,
            "hash mismatch, restarting from scratch"
        );
        remove_partial(&path).await?;
        self.attempt = 0;
        if self.paused {
            self.cancelable = true;
            self.phase = Phase::Paused;
        } else {
            self.begin_attempt().await?;
        }
        Ok(Flow::Continue)
    }

    async fn on_command(
        &mut self,
        command: DriverCommand,
    ) -> Result<Flow, OperationError<TransferError>> {
        match command {
            DriverCommand::Pause(ack) => {
                self.paused = true;
                if matches!(
                    self.phase,
                    Phase::Connecting { .. } | Phase::Streaming { .. }
                ) {
                    self.close_streams_logged().await;
                    self.phase = Phase::Paused;
                }
                debug!("transfer paused");
                let _ = ack.send(Ok(()));
            }
            DriverCommand::Resume(ack) => {
                if matches!(self.phase, Phase::Paused) {
                    self.attempt = 0;
                    if let Err(error) = self.begin_attempt().await {
                        self.phase = Phase::Paused;
                        let _ = ack.send(Err(ControlError::rejected(error)));
                        return Ok(Flow::Continue);
                    }
                }
                self.paused = false;
                debug!("transfer resumed");
                let _ = ack.send(Ok(()));
            }
            DriverCommand::Cancel(ack) => {
                if !self.cancelable {
                    let error = TransferError::no_longer_cancellable(&self.request.destination);
                    let _ = ack.send(Err(ControlError::rejected(error)));
                    return Ok(Flow::Continue);
                }
                self.close_streams_logged().await;
                if let Err(error) = remove_partial(&self.request.destination).await {
                    warn!(%error, "could not delete canceled transfer's file");
                }
                debug!("transfer canceled");
                let _ = ack.send(Ok(()));
                return Err(OperationError::Canceled);
            }
        }
        Ok(Flow::Continue)
    }

    async fn retry_or_fail(&mut self, error: TransferError) -> Result<Flow, TransferError> {
        let failure = classify_error(&error);
        match self.policy.should_retry(failure, self.attempt) {
            RetryDecision::Retry { attempt, timeout } => {
                warn!(
                    attempt,
                    timeout_ms = timeout.as_millis(),
                    error = %error,
                    "transient failure, retrying"
                );
                self.attempt = attempt;
                self.retries += 1;
                self.begin_attempt().await?;
                Ok(Flow::Continue)
            }
            RetryDecision::DoNotRetry { reason } if failure == FailureType::Transient => {
                debug!(%reason, "giving up");
                Err(TransferError::retries_exhausted(
                    &self.request.url,
                    self.attempt,
                    error,
                ))
            }
            RetryDecision::DoNotRetry { .. } => Err(error),
        }
    }

    /// Drops the response and flushes and closes the file, if any.
    async fn close_streams(&mut self) -> Result<(), TransferError> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Streaming { mut writer, .. } => writer
                .flush()
                .await
                .map_err(|source| TransferError::io(&self.request.destination, source)),
            _ => Ok(()),
        }
    }

    /// Like `close_streams`; the partial file only needs to be a prefix, so a
    /// failed flush is logged and otherwise ignored.
    async fn close_streams_logged(&mut self) {
        if let Err(error) = self.close_streams().await {
            warn!(%error, "flush failed, partial file may be short");
        }
    }

    fn report(&self, size: u64) -> TransferReport {
        TransferReport {
            path: self.request.destination.clone(),
            size,
            resumed: self.resumed,
            retries: self.retries,
            restarts: self.restarts,
        }
    }
}

async fn on_disk_size(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0)
}

async fn open_destination(path: &Path, append: bool) -> Result<File, TransferError> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options
        .open(path)
        .await
        .map_err(|source| TransferError::io(path, source))
}

/// Deletes `path`; a missing file is not an error.
async fn remove_partial(path: &Path) -> Result<(), TransferError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(TransferError::io(path, error)),
    }
}
