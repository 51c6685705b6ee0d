//! Real-time transcoding through an external process.
//!
//! The transcoder reads the source (a path, or stdin fed from a
//! [`PieceProvider`]) and writes fragmented MP4 to stdout, which is streamed
//! to the client as it is produced. The body pulls from stdout only as fast
//! as the client consumes, so a slow client blocks the transcoder on its own
//! output pipe.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::stream;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use super::traits::{PieceProvider, PieceProviderError};
use super::{StreamingError, StreamingResult};
use crate::config::{TRANSCODE_INPUT_PLACEHOLDER, TranscodeConfig};

/// Retry delay when pieces are not yet available.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Attempts before the input pump gives up on a missing piece.
const MAX_NOT_READY_RETRIES: u32 = 300; // 30s at 100ms

/// Where the transcoder reads its input from.
pub enum TranscodeInput {
    /// A complete file the transcoder opens itself
    File(PathBuf),
    /// Partially downloaded data pumped into stdin
    Provider(Arc<dyn PieceProvider>),
}

impl TranscodeInput {
    fn argument(&self) -> String {
        match self {
            TranscodeInput::File(path) => path.to_string_lossy().into_owned(),
            TranscodeInput::Provider(_) => "pipe:0".to_string(),
        }
    }
}

/// Expands the argument template for `input`.
pub fn build_transcoder_args(config: &TranscodeConfig, input: &TranscodeInput) -> Vec<String> {
    let input_arg = input.argument();
    config
        .args
        .iter()
        .map(|arg| arg.replace(TRANSCODE_INPUT_PLACEHOLDER, &input_arg))
        .collect()
}

/// Spawns the transcoder and returns a response streaming its stdout.
///
/// # Errors
///
/// - `StreamingError::TranscoderFailure` - Process could not be spawned or its pipes are missing
pub fn transcode_response(
    config: &TranscodeConfig,
    input: TranscodeInput,
) -> StreamingResult<Response> {
    let args = build_transcoder_args(config, &input);
    let feeds_stdin = matches!(input, TranscodeInput::Provider(_));

    info!(program = %config.program, ?args, "Starting transcoder");

    let mut child = Command::new(&config.program)
        .args(&args)
        .stdin(if feeds_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StreamingError::TranscoderFailure {
            reason: format!("failed to spawn {}: {e}", config.program),
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| StreamingError::TranscoderFailure {
            reason: "transcoder stdout unavailable".to_string(),
        })?;

    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_reader(stderr);
    }

    // Dropping the body cancels the pump along with the process
    let cancel = CancellationToken::new();
    if let TranscodeInput::Provider(provider) = input {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StreamingError::TranscoderFailure {
                reason: "transcoder stdin unavailable".to_string(),
            })?;
        let pump = InputPump {
            provider,
            chunk_size: config.chunk_size,
            retry_delay: RETRY_DELAY,
            max_retries: MAX_NOT_READY_RETRIES,
        };
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let exit = pump.run(stdin, cancel).await;
            debug!(?exit, "Input pump stopped");
        });
    }

    let body = Body::from_stream(output_stream(
        child,
        stdout,
        config.chunk_size,
        cancel.drop_guard(),
    ));

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, config.output_content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

enum OutputState {
    Reading {
        child: Child,
        stdout: ChildStdout,
        chunk_size: usize,
        _pump: DropGuard,
    },
    Finished,
}

/// Streams stdout until EOF, then surfaces a non-zero exit as an error.
///
/// No Content-Length is set, so the body goes out with chunked framing.
/// Dropping the stream (client gone) kills the process and stops the pump.
fn output_stream(
    child: Child,
    stdout: ChildStdout,
    chunk_size: usize,
    pump: DropGuard,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    let state = OutputState::Reading {
        child,
        stdout,
        chunk_size,
        _pump: pump,
    };

    stream::unfold(state, |state| async move {
        let OutputState::Reading {
            mut child,
            mut stdout,
            chunk_size,
            _pump,
        } = state
        else {
            return None;
        };

        let mut buffer = BytesMut::zeroed(chunk_size);
        match stdout.read(&mut buffer).await {
            Ok(0) => match child.wait().await {
                Ok(status) if status.success() => {
                    debug!("Transcoder finished");
                    None
                }
                Ok(status) => Some((Err(exit_error(status)), OutputState::Finished)),
                Err(e) => {
                    error!("Failed to wait for transcoder: {e}");
                    Some((Err(e), OutputState::Finished))
                }
            },
            Ok(n) => {
                buffer.truncate(n);
                Some((
                    Ok(buffer.freeze()),
                    OutputState::Reading {
                        child,
                        stdout,
                        chunk_size,
                        _pump,
                    },
                ))
            }
            Err(e) => {
                error!("Transcoder pipe read failed: {e}");
                Some((Err(e), OutputState::Finished))
            }
        }
    })
}

fn exit_error(status: ExitStatus) -> std::io::Error {
    warn!("Transcoder exited with status: {status}");
    std::io::Error::other(format!("transcoder exited with {status}"))
}

/// Why the input pump stopped.
#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    /// Every byte was written
    Fed(u64),
    /// The response was dropped
    Cancelled,
    /// The transcoder stopped reading
    OutputClosed,
    /// A piece stayed missing past the retry limit
    SourceUnavailable { offset: u64 },
    /// The provider failed
    SourceFailed,
}

/// Feeds provider bytes into the transcoder's stdin, waiting out missing pieces.
struct InputPump {
    provider: Arc<dyn PieceProvider>,
    chunk_size: usize,
    retry_delay: Duration,
    max_retries: u32,
}

impl InputPump {
    async fn run<W>(self, mut output: W, cancel: CancellationToken) -> PumpExit
    where
        W: AsyncWrite + Unpin,
    {
        let file_size = self.provider.size().await;
        let chunk_size = self.chunk_size.max(1) as u64;
        let mut offset = 0u64;
        let mut retries = 0u32;

        while offset < file_size {
            let length = (file_size - offset).min(chunk_size) as usize;

            let read = tokio::select! {
                _ = cancel.cancelled() => return PumpExit::Cancelled,
                read = self.provider.read_at(offset, length) => read,
            };

            match read {
                Ok(bytes) if bytes.is_empty() => break,
                Ok(bytes) => {
                    let written = tokio::select! {
                        _ = cancel.cancelled() => return PumpExit::Cancelled,
                        written = output.write_all(&bytes) => written,
                    };
                    if let Err(e) = written {
                        debug!("Transcoder stdin closed: {e}");
                        return PumpExit::OutputClosed;
                    }
                    offset += bytes.len() as u64;
                    retries = 0;
                }
                Err(PieceProviderError::NotYetAvailable) if retries < self.max_retries => {
                    retries += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return PumpExit::Cancelled,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                Err(PieceProviderError::NotYetAvailable) => {
                    warn!(offset, retries, "Gave up waiting for piece data");
                    return PumpExit::SourceUnavailable { offset };
                }
                Err(e) => {
                    error!("Fatal error reading from piece provider: {e}");
                    return PumpExit::SourceFailed;
                }
            }
        }

        PumpExit::Fed(offset)
    }
}

/// Drains stderr so the transcoder never blocks on it.
fn spawn_stderr_reader(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                warn!("Transcoder stderr: {}", line.trim());
            }
        }
    });
}
