//! Live log subscription over the backend's server-sent event channel.
//!
//! The channel emits tagged events: `log` carries one JSON-encoded step
//! record, `done` signals that the deployment reached a terminal status and
//! nothing further will be sent. Anything else on the wire (comments used as
//! keep-alives, `id:`/`retry:` fields, unknown event names) is skipped.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, warn};

use crate::api::error::StreamError;
use crate::api::models::{ApiEnvelope, DeploymentLogEntry};

/// What the subscription delivers to its owner.
#[derive(Debug)]
pub enum StreamEvent {
    /// One step record, freshly created or re-emitted with a new status.
    Log(DeploymentLogEntry),
    /// The deployment finished. Always the last event of a session.
    Done,
}

/// One live subscription to a deployment's log channel.
///
/// A `LogStream` is single-use: once it reports `Done`, an error, or is
/// closed, it never yields again and a fresh connection is required to
/// observe anything further. It never retries on its own; by the time a
/// retry would fire the deployment may already be finished and a plain
/// snapshot fetch cheaper.
pub struct LogStream {
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    decoder: FrameDecoder,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("open", &self.body.is_some())
            .field("decoder", &self.decoder)
            .field("pending", &self.pending)
            .field("done", &self.done)
            .finish()
    }
}

impl LogStream {
    /// Dial the log channel for one deployment.
    ///
    /// The token rides in the query string because browser-style event
    /// sources cannot set request headers and the server reads it from
    /// there; it is also sent as a bearer header. An empty token fails
    /// before any network traffic.
    pub async fn connect(
        client: &Client,
        base_url: &str,
        token: &str,
        deployment_id: u64,
    ) -> Result<LogStream, StreamError> {
        if token.is_empty() {
            return Err(StreamError::NotAuthenticated);
        }

        let url = format!(
            "{}/api/v1/deployments/{}/logs/stream?token={}",
            base_url,
            deployment_id,
            urlencoding::encode(token)
        );
        let response = client
            .get(url)
            .bearer_auth(token)
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body)
                .map(|envelope| envelope.message)
                .unwrap_or(body);
            return Err(StreamError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(LogStream {
            body: Some(response.bytes_stream().boxed()),
            decoder: FrameDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Wait for the next event.
    ///
    /// `Ok(None)` means the session is over, either because `Done` was
    /// already delivered or because the stream was closed. A connection
    /// loss before `done` surfaces as [`StreamError::Interrupted`]; events
    /// delivered up to that point remain valid.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, StreamError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if matches!(event, StreamEvent::Done) {
                    // Terminal: anything still buffered behind it is dropped.
                    self.done = true;
                    self.shutdown();
                }
                return Ok(Some(event));
            }

            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };

            match body.next().await {
                Some(Ok(chunk)) => {
                    for frame in self.decoder.feed(&chunk) {
                        match frame.name.as_str() {
                            "log" => match serde_json::from_str::<DeploymentLogEntry>(&frame.data) {
                                Ok(entry) => self.pending.push_back(StreamEvent::Log(entry)),
                                Err(err) => warn!("Skipping malformed log event: {}", err),
                            },
                            "done" => self.pending.push_back(StreamEvent::Done),
                            other => debug!("Ignoring stream event '{}'", other),
                        }
                    }
                }
                Some(Err(err)) => {
                    self.shutdown();
                    return Err(StreamError::Transport(err));
                }
                None => {
                    self.shutdown();
                    return Err(StreamError::Interrupted);
                }
            }
        }
    }

    /// Release the subscription. Idempotent; buffered but undelivered
    /// events are discarded and `next_event` yields `None` from here on.
    pub fn close(&mut self) {
        self.shutdown();
    }

    /// Whether the network handle is still held.
    pub fn is_open(&self) -> bool {
        self.body.is_some()
    }

    /// Whether the terminal `done` signal was delivered.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn shutdown(&mut self) {
        self.body = None;
        self.pending.clear();
        self.decoder.reset();
    }
}

/// One decoded wire event: its tag and the joined data payload.
#[derive(Debug, PartialEq)]
struct Frame {
    name: String,
    data: String,
}

/// Incremental decoder for the text/event-stream framing.
///
/// Fed raw chunks as they arrive off the socket; chunk boundaries carry no
/// meaning, lines and events are reassembled here. Multi-line `data:`
/// fields join with a newline, `:` comment lines and unknown fields are
/// dropped, and a blank line dispatches the accumulated event.
#[derive(Debug, Default)]
struct FrameDecoder {
    buffer: Vec<u8>,
    event_name: String,
    data_lines: Vec<String>,
}

impl FrameDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        // Split on byte newlines before decoding text, so a multi-byte
        // character straddling two chunks survives intact.
        while let Some(newline) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            self.take_line(line.trim_end_matches(['\r', '\n']), &mut frames);
        }
        frames
    }

    fn take_line(&mut self, line: &str, frames: &mut Vec<Frame>) {
        if line.is_empty() {
            if self.event_name.is_empty() && self.data_lines.is_empty() {
                return;
            }
            let name = if self.event_name.is_empty() {
                "message".to_string()
            } else {
                std::mem::take(&mut self.event_name)
            };
            frames.push(Frame {
                name,
                data: self.data_lines.join("\n"),
            });
            self.event_name.clear();
            self.data_lines.clear();
            return;
        }

        if line.starts_with(':') {
            // Keep-alive comment.
            return;
        }

        let (field, value) = match line.find(':') {
            Some(position) => {
                let value = &line[position + 1..];
                (&line[..position], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event_name = value.to_string(),
            "data" => self.data_lines.push(value.to_string()),
            // id and retry have no meaning for this client.
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.event_name.clear();
        self.data_lines.clear();
    }
}
