//! Subscriber side of the snapshot feed: a line-framed TCP subscriber that
//! reconnects on its own, and an in-process channel for tests and embedding.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Where to subscribe. The variable names match the ZeroMQ collector this
/// replaces, but the endpoint must speak the line-framed TCP protocol of
/// [`TcpSubscriber`]; a ZeroMQ PUB socket cannot be consumed directly.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub endpoint: String,
    pub topic: String,
}

impl FeedConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("ZMQ_ADDR")
                .unwrap_or_else(|_| "tcp://127.0.0.1:5555".to_string()),
            topic: std::env::var("ZMQ_TOPIC").unwrap_or_default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint `{0}`, expected tcp://host:port")]
    InvalidEndpoint(String),
    #[error("could not reach {endpoint} after {attempts} attempts: {source}")]
    Unreachable {
        endpoint: String,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Subscriber: Send {
    // Must be cancel safe: dropping the future loses no message already read.
    async fn recv(&mut self) -> Result<Option<Message>, TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Split a wire line into topic and payload. A line starting with `{` is a
/// bare payload published without a topic.
pub fn parse_frame(line: &str) -> Message {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.starts_with('{') {
        return Message::new("", line);
    }
    match line.split_once(' ') {
        Some((topic, payload)) => Message::new(topic, payload.trim_start()),
        None => Message::new(line, Vec::new()),
    }
}

pub fn parse_endpoint(endpoint: &str) -> Result<String, TransportError> {
    let invalid = || TransportError::InvalidEndpoint(endpoint.to_string());
    let addr = endpoint.strip_prefix("tcp://").ok_or_else(invalid)?;
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    let host = if host == "*" { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

pub struct TcpSubscriber {
    endpoint: String,
    addr: String,
    topic: String,
    backoff: BackoffPolicy,
    max_frame_length: usize,
    frames: Option<FramedRead<TcpStream, FrameCodec>>,
    failures: usize,
}

enum Frame {
    Line(String),
    Oversized,
}

/// `LinesCodec` that reports an overlong line as a frame to skip. The inner
/// codec discards the rest of that line, so the stream stays usable.
struct FrameCodec {
    lines: LinesCodec,
}

impl FrameCodec {
    fn new(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn frame(
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Frame>, LinesCodecError> {
        match decoded {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
            Err(err) => Err(err),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        Self::frame(self.lines.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        Self::frame(self.lines.decode_eof(src))
    }
}

impl TcpSubscriber {
    pub fn new(endpoint: &str, topic: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self {
            endpoint: endpoint.to_string(),
            addr: parse_endpoint(endpoint)?,
            topic: topic.into(),
            backoff: BackoffPolicy::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            frames: None,
            failures: 0,
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        loop {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    debug!(endpoint = %self.endpoint, topic = %self.topic, "subscribed");
                    let codec = FrameCodec::new(self.max_frame_length);
                    self.frames = Some(FramedRead::new(stream, codec));
                    self.failures = 0;
                    return Ok(());
                }
                Err(source) => {
                    self.failures += 1;
                    if self.failures > self.backoff.max_retries {
                        let attempts = self.failures;
                        self.failures = 0;
                        return Err(TransportError::Unreachable {
                            endpoint: self.endpoint.clone(),
                            attempts,
                            source,
                        });
                    }
                    let delay = self.backoff.delay_for_attempt(self.failures - 1);
                    debug!(
                        endpoint = %self.endpoint,
                        error = %source,
                        ?delay,
                        "connect failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl Subscriber for TcpSubscriber {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            let Some(frames) = self.frames.as_mut() else {
                self.connect().await?;
                continue;
            };

            match frames.next().await {
                Some(Ok(Frame::Line(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message = parse_frame(&line);
                    if message.topic.starts_with(&self.topic) {
                        return Ok(Some(message));
                    }
                }
                Some(Ok(Frame::Oversized)) => {
                    warn!(
                        endpoint = %self.endpoint,
                        max = self.max_frame_length,
                        "skipping oversized frame"
                    );
                }
                Some(Err(err)) => {
                    warn!(endpoint = %self.endpoint, error = %err, "read failed, reconnecting");
                    self.frames = None;
                }
                None => {
                    warn!(endpoint = %self.endpoint, "publisher closed the connection");
                    self.frames = None;
                }
            }
        }
    }
}

pub struct ChannelSubscriber {
    rx: mpsc::Receiver<Message>,
    topic: String,
}

pub fn channel(
    buffer: usize,
    topic: impl Into<String>,
) -> (mpsc::Sender<Message>, ChannelSubscriber) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        tx,
        ChannelSubscriber {
            rx,
            topic: topic.into(),
        },
    )
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        while let Some(message) = self.rx.recv().await {
            if message.topic.starts_with(&self.topic) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}
