use std::{io, marker::PhantomData, pin::Pin, time::Duration};

use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::warn;

use crate::ipc::{SupervisorEnvelope, WorkerEnvelope};

pub trait AsyncIo: AsyncRead + AsyncWrite {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + ?Sized {}

/// Boxed bidirectional byte stream, so the channel works the same over a
/// unix socket to a forked child and over an in-memory duplex pipe.
pub type MessageStream = Pin<Box<dyn AsyncIo + Send>>;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("ipc transport failed: {0}")]
    Transport(#[source] io::Error),
    #[error("failed to encode ipc message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("ipc channel closed before the expected message arrived")]
    ChannelClosed,
    #[error("timed out after {waited_ms}ms waiting for an ipc message")]
    WaitTimeout { waited_ms: u64 },
}

/// One direction-typed end of the supervisor↔worker channel: JSON envelopes
/// inside length-delimited frames. Frame delivery is FIFO per direction.
pub struct MessageChannel<Out, In> {
    framed: Framed<MessageStream, LengthDelimitedCodec>,
    _direction: PhantomData<fn(Out) -> In>,
}

/// The supervisor's end: sends `SupervisorEnvelope`, receives `WorkerEnvelope`.
pub type SupervisorChannel = MessageChannel<SupervisorEnvelope, WorkerEnvelope>;
/// The worker's end: sends `WorkerEnvelope`, receives `SupervisorEnvelope`.
pub type WorkerChannel = MessageChannel<WorkerEnvelope, SupervisorEnvelope>;

impl<Out, In> MessageChannel<Out, In>
where
    Out: Serialize,
    In: DeserializeOwned,
{
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self {
            framed: Framed::new(Box::pin(stream), LengthDelimitedCodec::new()),
            _direction: PhantomData,
        }
    }

    pub async fn send(&mut self, message: &Out) -> Result<(), IpcError> {
        let payload = serde_json::to_vec(message).map_err(IpcError::Encode)?;
        self.framed
            .send(Bytes::from(payload))
            .await
            .map_err(IpcError::Transport)
    }

    /// Receive the next decodable envelope. Returns `Ok(None)` once the peer
    /// has closed the channel. Frames that fail to decode (unknown message
    /// types included) are logged and skipped rather than surfaced.
    pub async fn recv(&mut self) -> Result<Option<In>, IpcError> {
        loop {
            let frame = match self.framed.next().await {
                Some(result) => result.map_err(IpcError::Transport)?,
                None => return Ok(None),
            };
            match serde_json::from_slice(&frame) {
                Ok(message) => return Ok(Some(message)),
                Err(error) => {
                    warn!(error = %error, "ignoring undecodable ipc frame");
                }
            }
        }
    }

    /// Split into an independently-owned sender and receiver so one task can
    /// drain an outbound queue while another drives the read loop.
    pub fn split(self) -> (MessageSink<Out>, MessageSource<In>) {
        let (sink, stream) = self.framed.split();
        (
            MessageSink {
                sink,
                _direction: PhantomData,
            },
            MessageSource {
                stream,
                _direction: PhantomData,
            },
        )
    }

    /// Wait for the first envelope matching `matches`, discarding earlier
    /// non-matching envelopes. Intended for boot-time handshakes where no
    /// other traffic is expected on the channel yet.
    pub async fn wait_for<F>(&mut self, timeout: Duration, mut matches: F) -> Result<In, IpcError>
    where
        F: FnMut(&In) -> bool,
    {
        let deadline = time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            match time::timeout(remaining, self.recv()).await {
                Ok(Ok(Some(message))) if matches(&message) => return Ok(message),
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) => return Err(IpcError::ChannelClosed),
                Ok(Err(error)) => return Err(error),
                Err(_) => {
                    return Err(IpcError::WaitTimeout {
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }
}

/// Write half of a split [`MessageChannel`].
pub struct MessageSink<Out> {
    sink: SplitSink<Framed<MessageStream, LengthDelimitedCodec>, Bytes>,
    _direction: PhantomData<fn(Out)>,
}

impl<Out: Serialize> MessageSink<Out> {
    pub async fn send(&mut self, message: &Out) -> Result<(), IpcError> {
        let payload = serde_json::to_vec(message).map_err(IpcError::Encode)?;
        self.sink
            .send(Bytes::from(payload))
            .await
            .map_err(IpcError::Transport)
    }
}

/// Read half of a split [`MessageChannel`].
pub struct MessageSource<In> {
    stream: SplitStream<Framed<MessageStream, LengthDelimitedCodec>>,
    _direction: PhantomData<fn() -> In>,
}

impl<In: DeserializeOwned> MessageSource<In> {
    /// Same contract as [`MessageChannel::recv`]: `Ok(None)` on close,
    /// undecodable frames logged and skipped.
    pub async fn recv(&mut self) -> Result<Option<In>, IpcError> {
        loop {
            let frame = match self.stream.next().await {
                Some(result) => result.map_err(IpcError::Transport)?,
                None => return Ok(None),
            };
            match serde_json::from_slice(&frame) {
                Ok(message) => return Ok(Some(message)),
                Err(error) => {
                    warn!(error = %error, "ignoring undecodable ipc frame");
                }
            }
        }
    }
}
