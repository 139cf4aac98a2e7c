//! Transport layer - framed message exchange over a byte stream
//!
//! [`StdioTransport`] wraps any reader/writer pair with the NDJSON codec. A
//! background task pulls messages off the read side into a bounded queue so
//! the pace of the consumer is decoupled from the pace of the stream; the
//! queue's capacity is the only backpressure applied to the producer.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::io::framing::{FramingError, NdjsonCodec};
use crate::rpc::message::JsonRpcMessage;

/// Default capacity of the inbound message queue
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// Core transport trait for bidirectional message exchange
///
/// All methods take `&self`: one dispatcher receives while any number of
/// callers send concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Serialize and write one message, flushing immediately
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError>;

    /// Wait for the next message
    ///
    /// Returns `Ok(None)` once the stream has ended or the transport was
    /// closed, and [`TransportError::Timeout`] when `timeout` elapses first.
    async fn receive(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<JsonRpcMessage>, TransportError>;

    /// Close the transport; idempotent
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the transport has been closed. End-of-stream on the read
    /// side alone leaves the write side open.
    fn is_closed(&self) -> bool;
}

/// Error types for transports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("No message received within {0:?}")]
    Timeout(Duration),
}

impl From<FramingError> for TransportError {
    fn from(error: FramingError) -> Self {
        match error {
            FramingError::Io(e) => TransportError::Io(e),
            FramingError::Serialize(e) => TransportError::Serialize(e),
        }
    }
}

/// Item pushed by the read task
#[derive(Debug)]
enum ReadEvent {
    Message(JsonRpcMessage),
    EndOfStream,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// NDJSON transport over an arbitrary duplex byte stream
pub struct StdioTransport {
    /// Framed write half; `None` once closed
    writer: Mutex<Option<FramedWrite<BoxedWriter, NdjsonCodec>>>,

    /// Messages parsed by the read task
    inbound: Mutex<mpsc::Receiver<ReadEvent>>,

    /// Set by close or write failure
    closed: AtomicBool,

    /// Set once the read side reported end-of-stream; the write side stays usable
    read_ended: AtomicBool,

    /// Stops the read task and wakes blocked receivers
    shutdown: CancellationToken,
}

impl StdioTransport {
    /// Create a transport with the default queue capacity
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_capacity(reader, writer, DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a transport whose inbound queue holds at most `capacity` messages
    pub fn with_capacity<R, W>(reader: R, writer: W, capacity: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::reader_task(reader, sender, shutdown.clone()));

        let writer: BoxedWriter = Box::new(writer);
        Self {
            writer: Mutex::new(Some(FramedWrite::new(writer, NdjsonCodec::new()))),
            inbound: Mutex::new(receiver),
            closed: AtomicBool::new(false),
            read_ended: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Background task that parses the read side into the inbound queue
    async fn reader_task<R>(
        reader: R,
        sender: mpsc::Sender<ReadEvent>,
        shutdown: CancellationToken,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut framed = FramedRead::new(reader, NdjsonCodec::new());

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    trace!("StdioTransport: reader task cancelled");
                    return;
                }
                next = framed.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    let delivered = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        sent = sender.send(ReadEvent::Message(message)) => sent.is_ok(),
                    };
                    if !delivered {
                        trace!("StdioTransport: receiver dropped, stopping reader");
                        return;
                    }
                }
                Some(Err(e)) => {
                    error!("StdioTransport: Failed to read from stream: {}", e);
                    break;
                }
                None => {
                    debug!("StdioTransport: reached end of stream");
                    break;
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sender.send(ReadEvent::EndOfStream) => {}
        }
        trace!("StdioTransport: reader task finished");
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    async fn next_event(&self) -> Option<ReadEvent> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            event = inbound.recv() => event,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(TransportError::Closed),
            result = writer.send(message) => result,
        };

        if let Err(e) = result {
            error!("StdioTransport: write failed, closing transport: {}", e);
            guard.take();
            self.mark_closed();
            return Err(e.into());
        }

        Ok(())
    }

    async fn receive(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<JsonRpcMessage>, TransportError> {
        if self.is_closed() || self.read_ended.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let event = match timeout {
            Some(duration) => tokio::time::timeout(duration, self.next_event())
                .await
                .map_err(|_| TransportError::Timeout(duration))?,
            None => self.next_event().await,
        };

        match event {
            Some(ReadEvent::Message(message)) => Ok(Some(message)),
            Some(ReadEvent::EndOfStream) => {
                debug!("StdioTransport: peer closed its output");
                self.read_ended.store(true, Ordering::SeqCst);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("StdioTransport: closing");
        }
        self.shutdown.cancel();

        if let Some(mut writer) = self.writer.lock().await.take() {
            // Peer may already be gone; nothing useful to do with the error
            let _ = writer.close().await;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================
