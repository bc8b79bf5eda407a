//! One client's transport link.
//!
//! A [`Connection`] owns the read half of a stream and a writer task that
//! drains a bounded outbound queue. Other tasks only ever see the cloneable
//! [`ConnectionHandle`], whose `send` never waits: a full queue means the
//! peer is not keeping up, and the caller decides what to do about it.

use std::{sync::Arc, time::Duration};

use futures::{Stream, stream};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    codec::{encode_frame, read_frame, write_frame},
    config::ConnectionConfig,
    error::{ConnectionError, FrameError},
};

/// Cloneable send/close side of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: Arc<str>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: Arc<watch::Sender<bool>>,
    capacity: usize,
}

impl ConnectionHandle {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queues an encoded frame for the writer task.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.outbound.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => ConnectionError::Backpressure {
                capacity: self.capacity,
            },
            TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    pub fn send_frame<T: Serialize>(&self, frame: &T) -> Result<(), ConnectionError> {
        self.send(encode_frame(frame))
    }

    /// Marks the connection closed. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has been closed from any side.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        signalled(&mut rx).await;
    }
}

pub struct Connection<S> {
    reader: ReadHalf<S>,
    handle: ConnectionHandle,
    writer: JoinHandle<()>,
    max_frame_len: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Splits `stream` and spawns its writer task. Must be called inside a
    /// Tokio runtime.
    pub fn new(stream: S, peer: impl Into<Arc<str>>, config: &ConnectionConfig) -> Self {
        let peer = peer.into();
        let capacity = config.send_queue_capacity.max(1);
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed = Arc::new(closed_tx);

        let writer = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            closed_rx,
            Arc::clone(&closed),
            config.clone(),
            Arc::clone(&peer),
        ));

        Self {
            reader,
            handle: ConnectionHandle {
                peer,
                outbound: outbound_tx,
                closed,
                capacity,
            },
            writer,
            max_frame_len: config.max_frame_len,
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead,
{
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn peer(&self) -> &str {
        self.handle.peer()
    }

    pub fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        self.handle.send(frame)
    }

    pub fn close(&self) {
        self.handle.close();
    }

    /// Inbound frame payloads, read lazily.
    ///
    /// The stream ends on EOF, once the connection is closed, or right after
    /// yielding a framing error (the byte stream cannot be resynchronised).
    pub fn receive(&mut self) -> impl Stream<Item = Result<Vec<u8>, FrameError>> + '_ {
        let max_len = self.max_frame_len;
        let closed = self.handle.closed.subscribe();

        stream::unfold(
            Some((&mut self.reader, closed)),
            move |state| async move {
                let (reader, mut closed) = state?;
                if *closed.borrow() {
                    return None;
                }

                let result = select! {
                    result = read_frame(&mut *reader, max_len) => result,
                    _ = signalled(&mut closed) => return None,
                };

                match result {
                    Ok(frame) => Some((Ok(frame), Some((reader, closed)))),
                    Err(FrameError::ConnectionClosed) => None,
                    Err(err) => Some((Err(err), None)),
                }
            },
        )
    }

    /// Closes the connection and gives the writer `grace` to flush frames
    /// that were already queued. A writer still blocked after that is
    /// aborted.
    pub async fn shutdown(self, grace: Duration) {
        let Connection {
            handle, mut writer, ..
        } = self;
        handle.close();

        if timeout(grace, &mut writer).await.is_err() {
            warn!(peer = %handle.peer, "writer still busy after grace period; aborting");
            writer.abort();
        }
    }
}

/// Resolves once the flag is set or its sender is gone.
///
/// The `watch::Ref` from `wait_for` is dropped here, so callers can keep the
/// future in a `select!` across other awaits and stay `Send`.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|flag| *flag).await;
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    mut closed_rx: watch::Receiver<bool>,
    closed: Arc<watch::Sender<bool>>,
    config: ConnectionConfig,
    peer: Arc<str>,
) where
    S: AsyncWrite,
{
    loop {
        // Queued frames win over the close signal so a final error frame
        // still reaches the peer.
        select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let write = write_frame(&mut writer, &frame, config.max_frame_len);
                match timeout(config.send_timeout, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(peer = %peer, error = ?err, "write failed; closing connection");
                        break;
                    }
                    Err(_) => {
                        warn!(peer = %peer, timeout = ?config.send_timeout, "peer stalled on write; closing connection");
                        break;
                    }
                }
            }
            _ = signalled(&mut closed_rx) => break,
        }
    }

    closed.send_replace(true);
    if let Err(err) = timeout(config.send_timeout, writer.shutdown()).await {
        debug!(peer = %peer, error = ?err, "timed out shutting down writer");
    }
}
