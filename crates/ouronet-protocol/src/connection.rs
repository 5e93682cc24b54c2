//! One multiplexed connection: a reader task and a writer task.
//!
//! The reader demultiplexes inbound bytes and dispatches each complete
//! message to its agent through the [`Router`]; agents reply synchronously
//! by queueing onto the writer's channel. The writer frames queued messages
//! into segments and writes them in order.
//!
//! Either task ending (EOF, I/O error, or [`Connection::close`]) closes the
//! connection; the other task observes the shared flag and stops too.

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::agent::Role;
use crate::channel::{AgentPort, ChannelHandle, Outbound, Router};
use crate::error::Result;
use crate::mux::{self, Demuxer, DEFAULT_MAX_MESSAGE_LEN};
use crate::transport::BoxedStream;

const READ_BUFFER: usize = 64 * 1024;

/// A live connection to one peer.
pub struct Connection {
    peer: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    router: Arc<Router>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start the reader and writer tasks for `stream`.
    pub fn spawn(stream: BoxedStream, peer: impl Into<String>) -> Self {
        Self::spawn_with_limit(stream, peer, DEFAULT_MAX_MESSAGE_LEN)
    }

    pub fn spawn_with_limit(
        stream: BoxedStream,
        peer: impl Into<String>,
        max_message_len: usize,
    ) -> Self {
        let peer = peer.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let router = Arc::new(Router::new());

        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&router),
            Demuxer::new(max_message_len),
            Arc::clone(&closed_tx),
            closed_rx.clone(),
            peer.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            write_half,
            queue,
            Arc::clone(&closed_tx),
            closed_rx.clone(),
            peer.clone(),
        ));

        tracing::debug!(peer = %peer, "connection open");
        Self {
            peer,
            outbound,
            router,
            closed_tx,
            closed_rx,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Outbound channel stamped for `role`.
    pub fn channel(&self, role: Role) -> ChannelHandle {
        ChannelHandle::new(self.outbound.clone(), role.outbound_mode())
    }

    /// Route inbound messages to `port` without letting it send yet.
    ///
    /// Messages that arrive before [`Connection::bind`] are consumed and
    /// the replies go out once the port is bound.
    pub fn route(&self, port: Arc<dyn AgentPort>) {
        self.router.insert(port);
    }

    /// Route inbound messages to `port` and let it send.
    pub fn bind(&self, port: Arc<dyn AgentPort>) -> Result<()> {
        self.route(Arc::clone(&port));
        if let Err(e) = port.bind(self.channel(port.role())) {
            tracing::warn!(peer = %self.peer, protocol = port.name(), "bind failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolve once the connection has closed for any reason.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        wait_raised(&mut rx).await;
    }

    /// Close the connection and wait for both tasks to finish.
    ///
    /// Messages already queued are flushed before the writer exits. No
    /// agent callback runs after this returns.
    pub async fn close(&mut self) {
        self.closed_tx.send_replace(true);
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        self.router.clear();
        tracing::debug!(peer = %self.peer, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed_tx.send_replace(true);
    }
}

/// Resolve once `flag` is raised, without holding a borrow of the value.
pub(crate) async fn wait_raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}

async fn read_loop(
    mut reader: tokio::io::ReadHalf<BoxedStream>,
    router: Arc<Router>,
    mut demux: Demuxer,
    closed_tx: Arc<watch::Sender<bool>>,
    mut closed_rx: watch::Receiver<bool>,
    peer: String,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(peer = %peer, "peer closed the connection");
                    break;
                }
                Ok(n) => {
                    for item in demux.push(&buf[..n]) {
                        match item {
                            Ok(inbound) => router.dispatch(&inbound),
                            Err(e) => tracing::warn!(peer = %peer, "{}", e),
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, "read failed: {}", e);
                    break;
                }
            },
            _ = wait_raised(&mut closed_rx) => break,
        }
    }
    closed_tx.send_replace(true);
}

async fn write_loop(
    mut writer: tokio::io::WriteHalf<BoxedStream>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    closed_tx: Arc<watch::Sender<bool>>,
    mut closed_rx: watch::Receiver<bool>,
    peer: String,
) {
    let started = Instant::now();
    let mut frame = BytesMut::new();
    let mut healthy = true;

    loop {
        tokio::select! {
            biased;
            next = queue.recv() => {
                let Some(message) = next else { break };
                if let Err(e) = write_one(&mut writer, &mut frame, started, &message).await {
                    tracing::warn!(peer = %peer, "write failed: {}", e);
                    healthy = false;
                    break;
                }
            }
            _ = wait_raised(&mut closed_rx) => break,
        }
    }

    if healthy {
        while let Ok(message) = queue.try_recv() {
            if write_one(&mut writer, &mut frame, started, &message).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    }
    closed_tx.send_replace(true);
}

async fn write_one(
    writer: &mut tokio::io::WriteHalf<BoxedStream>,
    frame: &mut BytesMut,
    started: Instant,
    message: &Outbound,
) -> std::io::Result<()> {
    frame.clear();
    let timestamp = started.elapsed().as_micros() as u32;
    mux::write_message(frame, timestamp, message.protocol, message.mode, &message.payload);
    writer.write_all(&frame[..]).await?;
    writer.flush().await
}
