//! TCP `Transport`: the coordinator listens, each worker dials in. Frames
//! are the wire envelope of [`crate::protocol`] written directly to the
//! socket. Per-connection read/write tasks only move bytes; they forward
//! decoded messages over an `mpsc` channel into the coordinator's single
//! consuming loop (§5).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{self, Message};

use super::{Transport, TransportError, WorkerId};

struct WorkerConn {
    writer: tokio::net::tcp::OwnedWriteHalf,
}

pub struct TcpTransport {
    listener: Option<TcpListener>,
    conns: HashMap<WorkerId, WorkerConn>,
    inbound_tx: mpsc::UnboundedSender<(WorkerId, Message)>,
    inbound_rx: mpsc::UnboundedReceiver<(WorkerId, Message)>,
    next_worker_id: u32,
}

impl TcpTransport {
    /// Bind the coordinator's listening socket. Workers connect later via
    /// [`TcpTransport::accept_registrations`].
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(TcpTransport {
            listener: Some(listener),
            conns: HashMap::new(),
            inbound_tx,
            inbound_rx,
            next_worker_id: 0,
        })
    }

    /// Accept exactly `numworkers` connections, spawning a read task per
    /// connection that forwards decoded frames into the shared inbound
    /// queue. Returns once every connection is accepted.
    pub async fn accept_registrations(&mut self, numworkers: u32) -> Result<(), TransportError> {
        let listener = self.listener.as_ref().ok_or(TransportError::Closed)?;
        for _ in 0..numworkers {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            let worker_id = WorkerId(self.next_worker_id);
            self.next_worker_id += 1;
            debug!(%peer, worker = worker_id.0, "accepted worker connection");

            let (read_half, write_half) = stream.into_split();
            self.conns.insert(worker_id, WorkerConn { writer: write_half });

            let tx = self.inbound_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(read_half);
                loop {
                    match protocol::read_frame(&mut reader).await {
                        Ok((_, msg)) => {
                            if tx.send((worker_id, msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(worker = worker_id.0, error = %e, "connection closed or protocol error");
                            break;
                        }
                    }
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, dest: WorkerId, msg: Message) -> Result<(), TransportError> {
        let conn = self
            .conns
            .get_mut(&dest)
            .ok_or(TransportError::UnknownWorker(dest))?;
        let frame = protocol::encode(dest.0, &msg)?;
        conn.writer.write_all(&frame).await?;
        conn.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<(WorkerId, Message), TransportError> {
        self.inbound_rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn broadcast(&mut self, msg: Message) -> Result<(), TransportError> {
        let frame = protocol::encode(u32::MAX, &msg)?;
        for conn in self.conns.values_mut() {
            conn.writer.write_all(&frame).await?;
            conn.writer.flush().await?;
        }
        Ok(())
    }
}

/// Worker-side dial: connect to the coordinator's listening address.
pub async fn connect(addr: &str) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}
