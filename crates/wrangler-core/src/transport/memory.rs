//! In-memory `Transport` backed by `tokio::sync::mpsc`, used by tests and by
//! `wrangler-test-utils` to drive the coordinator without opening sockets.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::Message;

use super::{Transport, TransportError, WorkerId};

/// The coordinator-side end: one receive channel fed by every worker, one
/// send channel per worker.
pub struct MemoryTransport {
    id: WorkerId,
    inbound: mpsc::UnboundedReceiver<(WorkerId, Message)>,
    inbound_tx: mpsc::UnboundedSender<(WorkerId, Message)>,
    outbound: Vec<(WorkerId, mpsc::UnboundedSender<(WorkerId, Message)>)>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, dest: WorkerId, msg: Message) -> Result<(), TransportError> {
        let tx = self
            .outbound
            .iter()
            .find(|(id, _)| *id == dest)
            .map(|(_, tx)| tx)
            .ok_or(TransportError::UnknownWorker(dest))?;
        tx.send((self.id, msg)).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<(WorkerId, Message), TransportError> {
        self.inbound.recv().await.ok_or(TransportError::Closed)
    }

    async fn broadcast(&mut self, msg: Message) -> Result<(), TransportError> {
        for (_, tx) in &self.outbound {
            tx.send((self.id, msg.clone())).map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }
}

impl MemoryTransport {
    /// Used internally so both coordinator and worker ends can feed the same
    /// inbound queue when wiring up a pair.
    fn inbound_sender(&self) -> mpsc::UnboundedSender<(WorkerId, Message)> {
        self.inbound_tx.clone()
    }
}

/// Build a coordinator-side [`MemoryTransport`] and `count` worker-side ends,
/// fully cross-wired: the coordinator can `send`/`broadcast` to any worker id
/// 0..count, and `recv` sees messages from any of them in send order per
/// worker.
pub fn paired_transport(count: usize) -> (MemoryTransport, Vec<MemoryTransport>) {
    let (coord_inbound_tx, coord_inbound_rx) = mpsc::unbounded_channel();

    let mut coordinator = MemoryTransport {
        id: WorkerId(u32::MAX),
        inbound: coord_inbound_rx,
        inbound_tx: coord_inbound_tx.clone(),
        outbound: Vec::with_capacity(count),
    };

    let mut workers = Vec::with_capacity(count);
    for i in 0..count {
        let worker_id = WorkerId(i as u32);
        let (worker_inbound_tx, worker_inbound_rx) = mpsc::unbounded_channel();

        coordinator.outbound.push((worker_id, worker_inbound_tx));

        let worker = MemoryTransport {
            id: worker_id,
            inbound: worker_inbound_rx,
            inbound_tx: coord_inbound_tx.clone(),
            outbound: vec![(WorkerId(u32::MAX), coordinator.inbound_sender())],
        };
        workers.push(worker);
    }

    (coordinator, workers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_destination_is_an_error() {
        let (mut coordinator, _workers) = paired_transport(1);
        let err = coordinator
            .send(WorkerId(99), Message::Shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownWorker(WorkerId(99))));
    }
}
