//! The `Transport` trait abstracting the message-passing fabric (§4.3), plus
//! a TCP implementation and an in-memory one backed by `tokio::sync::mpsc`.

mod memory;
pub mod tcp;

pub use memory::{paired_transport, MemoryTransport};
pub use tcp::TcpTransport;

use async_trait::async_trait;

use crate::protocol::Message;

/// Stable identifier for a connected worker, assigned by the transport at
/// connection time (TCP: accept order; in-memory: construction order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown worker {0:?}")]
    UnknownWorker(WorkerId),
    #[error("transport closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The fabric abstraction the coordinator depends on. Workers are reliable,
/// ordered, point-to-point channels multiplexed into one inbound queue that
/// preserves per-sender order (§5 ordering guarantees).
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, dest: WorkerId, msg: Message) -> Result<(), TransportError>;

    /// Receive the next inbound message from any worker.
    async fn recv(&mut self) -> Result<(WorkerId, Message), TransportError>;

    /// Send `msg` to every connected worker.
    async fn broadcast(&mut self, msg: Message) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HostRank, TaskResult};

    #[tokio::test]
    async fn memory_transport_preserves_order_and_routes_by_worker() {
        let (mut coordinator, mut workers) = paired_transport(2);

        coordinator
            .send(WorkerId(0), Message::HostRank(HostRank { rank: 0 }))
            .await
            .unwrap();
        coordinator
            .send(WorkerId(1), Message::HostRank(HostRank { rank: 1 }))
            .await
            .unwrap();

        let w0 = &mut workers[0];
        let (_, msg) = w0.recv().await.unwrap();
        assert_eq!(msg, Message::HostRank(HostRank { rank: 0 }));

        let w1 = &mut workers[1];
        let (_, msg) = w1.recv().await.unwrap();
        assert_eq!(msg, Message::HostRank(HostRank { rank: 1 }));

        workers[0]
            .send(
                WorkerId(0),
                Message::Result(TaskResult {
                    name: "A".to_string(),
                    exit_code: 0,
                    runtime: 1.0,
                }),
            )
            .await
            .unwrap();
        workers[1]
            .send(
                WorkerId(1),
                Message::Result(TaskResult {
                    name: "B".to_string(),
                    exit_code: 0,
                    runtime: 1.0,
                }),
            )
            .await
            .unwrap();

        let (from0, _) = coordinator.recv().await.unwrap();
        let (from1, _) = coordinator.recv().await.unwrap();
        let mut froms = vec![from0, from1];
        froms.sort();
        assert_eq!(froms, vec![WorkerId(0), WorkerId(1)]);
    }

    #[tokio::test]
    async fn memory_transport_broadcast_reaches_every_worker() {
        let (mut coordinator, mut workers) = paired_transport(3);
        coordinator.broadcast(Message::Shutdown).await.unwrap();
        for w in &mut workers {
            let (_, msg) = w.recv().await.unwrap();
            assert_eq!(msg, Message::Shutdown);
        }
    }
}
