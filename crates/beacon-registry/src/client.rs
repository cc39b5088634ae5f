//! A single live subscriber: identity, outbound queue, lifetime token and
//! transport handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::{RegistryError, Result};

/// A connected server-push client.
///
/// `M` is the outbound message type and `W` the transport handle owned by the
/// streaming layer. Records are shared as `Arc<Client<M, W>>`; every holder
/// sees the same outbound queue and lifetime token.
pub struct Client<M, W> {
    id: String,
    outbound: mpsc::Sender<M>,
    lifetime: CancellationToken,
    transport: W,
    connected_at: Instant,
    dropped_messages: AtomicU64,
}

impl<M, W> Client<M, W> {
    /// Create a client with an outbound queue of `capacity` messages.
    ///
    /// Returns the client and the receiving half of its queue. A zero
    /// capacity is raised to one.
    pub fn new(
        id: String,
        transport: W,
        lifetime: CancellationToken,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<M>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let client = Self {
            id,
            outbound,
            lifetime,
            transport,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        };
        (client, rx)
    }

    /// Client id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transport handle supplied at registration.
    pub fn transport(&self) -> &W {
        &self.transport
    }

    /// Lifetime token tied to the originating request.
    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// A producer handle onto the outbound queue.
    pub fn sender(&self) -> mpsc::Sender<M> {
        self.outbound.clone()
    }

    /// Push without waiting.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped message counter.
    pub fn try_send(&self, message: M) -> bool {
        if self.outbound.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Push, waiting for queue capacity.
    ///
    /// Only the calling task waits; the registry is unaffected.
    pub async fn send(&self, message: M) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| RegistryError::Disconnected(self.id.clone()))
    }

    /// Total messages dropped by [`try_send`](Self::try_send).
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Free slots in the outbound queue.
    pub fn capacity(&self) -> usize {
        self.outbound.capacity()
    }

    /// Whether the lifetime token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Signal the streaming layer that this connection should close.
    pub fn cancel(&self) {
        self.lifetime.cancel();
    }

    /// Time since the client was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl<M, W> std::fmt::Debug for Client<M, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}
