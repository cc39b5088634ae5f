//! Client registry — a single owner task serializes every request against the
//! live client map.
//!
//! Callers talk to the owner through a bounded MPSC queue. Requests that need
//! an answer carry a oneshot reply channel, so each caller waits only on its
//! own reply. The map is never locked: only the owner task touches it. The
//! live count is published through an atomic after each mutation so
//! [`ClientRegistry::active`] can read it without queueing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use beacon_settings::{DuplicatePolicy, RegistrySettings};
use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::client::Client;
use crate::errors::{RegistryError, Result};
use crate::metrics::{
    BROADCAST_DROPS_TOTAL, CLIENTS_ACTIVE, CLIENTS_ADDED_TOTAL, CLIENTS_EVICTED_TOTAL,
    CLIENTS_REMOVED_TOTAL,
};

/// Shared handle to a registered client.
pub type SharedClient<M, W> = Arc<Client<M, W>>;

/// Result of [`ClientRegistry::add`].
#[derive(Debug)]
pub struct Registration<M, W> {
    /// The new client, shared with the registry.
    pub client: SharedClient<M, W>,
    /// Receiving half of the client's outbound queue.
    pub messages: mpsc::Receiver<M>,
    /// Live count read right after the insert was queued.
    ///
    /// Not synchronized with the insert itself: it may or may not include
    /// this client.
    pub active: usize,
}

/// Request processed by the owner task.
enum Request<M, W> {
    Insert(SharedClient<M, W>),
    Remove {
        id: String,
        reply: oneshot::Sender<usize>,
    },
    RemoveClient {
        client: SharedClient<M, W>,
        reply: oneshot::Sender<usize>,
    },
    List {
        reply: oneshot::Sender<Vec<SharedClient<M, W>>>,
    },
    Lookup {
        id: String,
        reply: oneshot::Sender<Option<SharedClient<M, W>>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<usize>,
    },
}

/// Registry of live server-push clients.
///
/// Must be created inside a Tokio runtime. Dropping the registry stops the
/// owner task, which cancels every remaining client's lifetime token.
pub struct ClientRegistry<M, W> {
    tx: mpsc::Sender<Request<M, W>>,
    active: Arc<AtomicUsize>,
    message_buffer: usize,
    worker_handle: JoinHandle<()>,
}

impl<M, W> ClientRegistry<M, W>
where
    M: Send + 'static,
    W: Send + Sync + 'static,
{
    /// Spawn the owner task using the given settings.
    ///
    /// Zero-sized buffers are raised to one.
    pub fn new(settings: &RegistrySettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.request_buffer.max(1));
        let active = Arc::new(AtomicUsize::new(0));

        let owner = Owner {
            live: HashMap::new(),
            active: active.clone(),
            duplicate_policy: settings.duplicate_policy,
        };
        let worker_handle = tokio::spawn(owner.run(rx).instrument(info_span!("client_registry")));

        Self {
            tx,
            active,
            message_buffer: settings.message_buffer.max(1),
            worker_handle,
        }
    }

    /// Spawn the owner task with [`RegistrySettings::default`].
    pub fn with_defaults() -> Self {
        Self::new(&RegistrySettings::default())
    }

    /// Register a new client.
    ///
    /// The insert is queued but not awaited: the client is returned as soon
    /// as the owner has accepted the request. Requests later submitted from
    /// the same task are processed after it.
    pub async fn add(
        &self,
        lifetime: CancellationToken,
        transport: W,
        id: impl Into<String>,
    ) -> Result<Registration<M, W>> {
        let (client, messages) = Client::new(id.into(), transport, lifetime, self.message_buffer);
        let client = Arc::new(client);

        self.tx
            .send(Request::Insert(client.clone()))
            .await
            .map_err(|_| RegistryError::Closed)?;

        Ok(Registration {
            client,
            messages,
            active: self.active(),
        })
    }

    /// Remove a client and cancel its lifetime token.
    ///
    /// Unknown ids are a no-op. Returns the live count right after the
    /// removal was applied.
    pub async fn remove(&self, id: &str) -> Result<usize> {
        let id = id.to_owned();
        self.request(|reply| Request::Remove { id, reply }).await
    }

    /// Remove this exact client and cancel its lifetime token.
    ///
    /// The map entry is only dropped if it still holds `client`; a client
    /// already displaced by a newer one with the same id leaves the newer
    /// entry alone. Streaming layers should call this, not
    /// [`remove`](Self::remove), when a connection's lifetime ends.
    pub async fn remove_client(&self, client: &SharedClient<M, W>) -> Result<usize> {
        let client = client.clone();
        self.request(|reply| Request::RemoveClient { client, reply })
            .await
    }

    /// Number of live clients, read without queueing.
    ///
    /// May lag behind requests that are still queued.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Snapshot of every live client, in no particular order.
    pub async fn clients(&self) -> Result<Vec<SharedClient<M, W>>> {
        self.request(|reply| Request::List { reply }).await
    }

    /// Call `visit` for each client in a snapshot.
    ///
    /// Runs in the calling task, so a slow visitor never holds up other
    /// registry requests. Clients added or removed after the snapshot was
    /// taken are not reflected.
    pub async fn range<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&SharedClient<M, W>),
    {
        for client in &self.clients().await? {
            visit(client);
        }
        Ok(())
    }

    /// Look up one client by id.
    pub async fn client(&self, id: &str) -> Result<Option<SharedClient<M, W>>> {
        let id = id.to_owned();
        self.request(|reply| Request::Lookup { id, reply }).await
    }

    /// Wait until every request submitted before this call has been applied.
    pub async fn flush(&self) -> Result<()> {
        self.request(|reply| Request::Flush { reply }).await
    }

    /// Push a copy of `message` to every live client without waiting.
    ///
    /// Clients whose queue is full or closed are skipped. Returns how many
    /// clients accepted the message.
    pub async fn broadcast(&self, message: M) -> Result<usize>
    where
        M: Clone,
    {
        let clients = self.clients().await?;
        let mut delivered = 0;
        for client in &clients {
            if client.try_send(message.clone()) {
                delivered += 1;
            } else {
                counter!(BROADCAST_DROPS_TOTAL).increment(1);
                warn!(client_id = client.id(), "client queue full or closed, broadcast dropped");
            }
        }
        debug!(recipients = clients.len(), delivered, "broadcast sent");
        Ok(delivered)
    }

    /// Stop accepting requests.
    ///
    /// Requests already queued are still processed in order. Every client
    /// left afterwards has its lifetime token cancelled and is released.
    /// Returns the number of clients released; `0` if already closed.
    pub async fn close(&self) -> usize {
        self.request(|reply| Request::Close { reply })
            .await
            .unwrap_or(0)
    }

    /// Close the registry and wait for the owner task to exit.
    pub async fn shutdown(self) -> usize {
        let released = self.close().await;
        let Self {
            tx, worker_handle, ..
        } = self;
        drop(tx);
        if let Err(e) = worker_handle.await {
            warn!(error = %e, "client registry owner task failed");
        }
        released
    }

    /// Whether the registry has stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request<M, W>,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| RegistryError::Closed)?;

        reply_rx.await.map_err(|_| RegistryError::Closed)
    }
}

/// Owner of the live map. Runs on its own task.
struct Owner<M, W> {
    live: HashMap<String, SharedClient<M, W>>,
    active: Arc<AtomicUsize>,
    duplicate_policy: DuplicatePolicy,
}

impl<M, W> Owner<M, W> {
    async fn run(mut self, mut rx: mpsc::Receiver<Request<M, W>>) {
        debug!("client registry serving");
        let mut closers: Vec<oneshot::Sender<usize>> = Vec::new();

        while let Some(request) = rx.recv().await {
            match request {
                Request::Insert(client) => self.insert(client),
                Request::Remove { id, reply } => {
                    let _ = reply.send(self.remove(&id));
                }
                Request::RemoveClient { client, reply } => {
                    let _ = reply.send(self.remove_client(&client));
                }
                Request::List { reply } => {
                    let _ = reply.send(self.live.values().cloned().collect());
                }
                Request::Lookup { id, reply } => {
                    let _ = reply.send(self.live.get(&id).cloned());
                }
                Request::Flush { reply } => {
                    let _ = reply.send(());
                }
                Request::Close { reply } => {
                    if closers.is_empty() {
                        debug!("close requested, draining queued requests");
                        rx.close();
                    }
                    closers.push(reply);
                }
            }
        }

        let released = self.release_all();
        info!(released, "client registry closed");

        let mut closers = closers.into_iter();
        if let Some(first) = closers.next() {
            let _ = first.send(released);
        }
        for reply in closers {
            let _ = reply.send(0);
        }
    }

    fn insert(&mut self, client: SharedClient<M, W>) {
        let id = client.id().to_owned();
        counter!(CLIENTS_ADDED_TOTAL).increment(1);

        if let Some(prior) = self.live.insert(id.clone(), client) {
            match self.duplicate_policy {
                DuplicatePolicy::Evict => {
                    prior.cancel();
                    counter!(CLIENTS_EVICTED_TOTAL).increment(1);
                    warn!(client_id = %id, "duplicate client id, evicted previous connection");
                }
                DuplicatePolicy::Overwrite => {
                    debug!(client_id = %id, "duplicate client id, previous connection overwritten");
                }
            }
        }

        self.publish();
        debug!(client_id = %id, active = self.live.len(), "client registered");
    }

    fn remove(&mut self, id: &str) -> usize {
        match self.live.remove(id) {
            Some(client) => {
                // The streaming layer watches this token and closes the transport.
                client.cancel();
                counter!(CLIENTS_REMOVED_TOTAL).increment(1);
                self.publish();
                debug!(client_id = id, active = self.live.len(), "client removed");
            }
            None => trace!(client_id = id, "remove for unknown client ignored"),
        }
        self.live.len()
    }

    fn remove_client(&mut self, client: &SharedClient<M, W>) -> usize {
        let current = self
            .live
            .get(client.id())
            .is_some_and(|live| Arc::ptr_eq(live, client));
        if current {
            return self.remove(client.id());
        }
        client.cancel();
        trace!(client_id = client.id(), "remove for displaced client ignored");
        self.live.len()
    }

    fn release_all(&mut self) -> usize {
        let released = self.live.len();
        for (_, client) in self.live.drain() {
            client.cancel();
        }
        counter!(CLIENTS_REMOVED_TOTAL).increment(released as u64);
        self.publish();
        released
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish(&self) {
        let len = self.live.len();
        self.active.store(len, Ordering::Release);
        gauge!(CLIENTS_ACTIVE).set(len as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use beacon_logging::capture_logs;
    use tracing::Level;

    use super::*;

    type TestRegistry = ClientRegistry<String, ()>;

    fn ids(clients: &[SharedClient<String, ()>]) -> BTreeSet<String> {
        clients.iter().map(|c| c.id().to_owned()).collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    async fn add(registry: &TestRegistry, id: &str) -> Registration<String, ()> {
        registry.add(CancellationToken::new(), (), id).await.unwrap()
    }

    #[tokio::test]
    async fn add_then_lookup_finds_client() {
        let registry = TestRegistry::with_defaults();
        let reg = add(&registry, "a").await;

        let found = registry.client("a").await.unwrap().expect("client a");
        assert!(Arc::ptr_eq(&found, &reg.client));
    }

    #[tokio::test]
    async fn lookup_absent_id_is_none() {
        let registry = TestRegistry::with_defaults();
        let _a = add(&registry, "a").await;
        assert!(registry.client("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn add_remove_scenario() {
        let registry = TestRegistry::with_defaults();
        let _a = add(&registry, "a").await;
        let _b = add(&registry, "b").await;
        let _c = add(&registry, "c").await;
        registry.flush().await.unwrap();

        assert_eq!(ids(&registry.clients().await.unwrap()), set(&["a", "b", "c"]));

        assert_eq!(registry.remove("b").await.unwrap(), 2);
        assert_eq!(ids(&registry.clients().await.unwrap()), set(&["a", "c"]));

        assert_eq!(registry.remove("b").await.unwrap(), 2);
        assert_eq!(ids(&registry.clients().await.unwrap()), set(&["a", "c"]));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = TestRegistry::with_defaults();
        let _a = add(&registry, "a").await;
        let _b = add(&registry, "b").await;

        let first = registry.remove("a").await.unwrap();
        let second = registry.remove("a").await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn remove_unknown_on_empty_registry() {
        let registry = TestRegistry::with_defaults();
        assert_eq!(registry.remove("ghost").await.unwrap(), 0);
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn remove_cancels_lifetime_token() {
        let registry = TestRegistry::with_defaults();
        let token = CancellationToken::new();
        let reg = registry.add(token.clone(), (), "a").await.unwrap();

        let _ = registry.remove("a").await.unwrap();
        assert!(token.is_cancelled());
        assert!(reg.client.is_cancelled());
    }

    #[tokio::test]
    async fn removed_client_outbound_still_drains() {
        let registry = TestRegistry::with_defaults();
        let mut reg = add(&registry, "a").await;
        assert!(reg.client.try_send("last words".into()));

        let _ = registry.remove("a").await.unwrap();
        assert_eq!(reg.messages.recv().await.as_deref(), Some("last words"));
    }

    #[tokio::test]
    async fn active_matches_clients_when_quiescent() {
        let registry = TestRegistry::with_defaults();
        assert_eq!(registry.active(), 0);
        for id in ["a", "b", "c", "d"] {
            let _ = add(&registry, id).await;
        }
        let _ = registry.remove("c").await.unwrap();
        registry.flush().await.unwrap();

        assert_eq!(registry.active(), 3);
        assert_eq!(registry.active(), registry.clients().await.unwrap().len());
    }

    #[tokio::test]
    async fn add_reports_count_without_waiting() {
        let registry = TestRegistry::with_defaults();
        let first = add(&registry, "a").await;
        assert!(first.active <= 1);

        registry.flush().await.unwrap();
        let second = add(&registry, "b").await;
        assert!((1..=2).contains(&second.active));
    }

    #[tokio::test]
    async fn add_uses_configured_message_buffer() {
        let registry = TestRegistry::new(&RegistrySettings {
            message_buffer: 3,
            ..RegistrySettings::default()
        });
        let reg = add(&registry, "a").await;
        assert_eq!(reg.client.capacity(), 3);
    }

    #[tokio::test]
    async fn empty_id_is_an_ordinary_key() {
        let registry = TestRegistry::with_defaults();
        let _reg = add(&registry, "").await;
        assert!(registry.client("").await.unwrap().is_some());
        assert_eq!(registry.remove("").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_id_evicts_previous_client() {
        let (logs, _guard) = capture_logs();
        let registry = TestRegistry::with_defaults();
        let old = add(&registry, "dup").await;
        let new = add(&registry, "dup").await;
        registry.flush().await.unwrap();

        assert!(old.client.is_cancelled());
        assert!(!new.client.is_cancelled());
        let found = registry.client("dup").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &new.client));
        assert_eq!(registry.active(), 1);

        let events = logs.find("duplicate client id");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::WARN);
        assert_eq!(events[0].field("client_id"), Some("dup"));
    }

    #[tokio::test]
    async fn evicted_client_teardown_keeps_replacement() {
        let registry = TestRegistry::with_defaults();
        let old = add(&registry, "dup").await;
        let new = add(&registry, "dup").await;

        tokio::time::timeout(Duration::from_secs(1), old.client.lifetime().cancelled())
            .await
            .expect("evicted client should be cancelled");
        let remaining = registry.remove_client(&old.client).await.unwrap();

        assert_eq!(remaining, 1);
        assert!(!new.client.is_cancelled());
        let found = registry.client("dup").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &new.client));
        assert_eq!(registry.active(), 1);
    }

    #[tokio::test]
    async fn remove_client_removes_current_entry() {
        let registry = TestRegistry::with_defaults();
        let a = add(&registry, "a").await;
        let _b = add(&registry, "b").await;

        assert_eq!(registry.remove_client(&a.client).await.unwrap(), 1);
        assert!(a.client.is_cancelled());
        assert!(registry.client("a").await.unwrap().is_none());
        assert_eq!(registry.remove_client(&a.client).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_client_after_overwrite_cancels_only_the_stale_client() {
        let registry = TestRegistry::new(&RegistrySettings {
            duplicate_policy: DuplicatePolicy::Overwrite,
            ..RegistrySettings::default()
        });
        let old = add(&registry, "dup").await;
        let new = add(&registry, "dup").await;

        assert_eq!(registry.remove_client(&old.client).await.unwrap(), 1);
        assert!(old.client.is_cancelled());
        assert!(!new.client.is_cancelled());
        assert!(registry.client("dup").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_id_overwrite_leaves_previous_client() {
        let registry = TestRegistry::new(&RegistrySettings {
            duplicate_policy: DuplicatePolicy::Overwrite,
            ..RegistrySettings::default()
        });
        let old = add(&registry, "dup").await;
        let new = add(&registry, "dup").await;
        registry.flush().await.unwrap();

        assert!(!old.client.is_cancelled());
        let found = registry.client("dup").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &new.client));
        assert_eq!(registry.active(), 1);
    }

    #[tokio::test]
    async fn range_visits_each_client_once() {
        let registry = TestRegistry::with_defaults();
        for id in ["x", "y", "z"] {
            let _ = add(&registry, id).await;
        }

        let mut seen = Vec::new();
        registry
            .range(|client| seen.push(client.id().to_owned()))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn range_on_empty_registry_never_calls_visitor() {
        let registry = TestRegistry::with_defaults();
        let mut calls = 0;
        registry.range(|_| calls += 1).await.unwrap();
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let registry = TestRegistry::with_defaults();
        let mut a = add(&registry, "a").await;
        let mut b = add(&registry, "b").await;

        assert_eq!(registry.broadcast("ping".to_owned()).await.unwrap(), 2);
        assert_eq!(a.messages.recv().await.as_deref(), Some("ping"));
        assert_eq!(b.messages.recv().await.as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn broadcast_skips_full_clients() {
        let registry = TestRegistry::new(&RegistrySettings {
            message_buffer: 1,
            ..RegistrySettings::default()
        });
        let full = add(&registry, "full").await;
        let _open = add(&registry, "open").await;
        assert!(full.client.try_send("backlog".into()));

        assert_eq!(registry.broadcast("news".to_owned()).await.unwrap(), 1);
        assert_eq!(full.client.drop_count(), 1);
    }

    #[tokio::test]
    async fn full_outbound_queue_never_blocks_registry() {
        let registry = Arc::new(TestRegistry::new(&RegistrySettings {
            message_buffer: 2,
            ..RegistrySettings::default()
        }));
        let reg = add(&registry, "slow").await;
        assert!(reg.client.try_send("1".into()));
        assert!(reg.client.try_send("2".into()));

        let pusher = reg.client.clone();
        let blocked = tokio::spawn(async move { pusher.send("3".into()).await });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        let _other = add(&registry, "other").await;
        let listed = tokio::time::timeout(Duration::from_secs(1), registry.clients())
            .await
            .expect("registry must answer while a push is pending")
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(registry.remove("other").await.unwrap(), 1);

        drop(reg.messages);
        assert_matches!(blocked.await.unwrap(), Err(RegistryError::Disconnected(_)));
    }

    #[tokio::test]
    async fn close_releases_clients_and_rejects_requests() {
        let registry = TestRegistry::with_defaults();
        let a = add(&registry, "a").await;
        let b = add(&registry, "b").await;

        assert_eq!(registry.close().await, 2);
        assert!(registry.is_closed());
        assert!(a.client.is_cancelled());
        assert!(b.client.is_cancelled());
        assert_eq!(registry.active(), 0);

        assert_matches!(
            registry.add(CancellationToken::new(), (), "c").await,
            Err(RegistryError::Closed)
        );
        assert_matches!(registry.remove("a").await, Err(RegistryError::Closed));
        assert_matches!(registry.remove_client(&a.client).await, Err(RegistryError::Closed));
        assert_matches!(registry.clients().await, Err(RegistryError::Closed));
        assert_matches!(registry.client("a").await, Err(RegistryError::Closed));
        assert_matches!(registry.flush().await, Err(RegistryError::Closed));
        assert_matches!(registry.range(|_| {}).await, Err(RegistryError::Closed));
        assert_matches!(
            registry.broadcast("late".to_owned()).await,
            Err(RegistryError::Closed)
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = TestRegistry::with_defaults();
        let _a = add(&registry, "a").await;
        assert_eq!(registry.close().await, 1);
        assert_eq!(registry.close().await, 0);
    }

    #[tokio::test]
    async fn close_processes_requests_queued_before_it() {
        let registry = Arc::new(TestRegistry::with_defaults());
        let token = CancellationToken::new();
        let _queued = registry.add(token.clone(), (), "queued").await.unwrap();

        let released = registry.close().await;
        assert_eq!(released, 1);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_waits_for_owner() {
        let (logs, _guard) = capture_logs();
        let registry = TestRegistry::with_defaults();
        let _a = add(&registry, "a").await;

        assert_eq!(registry.shutdown().await, 1);
        assert!(logs.has_event(Level::INFO, "client registry closed"));
    }

    #[tokio::test]
    async fn dropping_registry_cancels_remaining_clients() {
        let registry = TestRegistry::with_defaults();
        let token = CancellationToken::new();
        let _reg = registry.add(token.clone(), (), "a").await.unwrap();
        registry.flush().await.unwrap();
        drop(registry);

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("owner should cancel clients when the registry is dropped");
    }

    #[tokio::test]
    async fn zero_request_buffer_is_usable() {
        let registry = TestRegistry::new(&RegistrySettings {
            message_buffer: 0,
            request_buffer: 0,
            ..RegistrySettings::default()
        });
        let reg = add(&registry, "a").await;
        assert_eq!(reg.client.capacity(), 1);
        assert_eq!(registry.clients().await.unwrap().len(), 1);
    }
}
