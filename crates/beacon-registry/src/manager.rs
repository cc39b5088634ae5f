//! Object-safe view of the registry contract, for hosts that want to swap
//! implementations or hold the registry as a trait object.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::registry::{ClientRegistry, Registration, SharedClient};

/// Tracks live clients and hands out their outbound queues.
#[async_trait]
pub trait ClientManager<M, W>: Send + Sync
where
    M: Send + 'static,
    W: Send + Sync + 'static,
{
    /// Register a new client. See [`ClientRegistry::add`].
    async fn add(
        &self,
        lifetime: CancellationToken,
        transport: W,
        id: String,
    ) -> Result<Registration<M, W>>;

    /// Remove a client by id. See [`ClientRegistry::remove`].
    async fn remove(&self, id: &str) -> Result<usize>;

    /// Remove this exact client. See [`ClientRegistry::remove_client`].
    async fn remove_client(&self, client: &SharedClient<M, W>) -> Result<usize>;

    /// Live count, possibly stale.
    fn active(&self) -> usize;

    /// Snapshot of every live client.
    async fn clients(&self) -> Result<Vec<SharedClient<M, W>>>;

    /// Visit each client of a snapshot in the calling task.
    async fn range(&self, visit: &mut (dyn for<'c> FnMut(&'c SharedClient<M, W>) + Send)) -> Result<()>;

    /// Look up one client by id.
    async fn client(&self, id: &str) -> Result<Option<SharedClient<M, W>>>;
}

#[async_trait]
impl<M, W> ClientManager<M, W> for ClientRegistry<M, W>
where
    M: Send + 'static,
    W: Send + Sync + 'static,
{
    async fn add(
        &self,
        lifetime: CancellationToken,
        transport: W,
        id: String,
    ) -> Result<Registration<M, W>> {
        ClientRegistry::add(self, lifetime, transport, id).await
    }

    async fn remove(&self, id: &str) -> Result<usize> {
        ClientRegistry::remove(self, id).await
    }

    async fn remove_client(&self, client: &SharedClient<M, W>) -> Result<usize> {
        ClientRegistry::remove_client(self, client).await
    }

    fn active(&self) -> usize {
        ClientRegistry::active(self)
    }

    async fn clients(&self) -> Result<Vec<SharedClient<M, W>>> {
        ClientRegistry::clients(self).await
    }

    async fn range(&self, visit: &mut (dyn for<'c> FnMut(&'c SharedClient<M, W>) + Send)) -> Result<()> {
        ClientRegistry::range(self, visit).await
    }

    async fn client(&self, id: &str) -> Result<Option<SharedClient<M, W>>> {
        ClientRegistry::client(self, id).await
    }
}
