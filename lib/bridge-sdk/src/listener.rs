use crate::dto::ChangeMask;
use async_trait::async_trait;

/// Consumed by the Fleet Manager's Bridge Listener. Callbacks may arrive
/// concurrently, each on its own worker; implementations must not block
/// the bridge's dispatch thread.
#[async_trait]
pub trait DeviceChangeListener: Send + Sync {
    async fn connected(&self, serial: &str);
    async fn disconnected(&self, serial: &str);
    async fn changed(&self, serial: &str, mask: ChangeMask);
}
