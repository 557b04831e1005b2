use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use werf_core::ClientId;

use crate::error::SyncError;
use crate::factory::{BackendFactory, ClientSession};

/// Client id → backends, created lazily on a client's first request.
///
/// Distinct clients never share a backend, so their lock names and cache
/// keys cannot collide.
pub struct ClientRegistry {
    factory: Arc<dyn BackendFactory>,
    sessions: Mutex<HashMap<ClientId, ClientSession>>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("backend", &self.factory.name())
            .field("clients", &self.len())
            .finish()
    }
}

impl ClientRegistry {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.factory.name()
    }

    /// The session of `client_id`, creating it on first use.
    pub fn session(&self, client_id: &ClientId) -> Result<ClientSession, SyncError> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(client_id) {
            return Ok(session.clone());
        }

        let session = self.factory.create(client_id)?;
        tracing::info!(
            client_id = %client_id,
            backend = self.factory.name(),
            "registered synchronization client",
        );
        sessions.insert(client_id.clone(), session.clone());
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::LocalBackendFactory;
    use std::time::Duration;
    use werf_core::RetryPolicy;
    use werf_storage::{AcquireOptions, AcquireOutcome};

    fn registry() -> ClientRegistry {
        ClientRegistry::new(Arc::new(LocalBackendFactory::in_memory(
            RetryPolicy::immediate(3),
        )))
    }

    #[tokio::test]
    async fn sessions_are_reused_per_client() {
        let registry = registry();
        let demo = ClientId::parse("demo").unwrap();

        let first = registry.session(&demo).unwrap();
        let again = registry.session(&demo).unwrap();
        assert!(Arc::ptr_eq(&first.locker, &again.locker));
        assert_eq!(registry.len(), 1);

        let options = AcquireOptions::exclusive("ci-1", Duration::from_secs(5));
        first.locker.acquire("demo/install", &options).await.unwrap();

        let other = AcquireOptions::exclusive("ci-2", Duration::from_secs(5));
        let outcome = again.locker.acquire("demo/install", &other).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Busy { .. }));
    }

    #[tokio::test]
    async fn clients_do_not_share_lock_namespaces() {
        let registry = registry();
        let a = registry.session(&ClientId::parse("project-a").unwrap()).unwrap();
        let b = registry.session(&ClientId::parse("project-b").unwrap()).unwrap();

        let ci1 = AcquireOptions::exclusive("ci-1", Duration::from_secs(5));
        let ci2 = AcquireOptions::exclusive("ci-2", Duration::from_secs(5));
        assert!(matches!(
            a.locker.acquire("install", &ci1).await.unwrap(),
            AcquireOutcome::Acquired(_)
        ));
        assert!(matches!(
            b.locker.acquire("install", &ci2).await.unwrap(),
            AcquireOutcome::Acquired(_)
        ));
    }
}
