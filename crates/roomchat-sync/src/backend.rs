//! Shared handle to the backing store.
//!
//! All engine components go through one [`Backend`]. Operations are
//! serialized by an async mutex around the [`Database`], and a reachability
//! flag models the remote store's connectivity: while it is down every call
//! fails with [`SyncError::Connectivity`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use roomchat_shared::SyncError;
use roomchat_store::{Database, StoreError};

#[derive(Clone)]
pub struct Backend {
    db: Arc<Mutex<Database>>,
    reachable: Arc<AtomicBool>,
}

impl Backend {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Connectivity signal from the transport layer.
    pub fn set_reachable(&self, reachable: bool) {
        let was = self.reachable.swap(reachable, Ordering::AcqRel);
        if was != reachable {
            if reachable {
                info!("backing store reachable again");
            } else {
                warn!("backing store unreachable");
            }
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Exclusive access to the store, or `Connectivity` if it is unreachable.
    pub async fn lock(&self) -> Result<MutexGuard<'_, Database>, SyncError> {
        self.ensure_reachable()?;
        let guard = self.db.lock().await;
        // The flag may have flipped while waiting for the lock.
        self.ensure_reachable()?;
        Ok(guard)
    }

    /// Run one store operation and map its error into the engine's kinds.
    pub async fn call<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, StoreError>,
    ) -> Result<T, SyncError> {
        let db = self.lock().await?;
        f(&db).map_err(SyncError::from)
    }

    fn ensure_reachable(&self) -> Result<(), SyncError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(SyncError::Connectivity("backing store unreachable".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomchat_shared::UserId;

    #[tokio::test]
    async fn test_unreachable_backend_fails_with_connectivity() {
        let backend = Backend::new(Database::open_in_memory().unwrap());
        let alice = UserId::parse("alice").unwrap();

        backend.set_reachable(false);
        let err = backend
            .call(|db| db.upsert_user(&alice, None, None))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        backend.set_reachable(true);
        assert!(backend.call(|db| db.upsert_user(&alice, None, None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_store_errors_are_mapped() {
        let backend = Backend::new(Database::open_in_memory().unwrap());
        let ghost = UserId::parse("ghost").unwrap();
        let err = backend.call(|db| db.get_user(&ghost)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }
}
