//! Fixed-size pool of [`InferenceClient`] handles.
//!
//! Handles sit in a bounded [`ArrayQueue`]; a [`Semaphore`] with one permit
//! per handle makes callers wait cooperatively while the queue is empty.
//! Acquiring takes a permit and pops a handle; the returned [`PooledClient`]
//! lease pushes the handle back and then frees the permit when it is dropped,
//! so every exit path (early return, error, cancelled future) releases.
//!
//! Pools are explicitly constructed and passed around; there is no global
//! instance.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{ClientConfig, PoolConfig};
use crate::error::{InferenceError, Result};
use crate::transport::InferenceClient;

/// The live set of handles between `initialize` and `shutdown`.
#[derive(Debug)]
struct Slots {
    idle: ArrayQueue<InferenceClient>,
    permits: Arc<Semaphore>,
}

/// A bounded pool of client handles.
#[derive(Debug)]
pub struct ClientPool {
    client_config: ClientConfig,
    config: PoolConfig,
    slots: Mutex<Option<Arc<Slots>>>,
}

impl ClientPool {
    /// Create an uninitialized pool.  No handle exists until
    /// [`initialize`](Self::initialize) or the first
    /// [`acquire`](Self::acquire).
    pub fn new(client_config: ClientConfig, config: PoolConfig) -> Self {
        Self {
            client_config,
            config,
            slots: Mutex::new(None),
        }
    }

    /// Create and initialize a pool in one step.
    pub fn connect(client_config: ClientConfig, config: PoolConfig) -> Result<Self> {
        let pool = Self::new(client_config, config);
        pool.initialize()?;
        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Slots>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create `size` handles and make them available.  A no-op when already
    /// initialized.  If any handle fails to build, nothing is installed.
    pub fn initialize(&self) -> Result<()> {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(self.build_slots()?);
        }
        Ok(())
    }

    fn build_slots(&self) -> Result<Arc<Slots>> {
        let size = self.config.size;
        if size == 0 {
            return Err(InferenceError::Config {
                reason: "pool size must be at least 1".into(),
            });
        }

        let idle = ArrayQueue::new(size);
        for id in 0..size {
            let client = InferenceClient::new(id, &self.client_config)?;
            // Capacity equals `size`, so this cannot overflow.
            let _ = idle.push(client);
        }

        tracing::info!(
            size,
            base_url = %self.client_config.trimmed_base_url(),
            "client pool initialized"
        );
        Ok(Arc::new(Slots {
            idle,
            permits: Arc::new(Semaphore::new(size)),
        }))
    }

    fn current_or_init(&self) -> Result<Arc<Slots>> {
        let mut guard = self.lock();
        match guard.as_ref() {
            Some(slots) => Ok(Arc::clone(slots)),
            None => {
                let slots = self.build_slots()?;
                *guard = Some(Arc::clone(&slots));
                Ok(slots)
            }
        }
    }

    /// Borrow a handle, waiting up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<PooledClient> {
        self.acquire_timeout(self.config.acquire_timeout).await
    }

    /// Borrow a handle, waiting at most `wait`.
    ///
    /// Initializes the pool first if needed.  Fails with
    /// [`InferenceError::PoolExhausted`] on timeout and
    /// [`InferenceError::PoolClosed`] if the pool is shut down while waiting.
    pub async fn acquire_timeout(&self, wait: Duration) -> Result<PooledClient> {
        let slots = self.current_or_init()?;

        let permit = match tokio::time::timeout(wait, Arc::clone(&slots.permits).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(InferenceError::PoolClosed),
            Err(_elapsed) => {
                tracing::warn!(waited = ?wait, "no pooled client became available");
                return Err(InferenceError::PoolExhausted { waited: wait });
            }
        };

        // A permit is only handed out while a handle is idle; an empty queue
        // means shutdown drained it underneath us.
        let client = slots.idle.pop().ok_or(InferenceError::PoolClosed)?;
        tracing::trace!(client = client.id(), "pooled client acquired");

        Ok(PooledClient {
            client: Some(client),
            slots,
            _permit: permit,
        })
    }

    /// Return a handle to the pool.  Equivalent to dropping the lease.
    pub fn release(&self, lease: PooledClient) {
        drop(lease);
    }

    /// Close the pool: waiters fail with [`InferenceError::PoolClosed`], idle
    /// handles are dropped, and leased handles are dropped when returned.
    /// A later [`acquire`](Self::acquire) builds a fresh set of handles.
    pub fn shutdown(&self) {
        let Some(slots) = self.lock().take() else {
            return;
        };
        slots.permits.close();
        let mut closed = 0usize;
        while slots.idle.pop().is_some() {
            closed += 1;
        }
        tracing::info!(closed, "client pool shut down");
    }

    /// Whether handles currently exist.
    pub fn is_initialized(&self) -> bool {
        self.lock().is_some()
    }

    /// Number of handles free right now (zero when uninitialized).
    pub fn available(&self) -> usize {
        self.lock()
            .as_ref()
            .map_or(0, |slots| slots.permits.available_permits())
    }

    /// Configured number of handles.
    pub fn size(&self) -> usize {
        self.config.size
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }
}

/// Exclusive lease on one pooled handle.
#[derive(Debug)]
pub struct PooledClient {
    client: Option<InferenceClient>,
    slots: Arc<Slots>,
    // Dropped after `Drop::drop` has pushed the handle back.
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledClient {
    type Target = InferenceClient;

    fn deref(&self) -> &InferenceClient {
        // Only `Drop` takes the handle out.
        self.client
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled client used after release"))
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        if self.slots.permits.is_closed() {
            tracing::trace!(client = client.id(), "pool closed, dropping returned client");
            return;
        }
        let id = client.id();
        if self.slots.idle.push(client).is_err() {
            tracing::warn!(client = id, "pool queue full, dropping returned client");
        } else {
            tracing::trace!(client = id, "pooled client released");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn pool(size: usize) -> ClientPool {
        ClientPool::new(
            ClientConfig::new("http://localhost:8001"),
            PoolConfig {
                size,
                acquire_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn initialize_creates_all_handles() {
        let p = pool(4);
        assert!(!p.is_initialized());
        assert_eq!(p.available(), 0);

        p.initialize().unwrap();
        assert!(p.is_initialized());
        assert_eq!(p.available(), 4);

        // Idempotent.
        p.initialize().unwrap();
        assert_eq!(p.available(), 4);
    }

    #[tokio::test]
    async fn lease_drop_returns_handle() {
        let p = pool(2);
        let a = p.acquire().await.unwrap();
        let b = p.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(p.available(), 0);

        drop(a);
        assert_eq!(p.available(), 1);
        p.release(b);
        assert_eq!(p.available(), 2);
    }

    #[tokio::test]
    async fn exhausted_pool_blocks_until_release() {
        let p = Arc::new(pool(2));
        let a = p.acquire().await.unwrap();
        let _b = p.acquire().await.unwrap();

        let waiter = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.acquire().await.map(|lease| lease.id()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let released = a.id();
        drop(a);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, released);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let p = pool(1);
        let _held = p.acquire().await.unwrap();
        let err = p
            .acquire_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_and_reinitializes() {
        let p = Arc::new(pool(1));
        let held = p.acquire().await.unwrap();

        let waiter = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        p.shutdown();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(InferenceError::PoolClosed)
        ));
        assert!(!p.is_initialized());

        // Returning a lease to a closed pool just drops the handle.
        drop(held);

        let fresh = p.acquire().await.unwrap();
        assert!(p.is_initialized());
        assert_eq!(fresh.id(), 0);
        assert_eq!(p.available(), 0);
    }

    #[test]
    fn failed_handle_creation_leaves_pool_empty() {
        let mut config = ClientConfig::new("http://localhost:8001");
        config.api_key = Some("line\nbreak".into());
        let p = ClientPool::new(config, PoolConfig::default());
        assert!(p.initialize().is_err());
        assert!(!p.is_initialized());
        assert_eq!(p.available(), 0);
    }

    #[test]
    fn zero_size_rejected() {
        assert!(matches!(
            pool(0).initialize(),
            Err(InferenceError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn three_handles_five_requests() {
        let p = Arc::new(pool(3));
        p.initialize().unwrap();
        let started = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let p = Arc::clone(&p);
                let started = Arc::clone(&started);
                tokio::spawn(async move {
                    let lease = p.acquire().await.unwrap();
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    drop(lease);
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(p.available(), 0);

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(started.load(Ordering::SeqCst), 5);
        assert_eq!(p.available(), 3);
    }
}
