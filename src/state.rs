use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::broadcast::{spawn_dispatcher, DispatcherStats};
use crate::config::HubConfig;
use crate::protocol::Sample;
use crate::registry::ConnectionRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub registry: Arc<ConnectionRegistry>,
    /// Producer side of the dispatch queue
    pub queue: mpsc::Sender<Sample>,
    /// Connection readers still running, evicted or not
    pub readers: Arc<AtomicUsize>,
    shutdown: Arc<watch::Sender<bool>>,
    dispatcher: Arc<Mutex<Option<JoinHandle<DispatcherStats>>>>,
}

impl AppState {
    /// Create the registry and queue and spawn the dispatcher.
    /// Must be called from within a Tokio runtime.
    pub fn start(config: HubConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = spawn_dispatcher(registry.clone(), rx, config.write_timeout, shutdown_rx);

        Self {
            config: Arc::new(config),
            registry,
            queue,
            readers: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(shutdown),
            dispatcher: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Stop the dispatcher and close every registered connection.
    ///
    /// Returns the dispatcher's totals the first time; later calls return None.
    pub async fn shutdown(&self) -> Option<DispatcherStats> {
        let handle = self.dispatcher.lock().await.take()?;
        // Receiver may already be gone if the dispatcher exited on its own
        let _ = self.shutdown.send(true);

        match handle.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::error!("Dispatcher task failed: {}", e);
                None
            }
        }
    }

    pub fn active_readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
