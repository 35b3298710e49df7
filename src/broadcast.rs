use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::HubError;
use crate::protocol::Sample;
use crate::registry::{ConnectionId, ConnectionRegistry, PeerSink};

/// Outcome of fanning one sample out to the registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Totals reported when the dispatcher stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub samples: u64,
    pub deliveries: u64,
    pub evictions: u64,
}

impl DispatcherStats {
    fn record(&mut self, report: &BroadcastReport) {
        self.samples += 1;
        self.deliveries += report.delivered as u64;
        self.evictions += report.evicted.len() as u64;
    }
}

/// Spawn the single consumer of the dispatch queue.
///
/// Runs until every queue sender is dropped or `shutdown` flips to true. On
/// shutdown the queue is closed and only the samples already in it are
/// broadcast. Whatever connections are still registered are then closed.
pub fn spawn_dispatcher(
    registry: Arc<ConnectionRegistry>,
    mut queue: mpsc::Receiver<Sample>,
    write_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<DispatcherStats> {
    tokio::spawn(async move {
        let mut stats = DispatcherStats::default();
        tracing::info!("Broadcast dispatcher started");

        loop {
            let sample = tokio::select! {
                // Shutdown wins even while producers keep the queue busy
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Dispatcher shutdown requested");
                        break;
                    }
                    continue;
                }
                next = queue.recv() => match next {
                    Some(sample) => sample,
                    None => {
                        tracing::info!("Dispatch queue closed");
                        break;
                    }
                },
            };

            let report = broadcast_sample(&registry, &sample, write_timeout).await;
            stats.record(&report);
        }

        // Blocked producers fail fast; what was already accepted still goes out
        queue.close();
        while let Some(sample) = queue.recv().await {
            let report = broadcast_sample(&registry, &sample, write_timeout).await;
            stats.record(&report);
        }

        for (id, mut sink) in registry.drain().await {
            tracing::debug!(connection = %id, "Closing connection on dispatcher stop");
            close_sink(id, sink.as_mut(), write_timeout).await;
        }

        tracing::info!(
            samples = stats.samples,
            deliveries = stats.deliveries,
            evictions = stats.evictions,
            "Broadcast dispatcher stopped"
        );
        stats
    })
}

/// Write one sample to every registered connection.
///
/// The registry stays locked for the whole pass. A failed or timed-out write
/// evicts that connection: its reader is signalled to stop and its sink is
/// closed. The remaining members are still attempted.
pub async fn broadcast_sample(
    registry: &ConnectionRegistry,
    sample: &Sample,
    write_timeout: Duration,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    let payload = match sample.encode() {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to encode sample: {}", e);
            return report;
        }
    };

    let mut members = registry.lock().await;
    for (id, member) in members.iter_mut() {
        let write = member.sink.send(&payload);
        let result = match tokio::time::timeout(write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(HubError::WriteTimeout(write_timeout)),
        };

        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                tracing::warn!(connection = %id, "Error writing sample: {}", e);
                report.evicted.push(*id);
            }
        }
    }

    for id in &report.evicted {
        if let Some(member) = members.remove(id) {
            let mut sink = member.evict();
            close_sink(*id, sink.as_mut(), write_timeout).await;
        }
    }

    tracing::trace!(
        delivered = report.delivered,
        evicted = report.evicted.len(),
        peers = members.len(),
        "Sample broadcast"
    );
    report
}

async fn close_sink(id: ConnectionId, sink: &mut dyn PeerSink, write_timeout: Duration) {
    if tokio::time::timeout(write_timeout, sink.close()).await.is_err() {
        // The reader drops the rest of the socket once it sees the eviction
        tracing::debug!(connection = %id, "Close timed out after {:?}", write_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubResult;
    use crate::registry::tests::RecordingSink;
    use crate::registry::PeerSink;
    use async_trait::async_trait;

    const TIMEOUT: Duration = Duration::from_millis(200);

    /// Sink whose writes never complete
    struct HungSink;

    #[async_trait]
    impl PeerSink for HungSink {
        async fn send(&mut self, _payload: &str) -> HubResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn close(&mut self) {}
    }

    /// Write fails and the close never completes
    struct StuckCloseSink;

    #[async_trait]
    impl PeerSink for StuckCloseSink {
        async fn send(&mut self, _payload: &str) -> HubResult<()> {
            Err(HubError::PeerClosed)
        }

        async fn close(&mut self) {
            std::future::pending::<()>().await;
        }
    }

    async fn register(registry: &ConnectionRegistry, sink: RecordingSink) -> ConnectionId {
        let id = ConnectionId::new();
        registry.register(id, Box::new(sink)).await;
        id
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let registry = ConnectionRegistry::new();
        let sinks: Vec<RecordingSink> = (0..3).map(|_| RecordingSink::default()).collect();
        for sink in &sinks {
            register(&registry, sink.clone()).await;
        }

        let sample = Sample::new("0101", "100", "100");
        let report = broadcast_sample(&registry, &sample, TIMEOUT).await;

        assert_eq!(report.delivered, 3);
        assert!(report.evicted.is_empty());
        for sink in &sinks {
            assert_eq!(
                sink.sent(),
                vec![r#"{"ir":"0101","bpm":"100","average_bpm":"100"}"#.to_string()]
            );
        }
    }

    #[tokio::test]
    async fn test_failed_write_evicts_and_continues() {
        let registry = ConnectionRegistry::new();
        let healthy_a = RecordingSink::default();
        let broken = RecordingSink::failing();
        let healthy_b = RecordingSink::default();

        register(&registry, healthy_a.clone()).await;
        let broken_id = ConnectionId::new();
        let reader_signal = registry
            .register(broken_id, Box::new(broken.clone()))
            .await
            .unwrap();
        register(&registry, healthy_b.clone()).await;

        let report = broadcast_sample(&registry, &Sample::new("1", "2", "3"), TIMEOUT).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.evicted, vec![broken_id]);
        assert_eq!(healthy_a.sent().len(), 1);
        assert_eq!(healthy_b.sent().len(), 1);
        assert_eq!(broken.close_count(), 1);
        assert!(!registry.contains(broken_id).await);
        assert_eq!(registry.len().await, 2);

        // The evicted connection's reader is told to stop
        assert!(reader_signal.await.is_ok());

        // A later unregister from the read side is a no-op
        assert!(registry.unregister(broken_id).await.is_none());
    }

    #[tokio::test]
    async fn test_hung_write_times_out_without_blocking_others() {
        let registry = ConnectionRegistry::new();
        let healthy = RecordingSink::default();
        let hung_id = ConnectionId::new();
        registry.register(hung_id, Box::new(HungSink)).await;
        register(&registry, healthy.clone()).await;

        let report = broadcast_sample(&registry, &Sample::new("1", "2", "3"), TIMEOUT).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![hung_id]);
        assert_eq!(healthy.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_close_is_bounded_by_write_timeout() {
        let registry = ConnectionRegistry::new();
        let healthy = RecordingSink::default();
        let stuck_id = ConnectionId::new();
        registry.register(stuck_id, Box::new(StuckCloseSink)).await;
        register(&registry, healthy.clone()).await;

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            broadcast_sample(&registry, &Sample::new("1", "2", "3"), TIMEOUT),
        )
        .await
        .expect("stuck close must not block the broadcast");

        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![stuck_id]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_registry() {
        let registry = ConnectionRegistry::new();
        let report = broadcast_sample(&registry, &Sample::default(), TIMEOUT).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_dispatcher_preserves_queue_order() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sinks: Vec<RecordingSink> = (0..2).map(|_| RecordingSink::default()).collect();
        for sink in &sinks {
            register(&registry, sink.clone()).await;
        }

        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_dispatcher(registry.clone(), rx, TIMEOUT, shutdown_rx);

        // Two producers interleaving on the same queue
        let producer_a = tx.clone();
        let producer_b = tx;
        for n in 0..10 {
            let producer = if n % 2 == 0 { &producer_a } else { &producer_b };
            producer
                .send(Sample::new(n.to_string(), "60", "60"))
                .await
                .unwrap();
        }
        drop(producer_a);
        drop(producer_b);

        let stats = handle.await.unwrap();
        assert_eq!(stats.samples, 10);
        assert_eq!(stats.deliveries, 20);

        for sink in &sinks {
            let waveforms: Vec<String> = sink
                .sent()
                .iter()
                .map(|json| Sample::decode(json.as_bytes()).unwrap().waveform)
                .collect();
            let expected: Vec<String> = (0..10).map(|n| n.to_string()).collect();
            assert_eq!(waveforms, expected);
            // Closed when the dispatcher stopped
            assert_eq!(sink.close_count(), 1);
        }
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_dispatcher_stops_on_shutdown_signal() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = RecordingSink::default();
        register(&registry, sink.clone()).await;

        let (_tx, rx) = mpsc::channel::<Sample>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_dispatcher(registry.clone(), rx, TIMEOUT, shutdown_rx);

        shutdown_tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("dispatcher should stop")
            .unwrap();

        assert_eq!(stats, DispatcherStats::default());
        assert_eq!(sink.close_count(), 1);
        assert!(registry.is_empty().await);
    }

    /// Sink that takes a while per write, keeping the dispatcher busy
    #[derive(Clone, Default)]
    struct SlowSink {
        writes: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl PeerSink for SlowSink {
        async fn send(&mut self, _payload: &str) -> HubResult<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.writes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_dispatcher_stops_while_queue_stays_full() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = SlowSink::default();
        registry
            .register(ConnectionId::new(), Box::new(sink.clone()))
            .await;

        let (tx, rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_dispatcher(registry.clone(), rx, TIMEOUT, shutdown_rx);

        // Producer that never lets the queue go empty
        let producer = tokio::spawn(async move {
            let mut sent = 0u64;
            while tx.send(Sample::new(sent.to_string(), "60", "60")).await.is_ok() {
                sent += 1;
            }
            sent
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("dispatcher should stop under sustained load")
            .unwrap();
        let sent = tokio::time::timeout(Duration::from_secs(3), producer)
            .await
            .expect("producer should see the closed queue")
            .unwrap();

        // Everything the queue accepted was broadcast, nothing more
        assert_eq!(stats.samples, sent);
        assert_eq!(
            sink.writes.load(std::sync::atomic::Ordering::SeqCst) as u64,
            sent
        );
        assert!(registry.is_empty().await);
    }
}
