//! In-process backfill worker.
//!
//! Requests arrive on a bounded channel. Each request runs as its own task,
//! at most `max_concurrent` at a time; the receive loop stops pulling from
//! the channel while every slot is busy. A request whose key is already being
//! backfilled is dropped, since the running job will write the same answer.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::cache::EvidenceKey;

use super::{BackfillDispatcher, BackfillError, BackfillJob, BackfillRequest, DispatchError};

/// Handle used to queue backfill requests. Cheap to clone.
#[derive(Clone)]
pub struct BackfillSender {
    tx: mpsc::Sender<BackfillRequest>,
}

impl BackfillDispatcher for BackfillSender {
    fn dispatch(&self, request: BackfillRequest) -> Result<(), DispatchError> {
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::QueueClosed,
        })
    }
}

/// The background service that runs queued backfills.
pub struct BackfillService {
    handle: JoinHandle<()>,
}

impl BackfillService {
    /// Spawn the backfill service.
    ///
    /// Returns a `(BackfillSender, BackfillService)` pair. The service stops
    /// once every sender is dropped and the running jobs have finished.
    pub fn spawn(
        job: Arc<BackfillJob>,
        buffer_size: usize,
        max_concurrent: usize,
    ) -> (BackfillSender, Self) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let handle = tokio::spawn(Self::run(rx, job, max_concurrent.max(1)));
        (BackfillSender { tx }, Self { handle })
    }

    async fn run(
        mut rx: mpsc::Receiver<BackfillRequest>,
        job: Arc<BackfillJob>,
        max_concurrent: usize,
    ) {
        let in_flight: Arc<Mutex<HashSet<EvidenceKey>>> = Arc::new(Mutex::new(HashSet::new()));
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut tasks = JoinSet::new();

        while let Some(request) = rx.recv().await {
            // Reap finished tasks so the set does not grow unbounded.
            while tasks.try_join_next().is_some() {}

            let key = request.key();
            if !in_flight.lock().await.insert(key) {
                tracing::debug!(
                    target: "evidence_resolver::backfill::service",
                    key = %key,
                    "Backfill already in flight, skipping duplicate request"
                );
                continue;
            }

            // Waiting here leaves later requests in the channel, so a full
            // queue surfaces as `DispatchError::QueueFull`.
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                in_flight.lock().await.remove(&key);
                break;
            };

            let job = job.clone();
            let in_flight = in_flight.clone();

            tasks.spawn(async move {
                log_result(&key, job.run(request).await);
                drop(permit);
                in_flight.lock().await.remove(&key);
            });
        }

        let pending = tasks.len();
        if pending > 0 {
            tracing::info!(
                target: "evidence_resolver::backfill::service",
                pending,
                "Waiting for running backfills to finish"
            );
        }
        while tasks.join_next().await.is_some() {}

        tracing::info!(
            target: "evidence_resolver::backfill::service",
            "Backfill service shutting down"
        );
    }

    /// Wait for the service to finish.
    pub async fn join(self) {
        let _ = self.handle.await;
    }

    /// Abort the background task.
    pub fn abort(self) {
        self.handle.abort();
    }
}

fn log_result(key: &EvidenceKey, result: Result<super::BackfillReport, BackfillError>) {
    match result {
        Ok(report) => tracing::debug!(
            target: "evidence_resolver::backfill::service",
            key = %key,
            uri = %report.uri,
            "Queued backfill finished"
        ),
        Err(BackfillError::AlreadyResolved { .. } | BackfillError::AlreadyClaimed(_)) => {}
        Err(e @ BackfillError::NotFoundInHistory { .. }) => tracing::warn!(
            target: "evidence_resolver::backfill::service",
            key = %key,
            error = %e,
            "Queued backfill found nothing"
        ),
        Err(e) => tracing::error!(
            target: "evidence_resolver::backfill::service",
            key = %key,
            error = %e,
            "Queued backfill failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::tests::{test_job, ARBITRABLE};
    use crate::cache::ResolutionCache;
    use crate::network::Network;
    use crate::scan::SampleScanner;
    use alloy::primitives::U256;
    use std::time::Duration;

    fn request() -> BackfillRequest {
        BackfillRequest {
            network: Network::Gnosis,
            emitter: ARBITRABLE,
            reference_id: U256::from(5),
            end_block: 90,
        }
    }

    async fn wait_for_uri(cache: &ResolutionCache, key: &EvidenceKey) -> Option<String> {
        for _ in 0..100 {
            if let Some(record) = cache.lookup(key).await.unwrap() {
                return Some(record.uri);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_dispatched_request_is_backfilled() {
        let scanner = Arc::new(
            SampleScanner::new()
                .with_event(Network::Gnosis, ARBITRABLE, U256::from(5), 42, "/ipfs/queued")
                .with_head(Network::Gnosis, 1_000),
        );
        let (job, cache) = test_job(scanner).await;
        let (sender, service) = BackfillService::spawn(Arc::new(job), 8, 2);

        sender.dispatch(request()).unwrap();

        assert_eq!(
            wait_for_uri(&cache, &request().key()).await.as_deref(),
            Some("/ipfs/queued")
        );

        drop(sender);
        service.join().await;
    }

    #[tokio::test]
    async fn test_duplicate_requests_scan_once() {
        let scanner = Arc::new(
            SampleScanner::new()
                .with_event(Network::Gnosis, ARBITRABLE, U256::from(5), 42, "/ipfs/once")
                .with_head(Network::Gnosis, 1_000)
                .with_delay(0, Duration::from_millis(100)),
        );
        let (job, cache) = test_job(scanner.clone()).await;
        let (sender, service) = BackfillService::spawn(Arc::new(job), 8, 2);

        sender.dispatch(request()).unwrap();
        sender.dispatch(request()).unwrap();
        sender.dispatch(request()).unwrap();

        // Dropping the last sender drains the queue and waits for running jobs.
        drop(sender);
        service.join().await;

        assert_eq!(
            cache.lookup(&request().key()).await.unwrap().map(|r| r.uri),
            Some("/ipfs/once".to_string())
        );
        assert_eq!(scanner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_requests() {
        let scanner = Arc::new(
            SampleScanner::new()
                .with_head(Network::Gnosis, 1_000)
                .with_delay(0, Duration::from_secs(2)),
        );
        let (job, _cache) = test_job(scanner).await;
        let (sender, service) = BackfillService::spawn(Arc::new(job), 1, 1);

        let keyed = |id: u64| BackfillRequest {
            reference_id: U256::from(id),
            ..request()
        };

        // First request takes the only worker slot.
        sender.dispatch(keyed(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Second is pulled off the channel and waits for the slot.
        sender.dispatch(keyed(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Third fills the channel.
        sender.dispatch(keyed(3)).unwrap();

        let rejected = (4..200)
            .map(|id| sender.dispatch(keyed(id)))
            .filter(|r| matches!(r, Err(DispatchError::QueueFull)))
            .count();
        assert_eq!(rejected, 196);

        service.abort();
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let (job, _cache) = test_job(Arc::new(SampleScanner::new())).await;
        let (sender, service) = BackfillService::spawn(Arc::new(job), 1, 1);

        service.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            sender.dispatch(request()),
            Err(DispatchError::QueueClosed)
        ));
    }
}
