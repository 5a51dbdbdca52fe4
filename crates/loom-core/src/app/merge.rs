//! Lossy, concurrency-bounded merge.
//!
//! `merge_lossy` turns a stream of triggers into a stream of results, running
//! at most `max` sub-operations at a time. Triggers that arrive while the stage
//! is full are dropped, not queued: every trigger is an idempotent "go look at
//! the Store" signal, and a later trigger or the periodic sweep covers the lost
//! one.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// In-flight counter of one pipeline stage.
#[derive(Debug)]
pub struct ConcurrencyCounter {
    stage: &'static str,
    count: AtomicUsize,
    max: usize,
    dropped: AtomicU64,
}

/// Releases one slot of its counter when dropped.
#[derive(Debug)]
pub struct CounterPermit {
    counter: Arc<ConcurrencyCounter>,
}

impl Drop for CounterPermit {
    fn drop(&mut self) {
        self.counter.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time view of a stage counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub stage: &'static str,
    pub in_flight: usize,
    pub max: usize,
    pub dropped: u64,
}

impl ConcurrencyCounter {
    pub fn new(stage: &'static str, max: usize) -> Arc<Self> {
        Arc::new(Self {
            stage,
            count: AtomicUsize::new(0),
            max,
            dropped: AtomicU64::new(0),
        })
    }

    /// Take a slot if `count < max`; otherwise record a dropped trigger.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CounterPermit> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(CounterPermit {
                        counter: Arc::clone(self),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> StageStatus {
        StageStatus {
            stage: self.stage,
            in_flight: self.count(),
            max: self.max,
            dropped: self.dropped(),
        }
    }
}

/// Merge the results of `operation` applied to each trigger.
///
/// - At most `counter.max()` operations run concurrently; excess triggers are
///   dropped.
/// - Every value of an `Ok(Vec<_>)` is forwarded in completion order.
/// - The first error (or panic) is forwarded as the last item; the other
///   in-flight operations are aborted.
/// - When `triggers` closes, the stream ends once nothing is in flight.
/// - `shutdown` stops consumption; in-flight operations are left running.
pub fn merge_lossy<T, O, E, F, Fut>(
    mut triggers: mpsc::UnboundedReceiver<T>,
    counter: Arc<ConcurrencyCounter>,
    shutdown: CancellationToken,
    operation: F,
) -> mpsc::UnboundedReceiver<Result<O, E>>
where
    T: Send + 'static,
    O: Send + 'static,
    E: From<JoinError> + Send + 'static,
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<O>, E>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut in_flight: JoinSet<Result<Vec<O>, E>> = JoinSet::new();
        let mut accepting = true;

        loop {
            if !accepting && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    in_flight.detach_all();
                    break;
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined.map_err(E::from).and_then(|result| result) {
                        Ok(outputs) => {
                            for output in outputs {
                                if tx.send(Ok(output)).is_err() {
                                    in_flight.abort_all();
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            in_flight.abort_all();
                            let _ = tx.send(Err(err));
                            return;
                        }
                    }
                }

                trigger = triggers.recv(), if accepting => {
                    match trigger {
                        Some(trigger) => match counter.try_acquire() {
                            Some(permit) => {
                                let work = operation(trigger);
                                in_flight.spawn(async move {
                                    let _permit = permit;
                                    work.await
                                });
                            }
                            None => trace!(
                                stage = counter.stage(),
                                max = counter.max(),
                                "stage at capacity, dropping trigger"
                            ),
                        },
                        None => accepting = false,
                    }
                }
            }
        }
    });

    rx
}

/// Forward the `Ok` values of a merged stream; a terminal error is logged and
/// closes the forwarded stream.
pub fn ok_values<T, E>(
    mut results: mpsc::UnboundedReceiver<Result<T, E>>,
    stage: &'static str,
) -> mpsc::UnboundedReceiver<T>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            match result {
                Ok(value) => {
                    if tx.send(value).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(stage, error = %err, "pipeline stage terminated");
                    break;
                }
            }
        }
    });
    rx
}

/// Consume a terminal stage, discarding its values.
pub fn drain<T, E>(results: mpsc::UnboundedReceiver<Result<T, E>>, stage: &'static str) -> JoinHandle<()>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    let mut values = ok_values(results, stage);
    tokio::spawn(async move { while values.recv().await.is_some() {} })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoomError, StoreError};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn excess_triggers_are_dropped_and_counter_returns_to_zero() {
        let counter = ConcurrencyCounter::new("test", 2);
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        let op_gate = gate.clone();
        let op_started = started.clone();
        let mut results = merge_lossy(
            rx,
            counter.clone(),
            CancellationToken::new(),
            move |n: u32| {
                let gate = op_gate.clone();
                let started = op_started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    let _permit = gate.acquire().await.map_err(|_| {
                        LoomError::Store(StoreError::Unavailable("gate closed".into()))
                    })?;
                    Ok::<_, LoomError>(vec![n])
                }
            },
        );

        // max + k triggers with k = 3
        for n in 0..5 {
            tx.send(n).unwrap();
        }
        wait_until(|| counter.dropped() == 3).await;
        assert_eq!(counter.count(), 2);

        gate.add_permits(10);
        drop(tx);

        let mut outputs = Vec::new();
        while let Some(result) = results.recv().await {
            outputs.push(result.unwrap());
        }
        outputs.sort();

        assert_eq!(outputs, vec![0, 1]);
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(counter.count(), 0);
    }

    #[tokio::test]
    async fn every_output_of_a_sub_operation_is_forwarded() {
        let counter = ConcurrencyCounter::new("test", 4);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut results = merge_lossy(rx, counter, CancellationToken::new(), |n: u32| async move {
            Ok::<_, LoomError>((0..n).collect::<Vec<_>>())
        });

        tx.send(3).unwrap();
        drop(tx);

        let mut outputs = Vec::new();
        while let Some(result) = results.recv().await {
            outputs.push(result.unwrap());
        }
        assert_eq!(outputs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn error_terminates_stream_and_releases_slots() {
        let counter = ConcurrencyCounter::new("test", 4);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut results = merge_lossy(
            rx,
            counter.clone(),
            CancellationToken::new(),
            |fail: bool| async move {
                if fail {
                    Err(LoomError::Store(StoreError::Unavailable("boom".into())))
                } else {
                    std::future::pending::<()>().await;
                    Ok(vec![()])
                }
            },
        );

        tx.send(false).unwrap();
        wait_until(|| counter.count() == 1).await;
        tx.send(true).unwrap();

        assert!(matches!(results.recv().await, Some(Err(LoomError::Store(_)))));
        assert!(results.recv().await.is_none());
        wait_until(|| counter.count() == 0).await;
    }

    #[tokio::test]
    async fn panic_is_reported_as_join_error() {
        let counter = ConcurrencyCounter::new("test", 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut results = merge_lossy(rx, counter.clone(), CancellationToken::new(), |_: ()| async {
            if true {
                panic!("sub-operation panicked");
            }
            Ok::<Vec<()>, LoomError>(vec![])
        });

        tx.send(()).unwrap();

        assert!(matches!(results.recv().await, Some(Err(LoomError::Join(_)))));
        wait_until(|| counter.count() == 0).await;
    }

    #[tokio::test]
    async fn shutdown_stops_consuming_triggers() {
        let counter = ConcurrencyCounter::new("test", 4);
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut results = merge_lossy(rx, counter.clone(), shutdown.clone(), |n: u32| async move {
            Ok::<_, LoomError>(vec![n])
        });

        shutdown.cancel();
        assert!(results.recv().await.is_none());

        let _ = tx.send(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.dropped(), 0);
    }

    #[tokio::test]
    async fn ok_values_stops_at_first_error() {
        let (tx, rx) = mpsc::unbounded_channel::<Result<u32, LoomError>>();
        let mut values = ok_values(rx, "test");

        tx.send(Ok(1)).unwrap();
        tx.send(Err(LoomError::LeaseLost("gone".into()))).unwrap();
        tx.send(Ok(2)).unwrap();

        assert_eq!(values.recv().await, Some(1));
        assert_eq!(values.recv().await, None);
    }
}
