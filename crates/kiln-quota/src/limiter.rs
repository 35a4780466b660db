//! Bounded worker pools with priority admission, one pool per quota category.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

use crate::adaptive::AdaptiveBatch;
use crate::config::QuotaConfig;
use crate::error::{QuotaError, QuotaFailure, Result};
use crate::metrics::{Outcome, QuotaMetrics, QuotaStats};

/// Quota category for per-chunk summarization calls.
pub const SUMMARIZATION: &str = "summarization";
/// Quota category for batched embedding calls.
pub const EMBEDDING: &str = "embedding";

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Lifecycle of a quota category: `stopped → starting → running → stopping → stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LimiterState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for LimiterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Job {
    priority: u32,
    seq: u64,
    run: JobFuture,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // The heap pops its maximum: lower priority value wins, then earlier submission.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Queue {
    state: LimiterState,
    jobs: BinaryHeap<Job>,
    next_seq: u64,
}

enum Next {
    Run(Job),
    Idle,
    Shutdown,
}

struct QuotaChannel {
    name: String,
    concurrency: usize,
    queue: Mutex<Queue>,
    stats: Mutex<QuotaStats>,
    notify: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QuotaChannel {
    fn new(name: String, config: &QuotaConfig) -> Self {
        Self {
            name,
            concurrency: config.concurrency.max(1),
            queue: Mutex::new(Queue {
                state: LimiterState::Stopped,
                jobs: BinaryHeap::new(),
                next_seq: 0,
            }),
            stats: Mutex::new(QuotaStats::new(AdaptiveBatch::new(config))),
            notify: Notify::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> LimiterState {
        lock(&self.queue).state
    }

    fn transition(&self, from: &[LimiterState], to: LimiterState) -> bool {
        let mut queue = lock(&self.queue);
        if !from.contains(&queue.state) {
            return false;
        }
        tracing::debug!(quota = %self.name, from = %queue.state, to = %to, "quota state transition");
        queue.state = to;
        true
    }

    fn enqueue(&self, priority: u32, run: JobFuture) -> Result<()> {
        {
            let mut queue = lock(&self.queue);
            if queue.state != LimiterState::Running {
                return Err(QuotaError::NotRunning {
                    quota: self.name.clone(),
                });
            }
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.jobs.push(Job { priority, seq, run });
        }
        lock(&self.stats).submitted += 1;
        self.notify.notify_one();
        Ok(())
    }

    fn next(&self) -> Next {
        let mut queue = lock(&self.queue);
        if let Some(job) = queue.jobs.pop() {
            return Next::Run(job);
        }
        match queue.state {
            LimiterState::Starting | LimiterState::Running => Next::Idle,
            LimiterState::Stopping | LimiterState::Stopped => Next::Shutdown,
        }
    }

    fn record(&self, outcome: Outcome, elapsed: Duration) {
        let mut stats = lock(&self.stats);
        if stats.record(outcome, elapsed) {
            tracing::debug!(
                quota = %self.name,
                batch_size = stats.batch.current(),
                "adaptive batch size changed"
            );
        }
    }

    fn batch_size(&self) -> usize {
        lock(&self.stats).batch.current()
    }

    fn metrics(&self) -> QuotaMetrics {
        let (state, queued) = {
            let queue = lock(&self.queue);
            (queue.state, queue.jobs.len())
        };
        lock(&self.stats).snapshot(&self.name, state, queued)
    }
}

async fn worker_loop(channel: Arc<QuotaChannel>) {
    loop {
        let notified = channel.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match channel.next() {
            Next::Run(job) => {
                // Run on a separate task so a panicking job cannot take the worker down.
                if let Err(e) = tokio::spawn(job.run).await {
                    tracing::warn!(quota = %channel.name, "quota task aborted: {e}");
                    channel.record(Outcome::Failure, Duration::ZERO);
                }
            }
            Next::Idle => notified.await,
            Next::Shutdown => break,
        }
    }
}

/// Concurrency and throughput governor for rate-limited external calls.
///
/// Cloning is cheap and shares the underlying pools.
#[derive(Clone)]
pub struct QuotaRateLimiter {
    channels: Arc<HashMap<String, Arc<QuotaChannel>>>,
}

impl fmt::Debug for QuotaRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaRateLimiter")
            .field("quotas", &self.quotas())
            .finish_non_exhaustive()
    }
}

impl QuotaRateLimiter {
    #[must_use]
    pub fn new<I, S>(quotas: I) -> Self
    where
        I: IntoIterator<Item = (S, QuotaConfig)>,
        S: Into<String>,
    {
        let channels = quotas
            .into_iter()
            .map(|(name, config)| {
                let name = name.into();
                let channel = Arc::new(QuotaChannel::new(name.clone(), &config));
                (name, channel)
            })
            .collect();
        Self {
            channels: Arc::new(channels),
        }
    }

    /// Registered quota names, sorted.
    #[must_use]
    pub fn quotas(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    fn channel(&self, quota: &str) -> Result<&Arc<QuotaChannel>> {
        self.channels
            .get(quota)
            .ok_or_else(|| QuotaError::UnknownQuota(quota.to_owned()))
    }

    /// Spin up the worker pool of every stopped category.
    ///
    /// Must be called from within a tokio runtime. Categories that are already
    /// running are left untouched.
    pub fn start(&self) {
        for channel in self.channels.values() {
            if !channel.transition(&[LimiterState::Stopped], LimiterState::Starting) {
                continue;
            }
            let handles: Vec<JoinHandle<()>> = (0..channel.concurrency)
                .map(|_| tokio::spawn(worker_loop(Arc::clone(channel))))
                .collect();
            lock(&channel.workers).extend(handles);
            channel.transition(&[LimiterState::Starting], LimiterState::Running);
        }
    }

    /// Reject new submissions, let queued and in-flight tasks finish, then halt workers.
    pub async fn stop(&self) {
        for channel in self.channels.values() {
            if channel.transition(
                &[LimiterState::Starting, LimiterState::Running],
                LimiterState::Stopping,
            ) {
                channel.notify.notify_waiters();
            }
        }

        for channel in self.channels.values() {
            let handles = std::mem::take(&mut *lock(&channel.workers));
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!(quota = %channel.name, "quota worker terminated abnormally: {e}");
                }
            }
            channel.transition(&[LimiterState::Stopping], LimiterState::Stopped);
        }
    }

    /// # Errors
    ///
    /// Returns [`QuotaError::UnknownQuota`] for an unregistered category.
    pub fn state(&self, quota: &str) -> Result<LimiterState> {
        Ok(self.channel(quota)?.state())
    }

    /// Run `task` under `quota`'s concurrency bound and wait for its result.
    ///
    /// Lower `priority` values are admitted first; equal priorities run in
    /// submission order. The limiter never retries: a failed task is reported
    /// back through the inner `Result` and feeds the adaptive batch size.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::NotRunning`] when the category is not running,
    /// [`QuotaError::UnknownQuota`] for an unregistered category, and
    /// [`QuotaError::Cancelled`] if the task panicked or was dropped.
    pub async fn submit<T, E, F>(
        &self,
        quota: &str,
        priority: u32,
        task: F,
    ) -> Result<std::result::Result<T, E>>
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: QuotaFailure + Send + 'static,
    {
        let channel = self.channel(quota)?;
        let (tx, rx) = oneshot::channel();
        let recorder = Arc::clone(channel);
        let run: JobFuture = Box::pin(async move {
            let started = Instant::now();
            let result = task.await;
            let outcome = match &result {
                Ok(_) => Outcome::Success,
                Err(e) if e.is_throttled() => Outcome::Throttled,
                Err(_) => Outcome::Failure,
            };
            // Recorded before the caller wakes so its next metrics read includes this call.
            recorder.record(outcome, started.elapsed());
            // The caller may have gone away; the call still counts toward the metrics.
            let _ = tx.send(result);
        });
        channel.enqueue(priority, run)?;
        rx.await.map_err(|_| QuotaError::Cancelled {
            quota: quota.to_owned(),
        })
    }

    /// Current recommended batch size for `quota`.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::UnknownQuota`] for an unregistered category.
    pub fn adaptive_batch_size(&self, quota: &str) -> Result<usize> {
        Ok(self.channel(quota)?.batch_size())
    }

    /// # Errors
    ///
    /// Returns [`QuotaError::UnknownQuota`] for an unregistered category.
    pub fn metrics(&self, quota: &str) -> Result<QuotaMetrics> {
        Ok(self.channel(quota)?.metrics())
    }

    /// Snapshots of every category, sorted by name.
    #[must_use]
    pub fn all_metrics(&self) -> Vec<QuotaMetrics> {
        self.quotas()
            .iter()
            .filter_map(|q| self.metrics(q).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    use super::*;

    #[derive(Debug)]
    struct Boom {
        throttled: bool,
    }

    impl QuotaFailure for Boom {
        fn is_throttled(&self) -> bool {
            self.throttled
        }
    }

    fn limiter(concurrency: usize) -> QuotaRateLimiter {
        QuotaRateLimiter::new([
            (
                SUMMARIZATION,
                QuotaConfig::default()
                    .with_concurrency(concurrency)
                    .with_batch_bounds(1, 8, 16),
            ),
            (
                EMBEDDING,
                QuotaConfig::default()
                    .with_concurrency(concurrency)
                    .with_batch_bounds(1, 32, 64),
            ),
        ])
    }

    async fn wait_until_queued(limiter: &QuotaRateLimiter, quota: &str, n: usize) {
        for _ in 0..500 {
            if limiter.metrics(quota).unwrap().queued >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("queue never reached {n}");
    }

    /// Wait until `n` submissions have been accepted and none is left waiting.
    async fn wait_until_taken(limiter: &QuotaRateLimiter, quota: &str, n: u64) {
        for _ in 0..500 {
            let m = limiter.metrics(quota).unwrap();
            if m.submitted == n && m.queued == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("worker never picked up {n} submissions");
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected() {
        let limiter = limiter(1);
        let result = limiter
            .submit(EMBEDDING, 0, async { Ok::<_, Boom>(1) })
            .await;
        assert!(matches!(result, Err(QuotaError::NotRunning { .. })));
        assert_eq!(limiter.state(EMBEDDING).unwrap(), LimiterState::Stopped);
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let limiter = limiter(1);
        limiter.start();
        limiter.stop().await;
        let result = limiter
            .submit(SUMMARIZATION, 0, async { Ok::<_, Boom>(()) })
            .await;
        assert!(matches!(result, Err(QuotaError::NotRunning { .. })));
        assert_eq!(limiter.state(SUMMARIZATION).unwrap(), LimiterState::Stopped);
    }

    #[tokio::test]
    async fn unknown_quota() {
        let limiter = limiter(1);
        assert!(matches!(
            limiter.adaptive_batch_size("nope"),
            Err(QuotaError::UnknownQuota(_))
        ));
        limiter.start();
        let result = limiter.submit("nope", 0, async { Ok::<_, Boom>(()) }).await;
        assert!(matches!(result, Err(QuotaError::UnknownQuota(_))));
        limiter.stop().await;
    }

    #[tokio::test]
    async fn runs_task_and_returns_its_result() {
        let limiter = limiter(2);
        limiter.start();
        assert_eq!(limiter.state(EMBEDDING).unwrap(), LimiterState::Running);

        let ok = limiter
            .submit(EMBEDDING, 3, async { Ok::<_, Boom>(42) })
            .await
            .unwrap();
        assert_eq!(ok.unwrap(), 42);

        let err = limiter
            .submit(EMBEDDING, 3, async { Err::<u8, _>(Boom { throttled: false }) })
            .await
            .unwrap();
        assert!(err.is_err());

        let m = limiter.metrics(EMBEDDING).unwrap();
        assert_eq!(m.submitted, 2);
        assert_eq!(m.succeeded, 1);
        assert_eq!(m.failed, 1);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn higher_priority_is_admitted_first() {
        let limiter = limiter(1);
        limiter.start();

        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let blocker = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .submit(SUMMARIZATION, 0, async move {
                        let _ = gate_rx.await;
                        Ok::<_, Boom>(())
                    })
                    .await
            })
        };
        wait_until_taken(&limiter, SUMMARIZATION, 1).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for priority in [5u32, 1, 3, 1] {
            let task_limiter = limiter.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                task_limiter
                    .submit(SUMMARIZATION, priority, async move {
                        order.lock().unwrap().push(priority);
                        Ok::<_, Boom>(())
                    })
                    .await
            }));
            // Keep submission order deterministic for the equal-priority tie.
            wait_until_queued(&limiter, SUMMARIZATION, handles.len()).await;
        }

        gate_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap().unwrap();
        for h in handles {
            h.await.unwrap().unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![1, 1, 3, 5]);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let limiter = limiter(2);
        limiter.start();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                limiter
                    .submit(EMBEDDING, 1, async move {
                        let now = in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        peak.fetch_max(now, AtomicOrdering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
                        Ok::<_, Boom>(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap().unwrap();
        }
        assert!(peak.load(AtomicOrdering::SeqCst) <= 2);
        assert_eq!(limiter.metrics(EMBEDDING).unwrap().succeeded, 8);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn failures_shrink_only_their_own_quota() {
        let limiter = limiter(1);
        limiter.start();
        let summarization_before = limiter.adaptive_batch_size(SUMMARIZATION).unwrap();

        for _ in 0..10 {
            let _ = limiter
                .submit(EMBEDDING, 0, async { Err::<(), _>(Boom { throttled: true }) })
                .await
                .unwrap();
        }

        assert_eq!(limiter.adaptive_batch_size(EMBEDDING).unwrap(), 1);
        assert_eq!(
            limiter.adaptive_batch_size(SUMMARIZATION).unwrap(),
            summarization_before
        );
        let m = limiter.metrics(EMBEDDING).unwrap();
        assert_eq!(m.throttled, 10);
        assert_eq!(m.failed, 0);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn stalled_quota_does_not_block_another() {
        let limiter = limiter(1);
        limiter.start();

        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let stalled = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .submit(EMBEDDING, 0, async move {
                        let _ = gate_rx.await;
                        Ok::<_, Boom>(())
                    })
                    .await
            })
        };

        let done = tokio::time::timeout(
            Duration::from_secs(2),
            limiter.submit(SUMMARIZATION, 0, async { Ok::<_, Boom>("summary") }),
        )
        .await
        .expect("summarization must not wait on embedding");
        assert_eq!(done.unwrap().unwrap(), "summary");

        gate_tx.send(()).unwrap();
        stalled.await.unwrap().unwrap().unwrap();
        limiter.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_queued_work() {
        let limiter = limiter(1);
        limiter.start();

        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let blocker = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .submit(EMBEDDING, 0, async move {
                        let _ = gate_rx.await;
                        Ok::<_, Boom>(0)
                    })
                    .await
            })
        };
        wait_until_taken(&limiter, EMBEDDING, 1).await;

        let mut handles = Vec::new();
        for i in 1..=3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .submit(EMBEDDING, 1, async move { Ok::<_, Boom>(i) })
                    .await
            }));
        }
        wait_until_queued(&limiter, EMBEDDING, 3).await;

        let stopper = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.stop().await })
        };
        for _ in 0..500 {
            if limiter.state(EMBEDDING).unwrap() == LimiterState::Stopping {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(matches!(
            limiter
                .submit(EMBEDDING, 0, async { Ok::<_, Boom>(9) })
                .await,
            Err(QuotaError::NotRunning { .. })
        ));

        gate_tx.send(()).unwrap();
        assert_eq!(blocker.await.unwrap().unwrap().unwrap(), 0);
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap().unwrap());
        }
        results.sort_unstable();
        assert_eq!(results, vec![1, 2, 3]);

        stopper.await.unwrap();
        assert_eq!(limiter.state(EMBEDDING).unwrap(), LimiterState::Stopped);
    }

    #[tokio::test]
    async fn panicking_task_is_cancelled_and_worker_survives() {
        let limiter = limiter(1);
        limiter.start();

        let result = limiter
            .submit(SUMMARIZATION, 0, async {
                if true {
                    panic!("boom");
                }
                Ok::<(), Boom>(())
            })
            .await;
        assert!(matches!(result, Err(QuotaError::Cancelled { .. })));

        let ok = limiter
            .submit(SUMMARIZATION, 0, async { Ok::<_, Boom>(7) })
            .await
            .unwrap();
        assert_eq!(ok.unwrap(), 7);
        assert_eq!(limiter.metrics(SUMMARIZATION).unwrap().failed, 1);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let limiter = limiter(1);
        limiter.start();
        limiter.stop().await;
        limiter.start();
        let ok = limiter
            .submit(EMBEDDING, 0, async { Ok::<_, Boom>(1) })
            .await
            .unwrap();
        assert_eq!(ok.unwrap(), 1);
        limiter.stop().await;
    }

    #[test]
    fn job_ordering_prefers_low_priority_then_fifo() {
        let job = |priority, seq| Job {
            priority,
            seq,
            run: Box::pin(async {}),
        };
        let mut heap = BinaryHeap::new();
        heap.push(job(2, 0));
        heap.push(job(0, 2));
        heap.push(job(0, 1));
        heap.push(job(1, 3));
        let order: Vec<(u32, u64)> = std::iter::from_fn(|| heap.pop().map(|j| (j.priority, j.seq))).collect();
        assert_eq!(order, vec![(0, 1), (0, 2), (1, 3), (2, 0)]);
    }
}
