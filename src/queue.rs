//! Reduction Work Queue
//!
//! Worker pools over two independent lanes: single-frame reductions and
//! stacking jobs. A slow or failing stacking job never holds up frames.
//! Transient failures are re-queued with exponential backoff up to
//! `max_attempts`; permanent failures are reported once. Duplicate deliveries
//! of an in-flight item are coalesced onto the first.

use crate::config::QueueConfig;
use crate::error::ReductionError;
use crate::orchestrator::{Orchestrator, ReductionOutcome};
use crate::stacking::{StackingJob, StackingOutcome};
use crate::types::FrameId;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Task ID for tracking completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// One unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkItem {
    /// Reduce the raw frame at this location
    Frame(PathBuf),
    Stacking(StackingJob),
}

impl WorkItem {
    fn lane(&self) -> LaneKind {
        match self {
            WorkItem::Frame(_) => LaneKind::Frames,
            WorkItem::Stacking(_) => LaneKind::Stacking,
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Frame(path) => write!(f, "frame {}", path.display()),
            WorkItem::Stacking(job) => write!(
                f,
                "stack {} {} {}",
                job.frame_type, job.instrument, job.window
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkStatus {
    Reduced { frame_id: FrameId },
    Skipped { reason: String },
    Stacked { masters: Vec<FrameId> },
    /// The readiness oracle never reported the window complete
    NotReady,
    Failed { error: String, retryable: bool },
}

impl WorkStatus {
    fn failed(error: &ReductionError) -> Self {
        WorkStatus::Failed {
            error: error.to_string(),
            retryable: error.is_retryable(),
        }
    }

    fn should_retry(&self) -> bool {
        match self {
            WorkStatus::NotReady => true,
            WorkStatus::Failed { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, WorkStatus::Failed { .. })
    }
}

/// Final report for one work item
#[derive(Debug, Clone, PartialEq)]
pub struct WorkReport {
    pub task_id: TaskId,
    pub item: WorkItem,
    pub attempts: usize,
    pub status: WorkStatus,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneKind {
    Frames,
    Stacking,
}

struct Task {
    id: TaskId,
    item: WorkItem,
    attempts: usize,
}

#[derive(Default)]
struct Lane {
    tasks: Mutex<VecDeque<Task>>,
    notify: Notify,
}

struct DedupeEntry {
    task_id: TaskId,
    waiters: Vec<oneshot::Sender<WorkReport>>,
}

struct Shared {
    orchestrator: Arc<Orchestrator>,
    config: QueueConfig,
    frames: Lane,
    stacking: Lane,
    running: RwLock<bool>,
    stats: RwLock<QueueStats>,
    reports: RwLock<Vec<WorkReport>>,
    /// Active items (queued or in flight) by identity
    dedupe: Mutex<HashMap<WorkItem, DedupeEntry>>,
}

impl Shared {
    fn lane(&self, kind: LaneKind) -> &Lane {
        match kind {
            LaneKind::Frames => &self.frames,
            LaneKind::Stacking => &self.stacking,
        }
    }
}

pub struct ReductionQueue {
    shared: Arc<Shared>,
    workers: RwLock<Vec<JoinHandle<()>>>,
}

impl ReductionQueue {
    pub fn new(orchestrator: Arc<Orchestrator>, config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                orchestrator,
                config,
                frames: Lane::default(),
                stacking: Lane::default(),
                running: RwLock::new(false),
                stats: RwLock::new(QueueStats::default()),
                reports: RwLock::new(Vec::new()),
                dedupe: Mutex::new(HashMap::new()),
            }),
            workers: RwLock::new(Vec::new()),
        }
    }

    /// Enqueue an item (returns immediately). An item already queued or in
    /// flight returns the existing task id.
    pub async fn enqueue(&self, item: WorkItem) -> Result<TaskId, ReductionError> {
        let mut dedupe = self.shared.dedupe.lock().await;
        if let Some(entry) = dedupe.get(&item) {
            debug!(task_id = entry.task_id.as_u64(), item = %item, "Work item deduplicated");
            return Ok(entry.task_id);
        }
        let task_id = self.push(&mut dedupe, item).await?;
        Ok(task_id)
    }

    /// Enqueue an item and wait for its final report.
    pub async fn enqueue_and_wait(
        &self,
        item: WorkItem,
        timeout: Option<Duration>,
    ) -> Result<WorkReport, ReductionError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut dedupe = self.shared.dedupe.lock().await;
            if let Some(entry) = dedupe.get_mut(&item) {
                debug!(task_id = entry.task_id.as_u64(), item = %item, "Waiting on in-flight work item");
                entry.waiters.push(tx);
            } else {
                let task_id = self.push(&mut dedupe, item.clone()).await?;
                if let Some(entry) = dedupe.get_mut(&item) {
                    entry.waiters.push(tx);
                } else {
                    return Err(ReductionError::Transient(format!(
                        "task {} vanished before it could be awaited",
                        task_id.as_u64()
                    )));
                }
            }
        }

        let closed = || ReductionError::Transient("completion channel closed".to_string());
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| ReductionError::Transient("timeout waiting for work item".to_string()))?
                .map_err(|_| closed()),
            None => rx.await.map_err(|_| closed()),
        }
    }

    async fn push(
        &self,
        dedupe: &mut HashMap<WorkItem, DedupeEntry>,
        item: WorkItem,
    ) -> Result<TaskId, ReductionError> {
        let lane = self.shared.lane(item.lane());
        let mut tasks = lane.tasks.lock().await;
        if tasks.len() >= self.shared.config.max_queue_size {
            warn!(
                queue_size = tasks.len(),
                max_size = self.shared.config.max_queue_size,
                "Work queue is full, rejecting item"
            );
            return Err(ReductionError::Transient("work queue is full".to_string()));
        }

        let task_id = TaskId::next();
        debug!(task_id = task_id.as_u64(), item = %item, "Enqueued work item");
        dedupe.insert(
            item.clone(),
            DedupeEntry {
                task_id,
                waiters: Vec::new(),
            },
        );
        tasks.push_back(Task {
            id: task_id,
            item,
            attempts: 0,
        });
        drop(tasks);

        self.shared.stats.write().pending += 1;
        lane.notify.notify_one();
        Ok(task_id)
    }

    /// Start background workers for both lanes
    pub fn start(&self) {
        let mut running = self.shared.running.write();
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let mut workers = self.workers.write();
        let lanes = [
            (LaneKind::Frames, self.shared.config.frame_workers),
            (LaneKind::Stacking, self.shared.config.stacking_workers),
        ];
        for (kind, count) in lanes {
            for worker_id in 0..count.max(1) {
                let shared = Arc::clone(&self.shared);
                workers.push(tokio::spawn(async move {
                    worker_loop(shared, kind, worker_id).await;
                }));
            }
        }
        info!(worker_count = workers.len(), "Started reduction queue workers");
    }

    /// Stop background workers (graceful shutdown)
    pub async fn stop(&self) {
        {
            let mut running = self.shared.running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        let workers = std::mem::take(&mut *self.workers.write());
        for handle in workers {
            let _ = handle.await;
        }
        info!("Stopped reduction queue workers");
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats.read().clone()
    }

    /// Final reports of every finished item, in completion order
    pub fn reports(&self) -> Vec<WorkReport> {
        self.shared.reports.read().clone()
    }

    /// Wait until both lanes are drained and nothing is in flight.
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<(), ReductionError> {
        let start = Instant::now();
        loop {
            let idle = {
                let stats = self.shared.stats.read();
                stats.pending == 0 && stats.processing == 0
            };
            if idle {
                return Ok(());
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(ReductionError::Transient(
                        "timeout waiting for queue to drain".to_string(),
                    ));
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Delay before attempt `attempt + 1`
fn backoff(config: &QueueConfig, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as u32;
    let delay = config.backoff_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(config.max_backoff_ms))
}

async fn worker_loop(shared: Arc<Shared>, kind: LaneKind, worker_id: usize) {
    debug!(worker_id, lane = ?kind, "Worker started");
    let lane = shared.lane(kind);

    while *shared.running.read() {
        let next = lane.tasks.lock().await.pop_front();
        let Some(mut task) = next else {
            tokio::select! {
                _ = lane.notify.notified() => continue,
                _ = sleep(Duration::from_millis(100)) => continue,
            }
        };

        {
            let mut stats = shared.stats.write();
            stats.pending = stats.pending.saturating_sub(1);
            stats.processing += 1;
        }
        task.attempts += 1;
        let status = process(&shared.orchestrator, &task.item).await;
        let retry = status.should_retry() && task.attempts < shared.config.max_attempts;

        {
            let mut stats = shared.stats.write();
            stats.processing = stats.processing.saturating_sub(1);
            if retry {
                stats.retried += 1;
                stats.pending += 1;
            } else if status.is_failure() {
                stats.failed += 1;
            } else {
                stats.completed += 1;
            }
        }

        if retry {
            let delay = backoff(&shared.config, task.attempts);
            warn!(
                worker_id,
                task_id = task.id.as_u64(),
                item = %task.item,
                attempt = task.attempts,
                delay_ms = delay.as_millis() as u64,
                status = ?status,
                "Work item will be retried"
            );
            sleep(delay).await;
            lane.tasks.lock().await.push_back(task);
            lane.notify.notify_one();
            continue;
        }

        if let WorkStatus::Failed { error, .. } = &status {
            error!(
                worker_id,
                task_id = task.id.as_u64(),
                item = %task.item,
                attempts = task.attempts,
                error = %error,
                "Work item failed permanently"
            );
        }
        let report = WorkReport {
            task_id: task.id,
            item: task.item,
            attempts: task.attempts,
            status,
        };
        shared.reports.write().push(report.clone());
        let waiters = shared
            .dedupe
            .lock()
            .await
            .remove(&report.item)
            .map(|entry| entry.waiters)
            .unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(report.clone());
        }
    }
    debug!(worker_id, lane = ?kind, "Worker stopped");
}

async fn process(orchestrator: &Arc<Orchestrator>, item: &WorkItem) -> WorkStatus {
    match item {
        WorkItem::Frame(location) => {
            let orchestrator = Arc::clone(orchestrator);
            let location = location.clone();
            match tokio::task::spawn_blocking(move || orchestrator.reduce_frame(&location)).await {
                Ok(Ok(ReductionOutcome::Reduced { frame_id, .. })) => WorkStatus::Reduced { frame_id },
                Ok(Ok(ReductionOutcome::Skipped { reason })) => WorkStatus::Skipped {
                    reason: reason.to_string(),
                },
                Ok(Err(error)) => WorkStatus::failed(&error),
                Err(join_error) => WorkStatus::Failed {
                    error: format!("reduction task aborted: {}", join_error),
                    retryable: false,
                },
            }
        }
        WorkItem::Stacking(job) => match orchestrator.stack(job).await {
            Ok(StackingOutcome::NotReady) => WorkStatus::NotReady,
            Ok(outcome) => WorkStatus::Stacked {
                masters: outcome.stacked().into_iter().cloned().collect(),
            },
            Err(error) => WorkStatus::failed(&error),
        },
    }
}
