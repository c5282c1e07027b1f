//! Integration tests for the reduction work queue
//!
//! Tests cover:
//! - Frame and stacking lanes
//! - Permanent failures attempted once
//! - Bounded retry of not-ready windows
//! - Coalescing of duplicate work items

use crate::integration::test_utils::*;
use async_trait::async_trait;
use darkroom::config::QueueConfig;
use darkroom::error::ReductionError;
use darkroom::queue::{ReductionQueue, WorkItem, WorkStatus};
use darkroom::stacking::{ReadinessOracle, StackingJob};
use darkroom::types::{DateWindow, FrameId, FrameType, InstrumentId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn queue_config() -> QueueConfig {
    QueueConfig {
        frame_workers: 2,
        stacking_workers: 1,
        max_attempts: 3,
        backoff_ms: 5,
        max_backoff_ms: 10,
        ..QueueConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_then_stack() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let queue = ReductionQueue::new(Arc::clone(&env.orchestrator), queue_config());
    queue.start();

    for i in 0..3 {
        let path = env.write_raw(&format!("bias-{}", i), &raw_bias(i));
        queue.enqueue(WorkItem::Frame(path)).await.unwrap();
    }
    queue
        .wait_for_completion(Some(Duration::from_secs(10)))
        .await
        .unwrap();

    let job = StackingJob::new(instrument(), FrameType::Bias, night_two());
    let report = queue
        .enqueue_and_wait(WorkItem::Stacking(job), Some(Duration::from_secs(10)))
        .await
        .unwrap();
    let WorkStatus::Stacked { masters } = report.status else {
        panic!("stacking did not succeed: {:?}", report.status);
    };
    assert_eq!(masters.len(), 1);
    assert_eq!(report.attempts, 1);

    let stats = queue.stats();
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.failed, 0);
    queue.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupt_frame_is_not_retried() {
    let env = TestEnv::new();
    let queue = ReductionQueue::new(Arc::clone(&env.orchestrator), queue_config());
    queue.start();

    let path = env.raw_dir.join("broken.frame");
    std::fs::write(&path, b"garbage").unwrap();
    let report = queue
        .enqueue_and_wait(WorkItem::Frame(path), Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(report.attempts, 1);
    assert!(matches!(
        report.status,
        WorkStatus::Failed {
            retryable: false,
            ..
        }
    ));
    assert_eq!(queue.stats().retried, 0);
    queue.stop().await;
}

struct CountingNeverReady(AtomicUsize);

#[async_trait]
impl ReadinessOracle for CountingNeverReady {
    async fn is_window_complete(
        &self,
        _instrument: &InstrumentId,
        _frame_type: FrameType,
        _window: &DateWindow,
    ) -> Result<bool, ReductionError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_not_ready_window_is_retried_up_to_bound() {
    let oracle = Arc::new(CountingNeverReady(AtomicUsize::new(0)));
    let env = TestEnv::with_oracle(Arc::clone(&oracle) as Arc<dyn ReadinessOracle>);
    let queue = ReductionQueue::new(Arc::clone(&env.orchestrator), queue_config());
    queue.start();

    let job = StackingJob::new(instrument(), FrameType::Dark, night_two());
    let report = queue
        .enqueue_and_wait(WorkItem::Stacking(job), Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(report.status, WorkStatus::NotReady);
    assert_eq!(report.attempts, 3);
    assert_eq!(oracle.0.load(Ordering::SeqCst), 3);
    assert_eq!(queue.stats().retried, 2);
    queue.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_items_are_coalesced() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let path = env.write_raw("bias-0", &raw_bias(0));
    let queue = ReductionQueue::new(Arc::clone(&env.orchestrator), queue_config());

    // Not started yet: both enqueues see the same pending task
    let first = queue.enqueue(WorkItem::Frame(path.clone())).await.unwrap();
    let second = queue.enqueue(WorkItem::Frame(path.clone())).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(queue.stats().pending, 1);

    queue.start();
    queue
        .wait_for_completion(Some(Duration::from_secs(10)))
        .await
        .unwrap();
    let reports = queue.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].status,
        WorkStatus::Reduced {
            frame_id: FrameId::new("bias-0")
        }
    );
    queue.stop().await;
}
