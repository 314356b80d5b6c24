//! Reply queue: a single-consumer FIFO that runs one send at a time.
//!
//! `enqueue` hands back a `oneshot` receiver that settles exactly once with
//! the task's outcome. The drain loop is spawned on demand and exits when the
//! queue is empty. A panic while running a task rejects that task, releases
//! the processing flag and resumes the loop after a short pause.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SendError;
use crate::identity::ConversationId;

/// What a task delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    LeadTool { tool_id: String },
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(_) => f.write_str("text"),
            Self::LeadTool { tool_id } => write!(f, "lead tool {tool_id}"),
        }
    }
}

/// Successful settlement of a task.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task_id: Uuid,
    pub conversation: ConversationId,
    pub payload: Outbound,
    /// Enqueue to settlement.
    pub latency: Duration,
}

pub type TaskOutcome = Result<Delivery, SendError>;

/// Runs one task against the surface.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, conversation: &ConversationId, payload: &Outbound) -> Result<(), SendError>;
}

struct ReplyTask {
    id: Uuid,
    conversation: ConversationId,
    payload: Outbound,
    enqueued_at: Instant,
    done: oneshot::Sender<TaskOutcome>,
}

/// Running totals over settled tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Mean enqueue-to-settlement latency over succeeded and failed tasks.
    pub average_latency: Duration,
}

impl QueueStats {
    pub fn settled(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Fraction of settled tasks that succeeded (1.0 before any settle).
    pub fn success_ratio(&self) -> f64 {
        match self.settled() {
            0 => 1.0,
            n => self.succeeded as f64 / n as f64,
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        let n = self.settled() as u128;
        let total = self.average_latency.as_nanos() * (n - 1) + latency.as_nanos();
        self.average_latency = Duration::from_nanos((total / n).min(u64::MAX as u128) as u64);
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ReplyTask>,
    processing: bool,
    stats: QueueStats,
}

pub struct ReplyQueue {
    state: Mutex<QueueState>,
    executor: Arc<dyn TaskExecutor>,
    recovery_delay: Duration,
}

impl ReplyQueue {
    pub fn new(executor: Arc<dyn TaskExecutor>, recovery_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            executor,
            recovery_delay,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a task and start the drain loop if it is idle.
    pub fn enqueue(
        self: &Arc<Self>,
        conversation: ConversationId,
        payload: Outbound,
    ) -> oneshot::Receiver<TaskOutcome> {
        let (done, rx) = oneshot::channel();
        let task = ReplyTask {
            id: Uuid::new_v4(),
            conversation,
            payload,
            enqueued_at: Instant::now(),
            done,
        };
        debug!(task_id = %task.id, conversation = %task.conversation, payload = %task.payload, "Task enqueued");

        let start = {
            let mut state = self.lock();
            state.pending.push_back(task);
            !std::mem::replace(&mut state.processing, true)
        };
        if start {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.drain().await });
        }
        rx
    }

    /// Reject every pending task. A task already running is left alone.
    pub fn clear(&self) -> usize {
        let drained: Vec<ReplyTask> = {
            let mut state = self.lock();
            let drained: Vec<_> = state.pending.drain(..).collect();
            state.stats.cancelled += drained.len() as u64;
            drained
        };
        let count = drained.len();
        for task in drained {
            let _ = task
                .done
                .send(Err(SendError::Cancelled(format!("task {} cleared", task.id))));
        }
        if count > 0 {
            info!(count, "Cleared pending reply tasks");
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_processing(&self) -> bool {
        self.lock().processing
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats.clone()
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                let next = state.pending.pop_front();
                if next.is_none() {
                    state.processing = false;
                }
                next
            };
            let Some(task) = next else {
                return;
            };

            let ReplyTask {
                id,
                conversation,
                payload,
                enqueued_at,
                done,
            } = task;

            let step = AssertUnwindSafe(self.run_task(id, &conversation, &payload, enqueued_at))
                .catch_unwind()
                .await;

            match step {
                Ok(outcome) => {
                    let _ = done.send(outcome);
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(task_id = %id, conversation = %conversation, reason = %reason, "Reply task panicked");
                    self.lock().stats.record(false, enqueued_at.elapsed());
                    let _ = done.send(Err(SendError::Internal(reason)));

                    if !self.recover().await {
                        return;
                    }
                }
            }
        }
    }

    /// Release the processing flag, pause, and reclaim it if work is pending.
    ///
    /// Returns `false` when another drain took over or nothing is left.
    async fn recover(&self) -> bool {
        self.lock().processing = false;
        tokio::time::sleep(self.recovery_delay).await;
        let mut state = self.lock();
        if state.processing || state.pending.is_empty() {
            return false;
        }
        state.processing = true;
        warn!(pending = state.pending.len(), "Reply queue resuming after internal failure");
        true
    }

    async fn run_task(
        &self,
        id: Uuid,
        conversation: &ConversationId,
        payload: &Outbound,
        enqueued_at: Instant,
    ) -> TaskOutcome {
        let result = self.executor.execute(conversation, payload).await;
        let latency = enqueued_at.elapsed();
        self.lock().stats.record(result.is_ok(), latency);

        match result {
            Ok(()) => {
                info!(task_id = %id, conversation = %conversation, payload = %payload, latency_ms = latency.as_millis() as u64, "Reply task delivered");
                Ok(Delivery {
                    task_id: id,
                    conversation: conversation.clone(),
                    payload: payload.clone(),
                    latency,
                })
            }
            Err(e) => {
                warn!(task_id = %id, conversation = %conversation, phase = ?e.phase(), error = %e, "Reply task failed");
                Err(e)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
