use crate::exchange::{Exception, Exchange};
use crate::processor::{Processor, SharedProcessor, invoke};
use crate::status::Completion;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

/// What a worker pool does with a task it cannot queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RejectionPolicy {
    /// Reject the task and report the rejection to the submitter.
    Abort,
    /// Reject the task quietly.
    Discard,
    /// Reject the oldest queued task and queue the new one.
    DiscardOldest,
    /// Run the task on the submitting task.
    #[default]
    CallerRuns,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    pub name: String,
    pub pool_size: usize,
    /// `None` is unbounded.
    pub max_queue_size: Option<usize>,
    pub rejection_policy: RejectionPolicy,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            pool_size: 10,
            max_queue_size: Some(1000),
            rejection_policy: RejectionPolicy::CallerRuns,
        }
    }
}

/// A unit of work for a [`WorkerPool`]: a future to run and the callback told when the pool
/// refuses to run it.
pub struct Task {
    job: BoxFuture<'static, ()>,
    on_reject: Box<dyn FnOnce(Exception) + Send>,
}

impl Task {
    pub fn new<F, R>(job: F, on_reject: R) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
        R: FnOnce(Exception) + Send + 'static,
    {
        Self {
            job: Box::pin(job),
            on_reject: Box::new(on_reject),
        }
    }

    pub async fn run(self) {
        self.job.await
    }

    pub fn reject(self, reason: Exception) {
        (self.on_reject)(reason)
    }
}

/// A fixed set of worker tasks draining a bounded queue.
///
/// Workers are spawned on the current tokio runtime by the first submission.
pub struct WorkerPool {
    config: ThreadPoolConfig,
    queue: Mutex<VecDeque<Task>>,
    available: Notify,
    started: OnceCell<()>,
    shutdown: CancellationToken,
    completed: AtomicUsize,
}

impl WorkerPool {
    pub fn new(config: ThreadPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            started: OnceCell::new(),
            shutdown: CancellationToken::new(),
            completed: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn queue_size(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn completed_tasks(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn ensure_started(self: &Arc<Self>) {
        self.started.get_or_init(|| {
            for worker in 0..self.config.pool_size.max(1) {
                let pool = Arc::clone(self);
                tokio::spawn(async move { pool.work(worker).await });
            }
        });
    }

    async fn work(self: Arc<Self>, worker: usize) {
        log::trace!("Worker {} of pool {} started", worker, self.config.name);
        loop {
            let next = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.pop_front()
            };
            match next {
                Some(task) => {
                    task.run().await;
                    self.completed.fetch_add(1, Ordering::AcqRel);
                }
                None => {
                    tokio::select! {
                        _ = self.available.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
        log::trace!("Worker {} of pool {} stopped", worker, self.config.name);
    }

    /// Queues a task, applying the rejection policy when the queue is full or the pool is
    /// shut down. A rejected task has already been told through its rejection callback when
    /// this returns `Err`.
    pub async fn submit(self: &Arc<Self>, task: Task) -> Result<(), Exception> {
        if self.is_shutdown() {
            let reason = Exception::rejected_execution(format!(
                "Worker pool {} has been shut down",
                self.config.name
            ));
            task.reject(reason.clone());
            return Err(reason);
        }
        self.ensure_started();
        let refused = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let full = self
                .config
                .max_queue_size
                .map(|max| queue.len() >= max)
                .unwrap_or(false);
            if !full {
                queue.push_back(task);
                None
            } else if self.config.rejection_policy == RejectionPolicy::DiscardOldest {
                let oldest = queue.pop_front();
                queue.push_back(task);
                oldest.map(|oldest| (oldest, RejectionPolicy::DiscardOldest))
            } else {
                Some((task, self.config.rejection_policy))
            }
        };
        let Some((task, policy)) = refused else {
            self.available.notify_one();
            return Ok(());
        };
        let reason = Exception::rejected_execution(format!(
            "Task rejected from worker pool {} (queue full)",
            self.config.name
        ));
        match policy {
            RejectionPolicy::CallerRuns => {
                task.run().await;
                Ok(())
            }
            RejectionPolicy::DiscardOldest => {
                self.available.notify_one();
                task.reject(reason);
                Ok(())
            }
            RejectionPolicy::Discard => {
                task.reject(reason);
                Ok(())
            }
            RejectionPolicy::Abort => {
                task.reject(reason.clone());
                Err(reason)
            }
        }
    }

    /// Stops the workers and rejects every task still queued.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let pending: Vec<Task> = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };
        for task in pending {
            task.reject(Exception::rejected_execution(format!(
                "Worker pool {} has been shut down",
                self.config.name
            )));
        }
    }
}

type Handoff = Arc<Mutex<Option<(Exchange, oneshot::Sender<Exchange>)>>>;

fn take_handoff(handoff: &Handoff) -> Option<(Exchange, oneshot::Sender<Exchange>)> {
    handoff.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// Continues routing on a worker pool instead of the calling task.
///
/// Synchronous exchanges (transacted, or forced synchronous) keep running on the calling task.
pub struct ThreadsProcessor {
    id: String,
    pool: Arc<WorkerPool>,
    processor: SharedProcessor,
}

impl ThreadsProcessor {
    pub fn new(id: impl Into<String>, pool: Arc<WorkerPool>, processor: SharedProcessor) -> Self {
        Self {
            id: id.into(),
            pool,
            processor,
        }
    }
}

#[async_trait]
impl Processor for ThreadsProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        if exchange.requires_synchronous() {
            return invoke(self.processor.as_ref(), exchange).await;
        }
        let (sender, receiver) = oneshot::channel();
        let mut recovery = exchange.copy();
        recovery.set_unit_of_work(exchange.unit_of_work().cloned());
        let handoff: Handoff = Arc::new(Mutex::new(Some((std::mem::take(exchange), sender))));

        let job_handoff = handoff.clone();
        let processor = self.processor.clone();
        let task = Task::new(
            async move {
                if let Some((mut owned, sender)) = take_handoff(&job_handoff) {
                    invoke(processor.as_ref(), &mut owned).await;
                    let _ = sender.send(owned);
                }
            },
            move |reason| {
                if let Some((mut owned, sender)) = take_handoff(&handoff) {
                    owned.set_exception(reason);
                    let _ = sender.send(owned);
                }
            },
        );
        if let Err(reason) = self.pool.submit(task).await {
            log::debug!("{} rejected exchange: {}", self.id, reason);
        }
        match receiver.await {
            Ok(returned) => *exchange = returned,
            Err(_) => {
                *exchange = recovery;
                exchange.set_exception(Exception::rejected_execution(format!(
                    "Exchange was dropped by worker pool {}",
                    self.pool.name()
                )));
            }
        }
        Completion::Async
    }

    fn name(&self) -> &str {
        &self.id
    }
}
