use crate::exchange::{Exception, Exchange, keys};
use crate::expression::SharedExpression;
use crate::processor::{Processor, SharedProcessor, invoke};
use crate::spi::ExceptionHandler;
use crate::status::Completion;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items collected before the sender flushes without waiting for the timeout.
    #[serde(alias = "batchSize")]
    pub batch_size: usize,
    #[serde(alias = "batchTimeout")]
    pub batch_timeout_ms: u64,
    /// Items that must be buffered before any are emitted. `0` emits whatever is buffered.
    #[serde(alias = "outBatchSize")]
    pub out_batch_size: usize,
    #[serde(alias = "queueCapacity")]
    pub queue_capacity: usize,
    pub reverse: bool,
    #[serde(alias = "allowDuplicates")]
    pub allow_duplicates: bool,
    #[serde(alias = "ignoreInvalidExchanges")]
    pub ignore_invalid_exchanges: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_ms: 1000,
            out_batch_size: 0,
            queue_capacity: 1000,
            reverse: false,
            allow_duplicates: false,
            ignore_invalid_exchanges: false,
        }
    }
}

impl BatchConfig {
    fn in_completed(&self, buffered: usize) -> bool {
        self.batch_size > 0 && buffered >= self.batch_size
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms.max(1))
    }
}

/// Orders JSON sort keys: numbers numerically, strings lexically, anything else by its text.
pub(crate) fn compare_keys(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

struct Queued {
    key: Option<Value>,
    exchange: Exchange,
}

struct Buffered {
    key: Option<Value>,
    sequence: u64,
    exchange: Exchange,
}

/// Buffered items awaiting a flush, kept in emission order.
struct BatchBuffer {
    items: Vec<Buffered>,
    next_sequence: u64,
    reverse: bool,
    allow_duplicates: bool,
}

impl BatchBuffer {
    fn new(config: &BatchConfig) -> Self {
        Self {
            items: Vec::new(),
            next_sequence: 0,
            reverse: config.reverse,
            allow_duplicates: config.allow_duplicates,
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn order(&self, a: &Buffered, b: &Buffered) -> Ordering {
        let by_key = match (&a.key, &b.key) {
            (Some(x), Some(y)) => compare_keys(x, y),
            _ => Ordering::Equal,
        };
        let by_key = if self.reverse { by_key.reverse() } else { by_key };
        by_key.then(a.sequence.cmp(&b.sequence))
    }

    /// Returns `false` when the item was dropped as a duplicate.
    fn insert(&mut self, queued: Queued) -> bool {
        if !self.allow_duplicates
            && let Some(key) = &queued.key
        {
            let duplicate = self
                .items
                .iter()
                .any(|item| item.key.as_ref().map(|k| compare_keys(k, key)) == Some(Ordering::Equal));
            if duplicate {
                return false;
            }
        }
        let item = Buffered {
            key: queued.key,
            sequence: self.next_sequence,
            exchange: queued.exchange,
        };
        self.next_sequence += 1;
        let position = self
            .items
            .partition_point(|existing| self.order(existing, &item) != Ordering::Greater);
        self.items.insert(position, item);
        true
    }

    /// Removes the items to emit now. With an out batch size only whole out batches leave
    /// the buffer, unless `everything` is set.
    fn take(&mut self, out_batch_size: usize, everything: bool) -> Vec<Exchange> {
        let count = if everything || out_batch_size == 0 {
            self.items.len()
        } else {
            self.items.len() - self.items.len() % out_batch_size
        };
        self.items
            .drain(..count)
            .map(|item| item.exchange)
            .collect()
    }
}

struct BatchSender {
    id: String,
    config: BatchConfig,
    processor: SharedProcessor,
    exception_handler: Arc<dyn ExceptionHandler>,
    stopping: CancellationToken,
}

impl BatchSender {
    async fn run(self, mut receiver: mpsc::Receiver<Queued>) {
        let mut buffer = BatchBuffer::new(&self.config);
        let mut deadline = Instant::now() + self.config.timeout();
        log::debug!("Batch sender {} started", self.id);
        loop {
            tokio::select! {
                biased;
                _ = self.stopping.cancelled() => {
                    receiver.close();
                    while let Ok(queued) = receiver.try_recv() {
                        self.buffer(&mut buffer, queued);
                    }
                    self.flush(&mut buffer, true).await;
                    break;
                }
                queued = receiver.recv() => match queued {
                    Some(queued) => {
                        self.buffer(&mut buffer, queued);
                        if self.config.in_completed(buffer.len()) {
                            self.flush(&mut buffer, false).await;
                            deadline = Instant::now() + self.config.timeout();
                        }
                    }
                    None => {
                        self.flush(&mut buffer, true).await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.flush(&mut buffer, false).await;
                    deadline = Instant::now() + self.config.timeout();
                }
            }
        }
        log::debug!("Batch sender {} stopped", self.id);
    }

    fn buffer(&self, buffer: &mut BatchBuffer, queued: Queued) {
        let id = queued.exchange.id().to_string();
        if !buffer.insert(queued) {
            log::debug!("{} dropped duplicate exchange {}", self.id, id);
        }
    }

    async fn flush(&self, buffer: &mut BatchBuffer, everything: bool) {
        let batch = buffer.take(self.config.out_batch_size, everything);
        if batch.is_empty() {
            return;
        }
        let size = batch.len();
        log::trace!("{} flushing {} exchanges", self.id, size);
        for (index, mut exchange) in batch.into_iter().enumerate() {
            exchange.set_property(keys::BATCH_INDEX, index as i64);
            exchange.set_property(keys::BATCH_SIZE, size as i64);
            exchange.set_property(keys::BATCH_COMPLETE, index + 1 == size);
            invoke(self.processor.as_ref(), &mut exchange).await;
            if let Some(exception) = exchange.exception() {
                self.exception_handler.handle_exception(
                    &format!("Error processing batched exchange in {}", self.id),
                    Some(&exchange),
                    exception,
                );
            }
        }
    }
}

/// Collects exchanges and hands them to the downstream processor in batches, optionally
/// resequenced by a sort expression.
///
/// Calling `process` enqueues a copy of the exchange and completes at once; a background
/// sender flushes when `batch_size` items are buffered or the batch timeout elapses. Failures
/// of individual flushed exchanges go to the exception handler and do not stop the batch.
pub struct BatchProcessor {
    id: String,
    config: BatchConfig,
    comparator: Option<SharedExpression>,
    processor: SharedProcessor,
    exception_handler: Arc<dyn ExceptionHandler>,
    sender: mpsc::Sender<Queued>,
    receiver: Mutex<Option<mpsc::Receiver<Queued>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    started: OnceCell<()>,
    stopping: CancellationToken,
}

impl BatchProcessor {
    pub fn new(
        id: impl Into<String>,
        config: BatchConfig,
        processor: SharedProcessor,
        exception_handler: Arc<dyn ExceptionHandler>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            id: id.into(),
            config,
            comparator: None,
            processor,
            exception_handler,
            sender,
            receiver: Mutex::new(Some(receiver)),
            handle: Mutex::new(None),
            started: OnceCell::new(),
            stopping: CancellationToken::new(),
        }
    }

    /// Resequences each batch by the value of `expression`.
    pub fn resequence(mut self, expression: SharedExpression) -> Self {
        self.comparator = Some(expression);
        self
    }

    fn ensure_started(&self) {
        self.started.get_or_init(|| {
            let receiver = self.receiver.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(receiver) = receiver {
                let sender = BatchSender {
                    id: self.id.clone(),
                    config: self.config.clone(),
                    processor: self.processor.clone(),
                    exception_handler: self.exception_handler.clone(),
                    stopping: self.stopping.clone(),
                };
                let handle = tokio::spawn(sender.run(receiver));
                *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
        });
    }

    /// Stops accepting exchanges, flushes everything still buffered and waits for the sender.
    pub async fn stop(&self) {
        self.stopping.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && let Err(error) = handle.await
        {
            log::warn!("Batch sender {} ended abnormally: {}", self.id, error);
        }
    }

    fn sort_key(&self, exchange: &Exchange) -> Result<Option<Value>, Exception> {
        match &self.comparator {
            Some(expression) => expression.evaluate(exchange).map(Some),
            None => Ok(None),
        }
    }
}

impl Drop for BatchProcessor {
    fn drop(&mut self) {
        self.stopping.cancel();
    }
}

#[async_trait]
impl Processor for BatchProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        if self.stopping.is_cancelled() {
            exchange.set_exception(Exception::rejected_execution(format!(
                "{} is stopped and cannot accept exchange {}",
                self.id,
                exchange.id()
            )));
            return Completion::Sync;
        }
        let key = match self.sort_key(exchange) {
            Ok(key) => key,
            Err(exception) if self.config.ignore_invalid_exchanges => {
                log::debug!("{} ignoring invalid exchange {}: {}", self.id, exchange.id(), exception);
                return Completion::Sync;
            }
            Err(exception) => {
                exchange.set_exception(exception);
                return Completion::Sync;
            }
        };
        self.ensure_started();
        let queued = Queued {
            key,
            exchange: exchange.copy(),
        };
        if self.sender.send(queued).await.is_err() {
            exchange.set_exception(Exception::rejected_execution(format!(
                "{} stopped before exchange {} was queued",
                self.id,
                exchange.id()
            )));
        }
        Completion::Sync
    }

    fn name(&self) -> &str {
        &self.id
    }
}
