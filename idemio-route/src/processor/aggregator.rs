use crate::exchange::{Exception, Exchange, keys};
use crate::expression::{SharedExpression, SharedPredicate};
use crate::processor::aggregation::SharedAggregationStrategy;
use crate::processor::{Processor, SharedProcessor, invoke};
use crate::spi::ExceptionHandler;
use crate::status::Completion;
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an aggregated group was released. Recorded under [`keys::AGGREGATED_COMPLETED_BY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedBy {
    Size,
    Predicate,
    Timeout,
    Force,
}

impl CompletedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletedBy::Size => "size",
            CompletedBy::Predicate => "predicate",
            CompletedBy::Timeout => "timeout",
            CompletedBy::Force => "force",
        }
    }
}

impl Display for CompletedBy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Group {
    aggregated: Option<Exchange>,
    size: usize,
    last_updated: Instant,
    closed: bool,
}

impl Group {
    fn open() -> Self {
        Self {
            aggregated: None,
            size: 0,
            last_updated: Instant::now(),
            closed: false,
        }
    }

    /// Marks the group completed and takes its aggregate. `None` when already closed.
    fn close(&mut self) -> Option<(Exchange, usize)> {
        if self.closed {
            return None;
        }
        self.closed = true;
        let aggregated = self.aggregated.take()?;
        Some((aggregated, std::mem::take(&mut self.size)))
    }
}

type GroupSlot = Arc<Mutex<Group>>;

fn lock(slot: &GroupSlot) -> MutexGuard<'_, Group> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

struct AggregatorInner {
    id: String,
    strategy: SharedAggregationStrategy,
    processor: SharedProcessor,
    exception_handler: Arc<dyn ExceptionHandler>,
    completion_size: Option<usize>,
    completion_predicate: Option<SharedPredicate>,
    completion_timeout: Option<Duration>,
    repository: DashMap<String, GroupSlot, fnv::FnvBuildHasher>,
}

impl AggregatorInner {
    fn completion_reason(&self, aggregated: &Exchange, size: usize) -> Option<CompletedBy> {
        if let Some(predicate) = &self.completion_predicate
            && predicate.matches(aggregated)
        {
            return Some(CompletedBy::Predicate);
        }
        match self.completion_size {
            Some(limit) if size >= limit => Some(CompletedBy::Size),
            _ => None,
        }
    }

    fn slot(&self, key: &str) -> GroupSlot {
        self.repository
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Group::open())))
            .clone()
    }

    fn remove_slot(&self, key: &str, slot: &GroupSlot) {
        self.repository
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Folds `exchange` into its group and returns the group's aggregate when that completed it.
    ///
    /// The strategy and the completion predicate run under the group's own lock, never under
    /// a repository shard lock.
    fn aggregate(&self, key: &str, exchange: &Exchange) -> Option<(Exchange, usize, CompletedBy)> {
        loop {
            let slot = self.slot(key);
            let mut group = lock(&slot);
            if group.closed {
                // completed by another task, a fresh group takes its place
                drop(group);
                self.remove_slot(key, &slot);
                continue;
            }
            let old = group.aggregated.take();
            let aggregated = self.strategy.aggregate(old, exchange.copy(), exchange);
            group.size += 1;
            group.last_updated = Instant::now();
            let reason = self.completion_reason(&aggregated, group.size);
            group.aggregated = Some(aggregated);
            let reason = reason?;
            let completed = group.close();
            drop(group);
            self.remove_slot(key, &slot);
            return completed.map(|(aggregated, size)| (aggregated, size, reason));
        }
    }

    async fn complete(&self, key: String, mut aggregated: Exchange, size: usize, reason: CompletedBy) {
        aggregated.set_property(keys::AGGREGATED_SIZE, size as i64);
        aggregated.set_property(keys::AGGREGATED_COMPLETED_BY, reason.as_str());
        aggregated.set_property(keys::AGGREGATED_CORRELATION_KEY, key.as_str());
        log::debug!(
            "{} completed group {} with {} exchanges ({})",
            self.id,
            key,
            size,
            reason
        );
        invoke(self.processor.as_ref(), &mut aggregated).await;
        if let Some(exception) = aggregated.exception() {
            self.exception_handler.handle_exception(
                &format!("Error processing aggregated exchange in {}", self.id),
                Some(&aggregated),
                exception,
            );
        }
    }

    /// Closes and removes the groups accepted by `filter`.
    fn take_groups(&self, filter: impl Fn(&Group) -> bool) -> Vec<(String, Exchange, usize)> {
        let slots: Vec<(String, GroupSlot)> = self
            .repository
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut taken = Vec::new();
        for (key, slot) in slots {
            let mut group = lock(&slot);
            if !filter(&group) {
                continue;
            }
            let completed = group.close();
            drop(group);
            self.remove_slot(&key, &slot);
            if let Some((aggregated, size)) = completed {
                taken.push((key, aggregated, size));
            }
        }
        taken
    }

    fn take_expired(&self, now: Instant) -> Vec<(String, Exchange, usize)> {
        let Some(timeout) = self.completion_timeout else {
            return Vec::new();
        };
        self.take_groups(|group| now.duration_since(group.last_updated) >= timeout)
    }

    async fn check_timeouts(self: Arc<Self>, interval: Duration, stopping: CancellationToken) {
        loop {
            tokio::select! {
                _ = stopping.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    for (key, aggregated, size) in self.take_expired(Instant::now()) {
                        self.complete(key, aggregated, size, CompletedBy::Timeout).await;
                    }
                }
            }
        }
        log::debug!("Timeout checker of {} stopped", self.id);
    }
}

/// Correlates exchanges into groups and emits each group once it completes.
///
/// Exchanges are grouped by the value of the correlation expression and folded with the
/// aggregation strategy. A group completes when the completion predicate matches the
/// aggregated exchange, when it holds `completion_size` exchanges, when it saw no new
/// exchange for `completion_timeout`, or when completion is forced. Completed groups are
/// sent to the downstream processor; their failures go to the exception handler.
///
/// The exchange passed to `process` is not consumed: it continues with the
/// [`keys::AGGREGATED_CORRELATION_KEY`] property set.
pub struct Aggregator {
    inner: Arc<AggregatorInner>,
    correlation: SharedExpression,
    ignore_invalid_correlation_keys: bool,
    force_completion_on_stop: bool,
    timeout_check_interval: Duration,
    checker: OnceCell<()>,
    checker_handle: Mutex<Option<JoinHandle<()>>>,
    stopping: CancellationToken,
}

impl Aggregator {
    pub fn new(
        id: impl Into<String>,
        correlation: SharedExpression,
        strategy: SharedAggregationStrategy,
        processor: SharedProcessor,
        exception_handler: Arc<dyn ExceptionHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                id: id.into(),
                strategy,
                processor,
                exception_handler,
                completion_size: None,
                completion_predicate: None,
                completion_timeout: None,
                repository: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
            }),
            correlation,
            ignore_invalid_correlation_keys: false,
            force_completion_on_stop: false,
            timeout_check_interval: Duration::from_secs(1),
            checker: OnceCell::new(),
            checker_handle: Mutex::new(None),
            stopping: CancellationToken::new(),
        }
    }

    fn inner_mut(&mut self) -> Option<&mut AggregatorInner> {
        Arc::get_mut(&mut self.inner)
    }

    pub fn completion_size(mut self, size: usize) -> Self {
        if let Some(inner) = self.inner_mut() {
            inner.completion_size = Some(size.max(1));
        }
        self
    }

    pub fn completion_predicate(mut self, predicate: SharedPredicate) -> Self {
        if let Some(inner) = self.inner_mut() {
            inner.completion_predicate = Some(predicate);
        }
        self
    }

    /// Inactivity timeout of a group. Checked every second, or more often for short timeouts.
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = self.inner_mut() {
            inner.completion_timeout = Some(timeout);
        }
        self.timeout_check_interval = timeout.min(Duration::from_secs(1)).max(Duration::from_millis(1));
        self
    }

    pub fn ignore_invalid_correlation_keys(mut self, ignore: bool) -> Self {
        self.ignore_invalid_correlation_keys = ignore;
        self
    }

    pub fn force_completion_on_stop(mut self, force: bool) -> Self {
        self.force_completion_on_stop = force;
        self
    }

    /// Number of groups still being aggregated.
    pub fn pending_groups(&self) -> usize {
        self.inner.repository.len()
    }

    /// Completes every pending group now.
    pub async fn force_completion(&self) -> usize {
        let groups = self.inner.take_groups(|_| true);
        let completed = groups.len();
        for (key, aggregated, size) in groups {
            self.inner.complete(key, aggregated, size, CompletedBy::Force).await;
        }
        completed
    }

    /// Stops the timeout checker, forcing completion of pending groups when configured.
    pub async fn stop(&self) {
        self.stopping.cancel();
        let handle = self.checker_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if self.force_completion_on_stop {
            self.force_completion().await;
        }
    }

    fn ensure_timeout_checker(&self) {
        if self.inner.completion_timeout.is_none() {
            return;
        }
        self.checker.get_or_init(|| {
            let inner = self.inner.clone();
            let handle = tokio::spawn(inner.check_timeouts(self.timeout_check_interval, self.stopping.clone()));
            *self.checker_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        });
    }

    fn correlation_key(&self, exchange: &Exchange) -> Result<String, Exception> {
        let value = self.correlation.evaluate(exchange)?;
        let key = match value {
            Value::Null => String::new(),
            Value::String(text) => text,
            other => other.to_string(),
        };
        if key.is_empty() {
            return Err(Exception::illegal_argument(format!(
                "Invalid correlation key for exchange {}",
                exchange.id()
            )));
        }
        Ok(key)
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.stopping.cancel();
    }
}

#[async_trait]
impl Processor for Aggregator {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let inner = &self.inner;
        if inner.completion_size.is_none()
            && inner.completion_predicate.is_none()
            && inner.completion_timeout.is_none()
        {
            exchange.set_exception(Exception::illegal_state(format!(
                "{} needs at least one of completion size, predicate or timeout",
                inner.id
            )));
            return Completion::Sync;
        }
        if self.stopping.is_cancelled() {
            exchange.set_exception(Exception::rejected_execution(format!(
                "{} is stopped",
                inner.id
            )));
            return Completion::Sync;
        }
        let key = match self.correlation_key(exchange) {
            Ok(key) => key,
            Err(exception) if self.ignore_invalid_correlation_keys => {
                log::debug!("{} ignoring exchange {}: {}", inner.id, exchange.id(), exception);
                return Completion::Sync;
            }
            Err(exception) => {
                exchange.set_exception(exception);
                return Completion::Sync;
            }
        };
        self.ensure_timeout_checker();
        exchange.set_property(keys::AGGREGATED_CORRELATION_KEY, key.as_str());
        if let Some((aggregated, size, reason)) = inner.aggregate(&key, exchange) {
            inner.complete(key, aggregated, size, reason).await;
        }
        Completion::Sync
    }

    fn name(&self) -> &str {
        &self.inner.id
    }
}
