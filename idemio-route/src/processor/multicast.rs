use crate::exchange::{Exception, Exchange, keys};
use crate::processor::aggregation::{
    AggregationOrder, SharedAggregationStrategy, UseLatestAggregationStrategy,
};
use crate::processor::{Processor, SharedProcessor, invoke};
use crate::status::Completion;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// One branch of a fan-out: the processor, the private exchange copy it works on, and an
/// optional lease (for example a pooled producer) released once the branch finished.
pub struct BranchPair {
    index: usize,
    processor: SharedProcessor,
    exchange: Exchange,
    lease: Option<Box<dyn Any + Send>>,
}

impl BranchPair {
    pub fn new(index: usize, processor: SharedProcessor, exchange: Exchange) -> Self {
        Self {
            index,
            processor,
            exchange,
            lease: None,
        }
    }

    pub fn with_lease(mut self, lease: impl Any + Send) -> Self {
        self.lease = Some(Box::new(lease));
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }
}

/// Property names written on each branch copy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BranchKeys {
    pub(crate) index: &'static str,
    pub(crate) complete: &'static str,
    pub(crate) size: Option<&'static str>,
}

pub(crate) const MULTICAST_KEYS: BranchKeys = BranchKeys {
    index: keys::MULTICAST_INDEX,
    complete: keys::MULTICAST_COMPLETE,
    size: None,
};

struct BranchOutcome {
    index: usize,
    exchange: Exchange,
}

/// The fan-out engine shared by [`Multicast`], the splitter and the recipient list.
#[derive(Clone)]
pub struct MulticastSettings {
    pub(crate) strategy: SharedAggregationStrategy,
    pub(crate) parallel: bool,
    pub(crate) order: AggregationOrder,
    pub(crate) stop_on_exception: bool,
    pub(crate) share_unit_of_work: bool,
    pub(crate) on_prepare: Option<SharedProcessor>,
    pub(crate) max_concurrency: Option<usize>,
}

impl Default for MulticastSettings {
    fn default() -> Self {
        Self {
            strategy: Arc::new(UseLatestAggregationStrategy),
            parallel: false,
            order: AggregationOrder::default(),
            stop_on_exception: false,
            share_unit_of_work: false,
            on_prepare: None,
            max_concurrency: None,
        }
    }
}

impl MulticastSettings {
    /// A branch copy of `exchange`: a fresh correlated id and, when configured, the shared
    /// unit of work.
    pub(crate) fn branch_copy(&self, exchange: &Exchange) -> Exchange {
        let mut copy = exchange.correlated_copy(self.share_unit_of_work);
        copy.clear_out();
        copy
    }

    pub(crate) async fn execute(
        &self,
        id: &str,
        original: &mut Exchange,
        mut pairs: Vec<BranchPair>,
        branch_keys: BranchKeys,
    ) -> Completion {
        let total = pairs.len();
        if total == 0 {
            return Completion::Sync;
        }
        for pair in pairs.iter_mut() {
            pair.exchange
                .set_property(branch_keys.index, pair.index as i64);
            pair.exchange
                .set_property(branch_keys.complete, pair.index + 1 == total);
            if let Some(size_key) = branch_keys.size {
                pair.exchange.set_property(size_key, total as i64);
            }
        }
        if self.parallel && !original.requires_synchronous() {
            self.execute_parallel(id, original, pairs).await
        } else {
            self.execute_sequential(id, original, pairs).await
        }
    }

    async fn execute_sequential(
        &self,
        id: &str,
        original: &mut Exchange,
        pairs: Vec<BranchPair>,
    ) -> Completion {
        let mut completion = Completion::Sync;
        let mut result: Option<Exchange> = None;
        for pair in pairs {
            let BranchPair {
                index,
                processor,
                mut exchange,
                lease,
            } = pair;
            completion = completion.and(
                run_branch(self.on_prepare.as_deref(), processor.as_ref(), &mut exchange).await,
            );
            drop(lease);
            log::trace!(
                "{} branch {} finished exchange {} (failed: {})",
                id,
                index,
                exchange.id(),
                exchange.is_failed()
            );
            if self.stop_on_exception && branch_failed(&exchange) {
                stop_with_failure(id, original, index, exchange);
                return completion;
            }
            result = Some(self.strategy.aggregate(result.take(), exchange, original));
        }
        if let Some(result) = result {
            original.copy_results_from(&result);
        }
        completion
    }

    async fn execute_parallel(
        &self,
        id: &str,
        original: &mut Exchange,
        pairs: Vec<BranchPair>,
    ) -> Completion {
        let limit = self.max_concurrency.unwrap_or(pairs.len()).max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles: Vec<(usize, JoinHandle<BranchOutcome>)> = Vec::with_capacity(pairs.len());
        for pair in pairs {
            // permits are granted in submission order
            let permit = permits.clone().acquire_owned().await.ok();
            if stop.load(Ordering::Acquire) {
                log::trace!(
                    "{} skipping branch {} and later ones after a failed branch",
                    id,
                    pair.index
                );
                break;
            }
            let index = pair.index;
            let stop = stop.clone();
            let stop_on_exception = self.stop_on_exception;
            let on_prepare = self.on_prepare.clone();
            handles.push((
                index,
                tokio::spawn(async move {
                    let BranchPair {
                        index,
                        processor,
                        mut exchange,
                        lease,
                    } = pair;
                    run_branch(on_prepare.as_deref(), processor.as_ref(), &mut exchange).await;
                    drop(lease);
                    if stop_on_exception && branch_failed(&exchange) {
                        stop.store(true, Ordering::Release);
                    }
                    drop(permit);
                    BranchOutcome {
                        index,
                        exchange,
                    }
                }),
            ));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        match self.order {
            AggregationOrder::Submission => {
                for (index, handle) in handles {
                    outcomes.push(joined(index, handle.await));
                }
            }
            AggregationOrder::Completion => {
                let mut pending: FuturesUnordered<_> = handles
                    .into_iter()
                    .map(|(index, handle)| async move { joined(index, handle.await) })
                    .collect();
                while let Some(outcome) = pending.next().await {
                    outcomes.push(outcome);
                }
            }
        }

        let mut result: Option<Exchange> = None;
        let mut first_failure: Option<(usize, Exchange)> = None;
        for outcome in outcomes {
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(exception) => {
                    original.set_exception(exception);
                    return Completion::Async;
                }
            };
            if self.stop_on_exception && branch_failed(&outcome.exchange) {
                let replace = first_failure
                    .as_ref()
                    .map(|(index, _)| outcome.index < *index)
                    .unwrap_or(true);
                if replace {
                    first_failure = Some((outcome.index, outcome.exchange));
                }
                continue;
            }
            result = Some(self.strategy.aggregate(result.take(), outcome.exchange, original));
        }
        if let Some((index, failed)) = first_failure {
            stop_with_failure(id, original, index, failed);
        } else if let Some(result) = result {
            original.copy_results_from(&result);
        }
        Completion::Async
    }
}

async fn run_branch(
    on_prepare: Option<&dyn Processor>,
    processor: &dyn Processor,
    exchange: &mut Exchange,
) -> Completion {
    let mut completion = Completion::Sync;
    if let Some(prepare) = on_prepare {
        completion = invoke(prepare, exchange).await;
    }
    if !exchange.is_failed() {
        completion = completion.and(invoke(processor, exchange).await);
    }
    completion
}

fn branch_failed(exchange: &Exchange) -> bool {
    exchange.is_failed() || exchange.is_rollback_only()
}

fn joined(
    index: usize,
    result: Result<BranchOutcome, tokio::task::JoinError>,
) -> Result<BranchOutcome, Exception> {
    result.map_err(|error| {
        Exception::illegal_state(format!("branch {} did not complete: {}", index, error))
    })
}

fn stop_with_failure(id: &str, original: &mut Exchange, index: usize, mut failed: Exchange) {
    log::debug!(
        "{} stopping on exception from branch {} of exchange {}",
        id,
        index,
        original.id()
    );
    match failed.take_exception() {
        Some(cause) => original.set_exception(Exception::exchange_failed(
            format!("Multicast processing failed for number {}", index),
            cause,
        )),
        None => {
            original.set_rollback_only(failed.is_rollback_only());
        }
    }
}

/// Sends a copy of the exchange to every processor and aggregates the results.
///
/// # Examples
/// ```rust
/// use idemio_route::exchange::Exchange;
/// use idemio_route::processor::multicast::Multicast;
/// use idemio_route::processor::{Processor, process_fn};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let a = process_fn("a", |exchange| { exchange.out_mut().set_body("from a"); Ok(()) });
/// let b = process_fn("b", |exchange| { exchange.out_mut().set_body("from b"); Ok(()) });
/// let multicast = Multicast::new("fan-out", vec![a, b]);
///
/// let mut exchange = Exchange::with_body("input");
/// multicast.process(&mut exchange).await;
/// assert_eq!(exchange.message().body().as_text().unwrap(), "from b");
/// # });
/// ```
pub struct Multicast {
    id: String,
    processors: Vec<SharedProcessor>,
    settings: MulticastSettings,
}

impl Multicast {
    pub fn new(id: impl Into<String>, processors: Vec<SharedProcessor>) -> Self {
        Self {
            id: id.into(),
            processors,
            settings: MulticastSettings::default(),
        }
    }

    pub fn aggregation_strategy(mut self, strategy: SharedAggregationStrategy) -> Self {
        self.settings.strategy = strategy;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.settings.parallel = parallel;
        self
    }

    pub fn aggregation_order(mut self, order: AggregationOrder) -> Self {
        self.settings.order = order;
        self
    }

    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.settings.stop_on_exception = stop;
        self
    }

    pub fn share_unit_of_work(mut self, share: bool) -> Self {
        self.settings.share_unit_of_work = share;
        self
    }

    /// Runs `processor` on each branch copy before it is sent.
    pub fn on_prepare(mut self, processor: SharedProcessor) -> Self {
        self.settings.on_prepare = Some(processor);
        self
    }

    /// Bounds the number of branches running at once in parallel mode. Defaults to the
    /// number of destinations.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.settings.max_concurrency = Some(limit);
        self
    }
}

#[async_trait]
impl Processor for Multicast {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let mut pairs = Vec::with_capacity(self.processors.len());
        for (index, processor) in self.processors.iter().enumerate() {
            let copy = self.settings.branch_copy(exchange);
            pairs.push(BranchPair::new(index, processor.clone(), copy));
        }
        self.settings
            .execute(&self.id, exchange, pairs, MULTICAST_KEYS)
            .await
    }

    fn name(&self) -> &str {
        &self.id
    }
}
