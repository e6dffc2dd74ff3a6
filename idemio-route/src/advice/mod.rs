pub mod history;
pub mod standard;

pub use history::{MessageHistory, MessageHistoryAdvice};
pub use standard::{
    DelayAdvice, InflightAdvice, RoutePolicy, RoutePolicyAdvice, StreamCachingAdvice,
    TracingAdvice, UnitOfWorkAdvice,
};

use crate::exchange::{Exception, Exchange};
use crate::processor::{Processor, SharedProcessor, invoke};
use crate::spi::ShutdownStrategy;
use crate::status::Completion;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A before/after hook woven around a processor by [`InternalProcessor`].
///
/// `before` returns the state handed back to the same advice's `after`. An `Err` from
/// `before` fails the exchange and stops the remaining `before` hooks; the `after` hooks of
/// the advices that already ran still run.
#[async_trait]
pub trait Advice: Send + Sync {
    type State: Send + 'static;

    async fn before(&self, exchange: &mut Exchange) -> Result<Self::State, Exception>;

    async fn after(&self, exchange: &mut Exchange, state: Self::State);

    /// Whether `before` suspended the exchange on a timer, which makes the completion `Async`.
    fn suspended(&self, _state: &Self::State) -> bool {
        false
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

pub type AdviceState = Box<dyn Any + Send>;

/// Object-safe form of [`Advice`], implemented for every advice.
#[async_trait]
pub trait DynAdvice: Send + Sync {
    async fn before_dyn(&self, exchange: &mut Exchange) -> Result<AdviceState, Exception>;

    async fn after_dyn(&self, exchange: &mut Exchange, state: AdviceState);

    fn suspended_dyn(&self, state: &AdviceState) -> bool;

    fn advice_name(&self) -> &str;
}

#[async_trait]
impl<A> DynAdvice for A
where
    A: Advice,
{
    async fn before_dyn(&self, exchange: &mut Exchange) -> Result<AdviceState, Exception> {
        let state = self.before(exchange).await?;
        Ok(Box::new(state))
    }

    async fn after_dyn(&self, exchange: &mut Exchange, state: AdviceState) {
        match state.downcast::<A::State>() {
            Ok(state) => self.after(exchange, *state).await,
            Err(_) => log::warn!(
                "Advice {} received a foreign state for exchange {}",
                self.name(),
                exchange.id()
            ),
        }
    }

    fn suspended_dyn(&self, state: &AdviceState) -> bool {
        state
            .downcast_ref::<A::State>()
            .map(|state| self.suspended(state))
            .unwrap_or(false)
    }

    fn advice_name(&self) -> &str {
        self.name()
    }
}

pub type SharedAdvice = Arc<dyn DynAdvice>;

/// Runs a processor inside an ordered chain of advices.
///
/// `before` hooks run in registration order and `after` hooks in exactly the reverse order,
/// whatever the processor's completion. Exchanges that require synchronous processing
/// (transacted, or forced by this processor) run the whole chain on the calling task.
///
/// ```rust
/// use idemio_route::advice::InternalProcessor;
/// use idemio_route::processor::process_fn;
///
/// let processor = InternalProcessor::new("route-1", process_fn("noop", |_| Ok(())));
/// assert_eq!(processor.advice_count(), 0);
/// ```
pub struct InternalProcessor {
    id: String,
    processor: SharedProcessor,
    advices: Vec<SharedAdvice>,
    shutdown: Option<Arc<dyn ShutdownStrategy>>,
    force_synchronous: bool,
}

impl InternalProcessor {
    pub fn new(id: impl Into<String>, processor: SharedProcessor) -> Self {
        Self {
            id: id.into(),
            processor,
            advices: Vec::new(),
            shutdown: None,
            force_synchronous: false,
        }
    }

    pub fn add_advice<A>(&mut self, advice: A)
    where
        A: Advice + 'static,
    {
        self.advices.push(Arc::new(advice));
    }

    pub fn with_advice<A>(mut self, advice: A) -> Self
    where
        A: Advice + 'static,
    {
        self.add_advice(advice);
        self
    }

    pub fn add_shared_advice(&mut self, advice: SharedAdvice) {
        self.advices.push(advice);
    }

    /// Rejects new exchanges once the strategy reports a forced shutdown.
    pub fn shutdown_strategy(mut self, shutdown: Arc<dyn ShutdownStrategy>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn force_synchronous(mut self, synchronous: bool) -> Self {
        self.force_synchronous = synchronous;
        self
    }

    pub fn advice_count(&self) -> usize {
        self.advices.len()
    }

    pub fn processor(&self) -> &SharedProcessor {
        &self.processor
    }

    async fn run_afters(&self, exchange: &mut Exchange, states: Vec<(&SharedAdvice, AdviceState)>) {
        for (advice, state) in states.into_iter().rev() {
            let outcome = AssertUnwindSafe(advice.after_dyn(exchange, state))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                log::warn!(
                    "Advice {} panicked after processing exchange {}. This is ignored.",
                    advice.advice_name(),
                    exchange.id()
                );
            }
        }
    }
}

#[async_trait]
impl Processor for InternalProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        if let Some(shutdown) = &self.shutdown
            && shutdown.is_forced_shutdown()
        {
            exchange.set_exception(Exception::rejected_execution(format!(
                "Run not allowed as the shutdown strategy is forcing shutdown of {}",
                self.id
            )));
            return Completion::Sync;
        }

        let mut states = Vec::with_capacity(self.advices.len());
        let mut before_failed = false;
        for advice in &self.advices {
            let outcome = AssertUnwindSafe(advice.before_dyn(exchange))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(state)) => states.push((advice, state)),
                Ok(Err(exception)) => {
                    exchange.set_exception(exception);
                    before_failed = true;
                    break;
                }
                Err(payload) => {
                    exchange.set_exception(Exception::from_panic(payload));
                    before_failed = true;
                    break;
                }
            }
        }

        let suspended = if states.iter().any(|(advice, state)| advice.suspended_dyn(state)) {
            Completion::Async
        } else {
            Completion::Sync
        };

        let completion = if before_failed {
            log::debug!(
                "{} stopped exchange {} after a failing before hook",
                self.id,
                exchange.id()
            );
            suspended
        } else if self.force_synchronous || exchange.requires_synchronous() {
            let forced = self.force_synchronous && !exchange.requires_synchronous();
            if forced {
                exchange.set_synchronous(true);
            }
            log::trace!("{} processing exchange {} synchronously", self.id, exchange.id());
            invoke(self.processor.as_ref(), exchange).await;
            if forced {
                exchange.set_synchronous(false);
            }
            Completion::Sync
        } else {
            suspended.and(invoke(self.processor.as_ref(), exchange).await)
        };

        self.run_afters(exchange, states).await;
        completion
    }

    fn name(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::DefaultShutdownStrategy;
    use crate::test_support::{
        CallLog, CountingProcessor, HoppingProcessor, RecordingProcessor, call_log, entries,
    };
    use crate::exchange::exception::classes;

    struct LoggingAdvice {
        name: String,
        log: CallLog,
        fail_before: bool,
    }

    impl LoggingAdvice {
        fn new(name: &str, log: &CallLog) -> Self {
            Self {
                name: name.to_string(),
                log: log.clone(),
                fail_before: false,
            }
        }

        fn failing(name: &str, log: &CallLog) -> Self {
            Self {
                fail_before: true,
                ..Self::new(name, log)
            }
        }
    }

    #[async_trait]
    impl Advice for LoggingAdvice {
        type State = String;

        async fn before(&self, _exchange: &mut Exchange) -> Result<String, Exception> {
            self.log.lock().unwrap().push(format!("before {}", self.name));
            if self.fail_before {
                return Err(Exception::illegal_state(format!("{} refused", self.name)));
            }
            Ok(format!("state of {}", self.name))
        }

        async fn after(&self, _exchange: &mut Exchange, state: String) {
            self.log.lock().unwrap().push(format!("after {} with {}", self.name, state));
        }
    }

    fn chain(processor: SharedProcessor, log: &CallLog) -> InternalProcessor {
        InternalProcessor::new("route", processor)
            .with_advice(LoggingAdvice::new("a", log))
            .with_advice(LoggingAdvice::new("b", log))
            .with_advice(LoggingAdvice::new("c", log))
    }

    #[tokio::test]
    async fn test_afters_run_in_reverse_order() {
        let log = call_log();
        let processor = chain(RecordingProcessor::shared("target", log.clone()), &log);
        let mut exchange = Exchange::default();
        processor.process(&mut exchange).await;
        assert_eq!(
            entries(&log),
            vec![
                "before a",
                "before b",
                "before c",
                "target",
                "after c with state of c",
                "after b with state of b",
                "after a with state of a",
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reverse_order_with_async_completion() {
        let log = call_log();
        let processor = chain(HoppingProcessor::shared("hop", log.clone()), &log);
        let mut exchange = Exchange::default();
        let completion = processor.process(&mut exchange).await;
        assert_eq!(completion, Completion::Async);
        let recorded = entries(&log);
        assert_eq!(recorded[3], "hop");
        assert_eq!(recorded[4..], ["after c with state of c", "after b with state of b", "after a with state of a"]);
    }

    #[tokio::test]
    async fn test_failing_before_stops_chain_and_unwinds() {
        let log = call_log();
        let target = CountingProcessor::shared("target");
        let processor = InternalProcessor::new("route", target.clone())
            .with_advice(LoggingAdvice::new("a", &log))
            .with_advice(LoggingAdvice::failing("b", &log))
            .with_advice(LoggingAdvice::new("c", &log));
        let mut exchange = Exchange::default();
        let completion = processor.process(&mut exchange).await;
        assert_eq!(completion, Completion::Sync);
        assert_eq!(target.count(), 0);
        assert_eq!(exchange.exception().unwrap().message(), "b refused");
        assert_eq!(entries(&log), vec!["before a", "before b", "after a with state of a"]);
    }

    #[tokio::test]
    async fn test_forced_shutdown_rejects() {
        let shutdown = Arc::new(DefaultShutdownStrategy::new());
        shutdown.force_shutdown();
        let target = CountingProcessor::shared("target");
        let processor = InternalProcessor::new("route", target.clone()).shutdown_strategy(shutdown);
        let mut exchange = Exchange::default();
        processor.process(&mut exchange).await;
        assert_eq!(target.count(), 0);
        assert!(exchange.exception().unwrap().is_instance_of(&classes::REJECTED_EXECUTION));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forced_synchronous_keeps_hops_inline() {
        let log = call_log();
        let processor = InternalProcessor::new("route", HoppingProcessor::shared("hop", log.clone()))
            .force_synchronous(true);
        let mut exchange = Exchange::default();
        let completion = processor.process(&mut exchange).await;
        assert_eq!(completion, Completion::Sync);
        assert!(!exchange.requires_synchronous());
        assert_eq!(entries(&log), vec!["hop"]);
    }
}
