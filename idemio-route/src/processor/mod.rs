pub mod aggregation;
pub mod aggregator;
pub mod batch;
pub mod choice;
pub mod delayer;
pub mod dynamic;
pub mod loop_processor;
pub mod marshal;
pub mod multicast;
pub mod pipeline;
pub mod send;
pub mod splitter;
pub mod threads;
pub mod throttler;
pub mod wire_tap;

use crate::exchange::{Exception, Exchange};
use crate::status::Completion;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

pub type SharedProcessor = Arc<dyn Processor>;

/// The basic unit of routing behaviour.
///
/// A processor consumes an exchange and resolves once it is finished with it. Failures are
/// never returned or raised: they are recorded in the exchange's exception slot. The returned
/// [`Completion`] tells the caller whether the exchange stayed on the calling task.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Completion;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A processor that finishes inline and reports failure through its return value.
pub trait SyncProcessor: Send + Sync {
    fn process(&self, exchange: &mut Exchange) -> Result<(), Exception>;
}

impl<F> SyncProcessor for F
where
    F: Fn(&mut Exchange) -> Result<(), Exception> + Send + Sync,
{
    fn process(&self, exchange: &mut Exchange) -> Result<(), Exception> {
        self(exchange)
    }
}

/// Adapts a [`SyncProcessor`] to the [`Processor`] contract.
///
/// Errors and panics raised by the inner processor land in the exception slot; the adapter
/// always completes synchronously.
pub struct SyncAdapter<P> {
    name: String,
    inner: P,
}

impl<P> SyncAdapter<P>
where
    P: SyncProcessor,
{
    pub fn new(name: impl Into<String>, inner: P) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

#[async_trait]
impl<P> Processor for SyncAdapter<P>
where
    P: SyncProcessor,
{
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        match catch_unwind(AssertUnwindSafe(|| self.inner.process(exchange))) {
            Ok(Ok(())) => {}
            Ok(Err(exception)) => exchange.set_exception(exception),
            Err(payload) => exchange.set_exception(Exception::from_panic(payload)),
        }
        Completion::Sync
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wraps a closure as a shared processor.
///
/// ```rust
/// use idemio_route::processor::process_fn;
///
/// let upper = process_fn("upper", |exchange| {
///     let text = exchange.in_message().body().as_text().unwrap_or_default().to_uppercase();
///     exchange.in_mut().set_body(text);
///     Ok(())
/// });
/// assert_eq!(upper.name(), "upper");
/// ```
pub fn process_fn<F>(name: impl Into<String>, f: F) -> SharedProcessor
where
    F: Fn(&mut Exchange) -> Result<(), Exception> + Send + Sync + 'static,
{
    Arc::new(SyncAdapter::new(name, f))
}

/// Invokes a child processor, converting a panic inside it into the exception slot.
pub async fn invoke(processor: &dyn Processor, exchange: &mut Exchange) -> Completion {
    let outcome = AssertUnwindSafe(processor.process(exchange))
        .catch_unwind()
        .await;
    match outcome {
        Ok(completion) => completion,
        Err(payload) => {
            exchange.set_exception(Exception::from_panic(payload));
            Completion::Sync
        }
    }
}

/// Whether routing should continue with the next step.
///
/// Stops when the exchange is marked to stop, has failed, is rollback-only, or has already
/// been handled by an error handler.
pub fn continue_processing(exchange: &Exchange, stage: &str) -> bool {
    if exchange.is_route_stop() {
        log::debug!(
            "Exchange {} is marked to stop routing, not continuing {}",
            exchange.id(),
            stage
        );
        return false;
    }
    let stop = exchange.is_failed()
        || exchange.is_rollback_only()
        || exchange.is_error_handler_handled();
    if stop {
        log::debug!(
            "Exchange {} has failed or is handled (exception: {:?}, rollback: {}), not continuing {}",
            exchange.id(),
            exchange.exception().map(|e| e.to_string()),
            exchange.is_rollback_only(),
            stage
        );
        return false;
    }
    true
}

/// Runs `task` on a separate tokio task, moving the exchange there and back.
///
/// Exchanges that require synchronous processing run `task` on the calling task instead.
/// The exchange is restored even if the task panics; the panic is recorded as an exception.
pub(crate) async fn hop<F, Fut>(exchange: &mut Exchange, task: F) -> Completion
where
    F: FnOnce(Exchange) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Exchange> + Send + 'static,
{
    let id = exchange.id().to_string();
    let owned = std::mem::take(exchange);
    let mut recovery = owned.copy();
    recovery.set_unit_of_work(owned.unit_of_work().cloned());
    if owned.requires_synchronous() {
        match AssertUnwindSafe(task(owned)).catch_unwind().await {
            Ok(returned) => *exchange = returned,
            Err(payload) => {
                *exchange = recovery;
                exchange.set_exception(Exception::from_panic(payload));
            }
        }
        return Completion::Sync;
    }
    match tokio::spawn(task(owned)).await {
        Ok(returned) => *exchange = returned,
        Err(error) => {
            *exchange = recovery;
            exchange.set_exception(Exception::illegal_state(format!(
                "task processing exchange {} did not complete: {}",
                id, error
            )));
        }
    }
    Completion::Async
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CountingProcessor, FailingProcessor};

    #[tokio::test]
    async fn test_sync_adapter_records_errors() {
        let processor = process_fn("fails", |_| Err(Exception::illegal_argument("bad input")));
        let mut exchange = Exchange::with_body("x");
        let completion = processor.process(&mut exchange).await;
        assert_eq!(completion, Completion::Sync);
        assert_eq!(exchange.exception().unwrap().message(), "bad input");
    }

    #[tokio::test]
    async fn test_sync_adapter_catches_panics() {
        let processor = process_fn("panics", |_| panic!("unexpected"));
        let mut exchange = Exchange::default();
        processor.process(&mut exchange).await;
        assert_eq!(exchange.exception().unwrap().message(), "unexpected");
    }

    struct PanickingAsync;

    #[async_trait]
    impl Processor for PanickingAsync {
        async fn process(&self, _exchange: &mut Exchange) -> Completion {
            tokio::task::yield_now().await;
            panic!("async panic");
        }
    }

    #[tokio::test]
    async fn test_invoke_catches_async_panics() {
        let mut exchange = Exchange::default();
        invoke(&PanickingAsync, &mut exchange).await;
        assert_eq!(exchange.exception().unwrap().message(), "async panic");
    }

    #[tokio::test]
    async fn test_hop_moves_exchange_and_back() {
        let counter = CountingProcessor::shared("c");
        let inner = counter.clone();
        let mut exchange = Exchange::with_body("x");
        let id = exchange.id().to_string();
        let completion = hop(&mut exchange, move |mut owned| async move {
            inner.process(&mut owned).await;
            owned
        })
        .await;
        assert_eq!(completion, Completion::Async);
        assert_eq!(exchange.id(), id);
        assert_eq!(counter.count(), 1);
    }

    #[tokio::test]
    async fn test_hop_stays_inline_for_transacted_exchange() {
        let mut exchange = Exchange::builder().transacted(true).body("x").build();
        let completion = hop(&mut exchange, |mut owned| async move {
            owned.in_mut().set_body("done");
            owned
        })
        .await;
        assert_eq!(completion, Completion::Sync);
        assert_eq!(exchange.in_message().body().as_text().unwrap(), "done");
    }

    #[test]
    fn test_continue_processing_rules() {
        let mut exchange = Exchange::default();
        assert!(continue_processing(&exchange, "test"));
        exchange.set_rollback_only(true);
        assert!(!continue_processing(&exchange, "test"));
        exchange.set_rollback_only(false);
        exchange.set_error_handler_handled(Some(true));
        assert!(!continue_processing(&exchange, "test"));
        exchange.set_error_handler_handled(Some(false));
        assert!(continue_processing(&exchange, "test"));
        exchange.set_route_stop(true);
        assert!(!continue_processing(&exchange, "test"));
    }

    #[tokio::test]
    async fn test_failing_processor_helper() {
        let failing = FailingProcessor::shared("f", "boom");
        let mut exchange = Exchange::default();
        failing.process(&mut exchange).await;
        assert!(exchange.is_failed());
        assert_eq!(failing.count(), 1);
    }
}
