use crate::exchange::{Exchange, ExchangePattern};
use crate::processor::{Processor, SharedProcessor, invoke};
use crate::spi::ExceptionHandler;
use crate::status::Completion;
use async_trait::async_trait;
use std::sync::Arc;

/// Fire-and-forget copy of the exchange to another processor.
///
/// The tapped copy is correlated to the original, is always `InOnly`, and never shares the
/// unit of work. The original continues immediately; failures of the tap are reported to the
/// exception handler and never reach the original exchange.
pub struct WireTap {
    id: String,
    processor: SharedProcessor,
    on_prepare: Option<SharedProcessor>,
    exception_handler: Arc<dyn ExceptionHandler>,
}

impl WireTap {
    pub fn new(
        id: impl Into<String>,
        processor: SharedProcessor,
        exception_handler: Arc<dyn ExceptionHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            processor,
            on_prepare: None,
            exception_handler,
        }
    }

    /// Runs on the tapped copy before it is sent.
    pub fn on_prepare(mut self, processor: SharedProcessor) -> Self {
        self.on_prepare = Some(processor);
        self
    }

    fn tapped_copy(&self, exchange: &Exchange) -> Exchange {
        let mut copy = exchange.correlated_copy(false);
        copy.set_pattern(ExchangePattern::InOnly);
        copy.clear_out();
        copy
    }
}

async fn run_tap(
    id: &str,
    on_prepare: Option<&SharedProcessor>,
    processor: &SharedProcessor,
    handler: &dyn ExceptionHandler,
    mut tapped: Exchange,
) {
    if let Some(prepare) = on_prepare {
        invoke(prepare.as_ref(), &mut tapped).await;
    }
    if !tapped.is_failed() {
        invoke(processor.as_ref(), &mut tapped).await;
    }
    if let Some(exception) = tapped.exception() {
        handler.handle_exception(
            &format!("Error processing wire-tapped exchange in {}", id),
            Some(&tapped),
            exception,
        );
    }
}

#[async_trait]
impl Processor for WireTap {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let tapped = self.tapped_copy(exchange);
        log::trace!("{} tapping exchange {} as {}", self.id, exchange.id(), tapped.id());
        if exchange.requires_synchronous() {
            run_tap(
                &self.id,
                self.on_prepare.as_ref(),
                &self.processor,
                self.exception_handler.as_ref(),
                tapped,
            )
            .await;
            return Completion::Sync;
        }
        let id = self.id.clone();
        let on_prepare = self.on_prepare.clone();
        let processor = self.processor.clone();
        let handler = self.exception_handler.clone();
        tokio::spawn(async move {
            run_tap(&id, on_prepare.as_ref(), &processor, handler.as_ref(), tapped).await;
        });
        Completion::Sync
    }

    fn name(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Exception, keys};
    use crate::processor::process_fn;
    use crate::test_support::FailingProcessor;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CollectingHandler {
        messages: Mutex<Vec<String>>,
    }

    impl ExceptionHandler for CollectingHandler {
        fn handle_exception(&self, message: &str, _exchange: Option<&Exchange>, exception: &Exception) {
            self.messages
                .lock()
                .unwrap()
                .push(format!("{}: {}", message, exception.message()));
        }
    }

    #[tokio::test]
    async fn test_tap_receives_isolated_copy() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let tap = process_fn("tap", move |exchange| {
            exchange.in_mut().set_body("changed by tap");
            let _ = sender.send((
                exchange.id().to_string(),
                exchange.pattern(),
                exchange.property_str(keys::CORRELATION_ID),
            ));
            Ok(())
        });
        let wire_tap = WireTap::new("wt", tap, Arc::new(CollectingHandler::default()));
        let mut exchange = Exchange::builder()
            .pattern(ExchangePattern::InOut)
            .body("original")
            .build();
        let completion = wire_tap.process(&mut exchange).await;
        assert_eq!(completion, Completion::Sync);

        let (tapped_id, pattern, correlation) = receiver.recv().await.unwrap();
        assert_ne!(tapped_id, exchange.id());
        assert_eq!(pattern, ExchangePattern::InOnly);
        assert_eq!(correlation.as_deref(), Some(exchange.id()));
        assert_eq!(exchange.in_message().body().as_text().unwrap(), "original");
        assert_eq!(exchange.pattern(), ExchangePattern::InOut);
    }

    #[tokio::test]
    async fn test_tap_failure_goes_to_handler() {
        let handler = Arc::new(CollectingHandler::default());
        let wire_tap = WireTap::new("wt", FailingProcessor::shared("f", "tap broke"), handler.clone());
        let mut exchange = Exchange::default();
        wire_tap.process(&mut exchange).await;
        assert!(!exchange.is_failed());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let messages = handler.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].ends_with("tap broke"));
    }

    #[tokio::test]
    async fn test_synchronous_exchange_taps_inline() {
        let handler = Arc::new(CollectingHandler::default());
        let failing = FailingProcessor::shared("f", "inline");
        let wire_tap = WireTap::new("wt", failing.clone(), handler.clone());
        let mut exchange = Exchange::builder().transacted(true).build();
        wire_tap.process(&mut exchange).await;
        assert_eq!(failing.count(), 1);
        assert_eq!(handler.messages.lock().unwrap().len(), 1);
    }
}
