use crate::endpoint::{Endpoint, Producer, ProducerCache};
use crate::exchange::{Exception, Exchange, ExchangePattern, keys};
use crate::exchange::exception::classes;
use crate::processor::Processor;
use crate::status::Completion;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Sends the exchange to a fixed endpoint through a pooled producer.
pub struct SendProcessor {
    endpoint: Arc<dyn Endpoint>,
    producers: ProducerCache,
    pattern: Option<ExchangePattern>,
}

impl SendProcessor {
    pub fn new(endpoint: Arc<dyn Endpoint>, producers: ProducerCache) -> Self {
        Self {
            endpoint,
            producers,
            pattern: None,
        }
    }

    /// Sends with `pattern` and restores the exchange's own pattern afterwards.
    pub fn with_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn endpoint_uri(&self) -> &str {
        self.endpoint.uri()
    }
}

#[async_trait]
impl Processor for SendProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let producer = match self.producers.acquire(&self.endpoint) {
            Ok(producer) => producer,
            Err(error) => {
                exchange.set_exception(Exception::new(&classes::NO_SUCH_ENDPOINT, error.to_string()));
                return Completion::Sync;
            }
        };
        exchange.set_property(keys::TO_ENDPOINT, self.endpoint.uri());
        let restore = self.pattern.map(|pattern| {
            let previous = exchange.pattern();
            exchange.set_pattern(pattern);
            previous
        });
        let completion = send_to(&**producer, exchange).await;
        if let Some(previous) = restore {
            exchange.set_pattern(previous);
        }
        completion
    }

    fn name(&self) -> &str {
        self.endpoint.uri()
    }
}

/// Invokes a producer, converting a panic inside it into the exception slot.
pub(crate) async fn send_to(producer: &dyn Producer, exchange: &mut Exchange) -> Completion {
    match AssertUnwindSafe(producer.process(exchange))
        .catch_unwind()
        .await
    {
        Ok(completion) => completion,
        Err(payload) => {
            exchange.set_exception(Exception::from_panic(payload));
            Completion::Sync
        }
    }
}

/// Adapts a leased producer to the processor contract so it can be a fan-out branch.
pub(crate) struct ProducerProcessor {
    producer: Arc<dyn Producer>,
}

impl ProducerProcessor {
    pub(crate) fn new(producer: Arc<dyn Producer>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl Processor for ProducerProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        exchange.set_property(keys::TO_ENDPOINT, self.producer.endpoint_uri());
        send_to(self.producer.as_ref(), exchange).await
    }

    fn name(&self) -> &str {
        self.producer.endpoint_uri()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ProcessorEndpoint;
    use crate::processor::process_fn;
    use crate::test_support::FailingProcessor;

    #[tokio::test]
    async fn test_send_sets_breadcrumb_and_releases() {
        let cache = ProducerCache::new();
        let target = process_fn("target", |exchange| {
            if exchange.pattern() != ExchangePattern::InOut {
                return Err(Exception::illegal_state("expected InOut"));
            }
            exchange.out_mut().set_body("reply");
            Ok(())
        });
        let send = SendProcessor::new(ProcessorEndpoint::shared("direct:target", target), cache.clone())
            .with_pattern(ExchangePattern::InOut);
        let mut exchange = Exchange::default();
        send.process(&mut exchange).await;
        assert!(!exchange.is_failed());
        assert_eq!(exchange.property_str(keys::TO_ENDPOINT).as_deref(), Some("direct:target"));
        assert_eq!(exchange.pattern(), ExchangePattern::InOnly);
        assert_eq!(exchange.message().body().as_text().unwrap(), "reply");
        assert_eq!(cache.acquired_count(), 1);
        assert_eq!(cache.released_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_destination_still_releases() {
        let cache = ProducerCache::new();
        let endpoint = ProcessorEndpoint::shared("direct:f", FailingProcessor::shared("f", "boom"));
        let send = SendProcessor::new(endpoint, cache.clone());
        let mut exchange = Exchange::default();
        send.process(&mut exchange).await;
        assert!(exchange.is_failed());
        assert_eq!(cache.acquired_count(), cache.released_count());
    }
}
