use crate::advice::{InternalProcessor, MessageHistoryAdvice, TracingAdvice};
use crate::context::RoutingContext;
use crate::endpoint::EndpointError;
use crate::errorhandler::ErrorHandlerFactory;
use crate::exchange::Exchange;
use crate::processor::{Processor, SharedProcessor};
use crate::status::Completion;
use async_trait::async_trait;
use std::sync::Arc;

/// The wrapper around one node of a route.
///
/// From the outside in: the node-level advices (message history, tracing), the error
/// handler when the route handles errors per step, the context's intercept strategies and
/// finally the node's own processor. The first intercept strategy is the outermost one.
pub struct Channel {
    node_id: String,
    target: SharedProcessor,
    output: InternalProcessor,
}

impl Channel {
    pub fn new(
        context: &RoutingContext,
        route_id: Option<&str>,
        node_id: impl Into<String>,
        target: SharedProcessor,
        error_handler: Option<&dyn ErrorHandlerFactory>,
    ) -> Result<Self, EndpointError> {
        let node_id = node_id.into();

        let mut next = target.clone();
        for strategy in context.intercept_strategies().iter().rev() {
            next = strategy.wrap(&node_id, next);
        }

        if let Some(factory) = error_handler {
            next = factory.create_error_handler(context, route_id, next)?;
        }

        let mut output = InternalProcessor::new(node_id.clone(), next);
        if context.is_message_history() {
            output.add_advice(
                MessageHistoryAdvice::new(route_id.map(str::to_string), node_id.clone())
                    .with_clock(context.clock()),
            );
        }
        if let Some(level) = context.tracing() {
            let tracing = TracingAdvice::new(node_id.clone(), level);
            if context.is_structured_logging() {
                output.add_advice(tracing.structured());
            } else {
                output.add_advice(tracing);
            }
        }

        log::trace!(
            "Created channel {} with {} advices",
            node_id,
            output.advice_count()
        );
        Ok(Self {
            node_id,
            target,
            output,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn target(&self) -> &SharedProcessor {
        &self.target
    }

    pub fn shared(self) -> SharedProcessor {
        Arc::new(self)
    }
}

#[async_trait]
impl Processor for Channel {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        self.output.process(exchange).await
    }

    fn name(&self) -> &str {
        &self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advice::MessageHistory;
    use crate::errorhandler::ErrorHandlerBuilder;
    use crate::spi::InterceptStrategy;
    use crate::test_support::{CountingProcessor, FailingProcessor};
    use std::sync::Mutex;

    struct RecordingStrategy {
        label: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    struct Recorded {
        label: &'static str,
        node_id: String,
        seen: Arc<Mutex<Vec<String>>>,
        next: SharedProcessor,
    }

    #[async_trait]
    impl Processor for Recorded {
        async fn process(&self, exchange: &mut Exchange) -> Completion {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, self.node_id));
            self.next.process(exchange).await
        }
    }

    impl InterceptStrategy for RecordingStrategy {
        fn wrap(&self, node_id: &str, target: SharedProcessor) -> SharedProcessor {
            Arc::new(Recorded {
                label: self.label,
                node_id: node_id.to_string(),
                seen: self.seen.clone(),
                next: target,
            })
        }
    }

    #[tokio::test]
    async fn test_intercept_strategies_wrap_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let context = RoutingContext::builder()
            .intercept_strategy(Arc::new(RecordingStrategy {
                label: "first",
                seen: seen.clone(),
            }))
            .intercept_strategy(Arc::new(RecordingStrategy {
                label: "second",
                seen: seen.clone(),
            }))
            .build();
        let target = CountingProcessor::shared("target");
        let channel = Channel::new(&context, Some("r"), "node-1", target.clone(), None).unwrap();
        let mut exchange = Exchange::default();
        channel.process(&mut exchange).await;

        assert_eq!(target.count(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:node-1".to_string(), "second:node-1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_handler_retries_only_this_node() {
        let context = RoutingContext::builder().build();
        let target = FailingProcessor::shared("target", "boom");
        let handler = ErrorHandlerBuilder::default_error_handler()
            .maximum_redeliveries(2)
            .redelivery_delay(1);
        let channel =
            Channel::new(&context, Some("r"), "node-1", target.clone(), Some(&handler)).unwrap();
        let mut exchange = Exchange::default();
        channel.process(&mut exchange).await;
        assert_eq!(target.count(), 3);
        assert!(exchange.is_failed());
    }

    #[tokio::test]
    async fn test_message_history_per_node() {
        let context = RoutingContext::builder().message_history(true).build();
        let channel = Channel::new(
            &context,
            Some("orders"),
            "to-1",
            CountingProcessor::shared("target"),
            None,
        )
        .unwrap();
        let mut exchange = Exchange::default();
        channel.process(&mut exchange).await;
        let history = MessageHistory::of(&exchange);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].node_id, "to-1");
        assert_eq!(history[0].route_id.as_deref(), Some("orders"));
    }
}
