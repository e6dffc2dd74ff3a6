use crate::exchange::{Exception, Exchange, keys};
use crate::logger::{Component, LoggingLevel, RouteLogger};
use crate::processor::{Processor, SharedProcessor, invoke};
use crate::status::Completion;
use async_trait::async_trait;
use uuid::Uuid;

/// Guards a failure processor, such as a dead letter or an exception policy's target.
///
/// A failure raised while handling a failure is logged at ERROR and becomes the caught
/// exception, with the previous one attached as suppressed. Outside a dead letter channel the
/// exchange is marked as not handled so the new failure propagates. An exchange that comes
/// back to a guard it is already inside is not processed again.
pub struct FatalFallbackErrorHandler {
    id: String,
    processor: SharedProcessor,
    dead_letter_channel: bool,
    logger: RouteLogger,
}

impl FatalFallbackErrorHandler {
    pub fn new(processor: SharedProcessor, dead_letter_channel: bool) -> Self {
        Self {
            id: format!("{}@{}", processor.name(), Uuid::new_v4()),
            processor,
            dead_letter_channel,
            logger: RouteLogger::new(Component::ErrorHandler),
        }
    }

    pub fn is_dead_letter_channel(&self) -> bool {
        self.dead_letter_channel
    }

    fn enter(&self, exchange: &mut Exchange) -> bool {
        let stack = exchange
            .attachments_mut()
            .get_or_default::<Vec<String>>(keys::FATAL_FALLBACK_ERROR_HANDLER);
        if stack.contains(&self.id) {
            return false;
        }
        stack.push(self.id.clone());
        true
    }

    fn leave(&self, exchange: &mut Exchange) {
        if let Some(stack) = exchange
            .attachments_mut()
            .get_mut::<Vec<String>>(keys::FATAL_FALLBACK_ERROR_HANDLER)
            && let Some(position) = stack.iter().rposition(|id| id == &self.id)
        {
            stack.remove(position);
        }
    }
}

#[async_trait]
impl Processor for FatalFallbackErrorHandler {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        if !self.enter(exchange) {
            self.logger.log(
                LoggingLevel::ERROR,
                Some(exchange.id()),
                format!(
                    "Circular error handler detected at {}. Breaking out of processing.",
                    self.processor.name()
                ),
            );
            exchange.set_error_handler_handled(Some(false));
            return Completion::Sync;
        }

        let completion = invoke(self.processor.as_ref(), exchange).await;
        self.leave(exchange);

        if let Some(mut failure) = exchange.take_exception() {
            self.logger.log(
                LoggingLevel::ERROR,
                Some(exchange.id()),
                format!(
                    "Exception occurred while trying to handle previously thrown exception using {}. {}",
                    self.processor.name(),
                    failure.describe(true)
                ),
            );
            if let Some(previous) = exchange.caught_exception()
                && !previous.same_as(&failure)
            {
                failure.add_suppressed(previous.clone());
            }
            exchange.set_caught_exception(Some(failure.clone()));
            exchange.set_exception(failure);
            if self.dead_letter_channel {
                exchange.set_error_handler_handled(None);
            } else {
                exchange.set_error_handler_handled(Some(false));
            }
        }
        completion
    }

    fn name(&self) -> &str {
        self.processor.name()
    }
}
