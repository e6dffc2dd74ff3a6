pub mod exception_policy;
pub mod fatal;
pub mod policy;

pub use exception_policy::{ExceptionPolicy, ExceptionPolicyTable};
pub use fatal::FatalFallbackErrorHandler;
pub use policy::{DelayPattern, DelayPatternError, RedeliveryPolicy, RedeliveryPolicyOverride};

use crate::config::ConfigProviderError;
use crate::context::RoutingContext;
use crate::endpoint::EndpointError;
use crate::exchange::exception::classes;
use crate::exchange::{Exception, Exchange, Message, keys};
use crate::expression::SharedPredicate;
use crate::logger::{Component, RouteLogger};
use crate::processor::send::SendProcessor;
use crate::processor::{Processor, SharedProcessor, invoke};
use crate::spi::{DefaultShutdownStrategy, ShutdownStrategy, sleep_interruptibly};
use crate::status::Completion;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Per-exchange state of one pass through a [`RedeliveryErrorHandler`].
struct RedeliveryData {
    counter: u32,
    delay: u64,
    policy: RedeliveryPolicy,
    handled: Option<SharedPredicate>,
    continued: Option<SharedPredicate>,
    retry_while: Option<SharedPredicate>,
    use_original_message: bool,
    use_original_body: bool,
    failure_processor: Option<SharedProcessor>,
    on_redelivery: Option<SharedProcessor>,
    on_exception_occurred: Option<SharedProcessor>,
    original: Option<Message>,
}

impl RedeliveryData {
    fn new(handler: &RedeliveryErrorHandler, exchange: &Exchange) -> Self {
        let mut data = Self {
            counter: 0,
            delay: 0,
            policy: handler.redelivery_policy.clone(),
            handled: None,
            continued: None,
            retry_while: None,
            use_original_message: false,
            use_original_body: false,
            failure_processor: None,
            on_redelivery: None,
            on_exception_occurred: None,
            original: handler
                .redelivery_enabled
                .then(|| exchange.in_message().clone()),
        };
        data.reset(handler);
        data
    }

    /// Back to the handler's own settings before an exception policy is applied.
    fn reset(&mut self, handler: &RedeliveryErrorHandler) {
        self.policy = handler.redelivery_policy.clone();
        self.handled = handler.handled.clone();
        self.continued = None;
        self.retry_while = handler.retry_while.clone();
        self.use_original_message = handler.use_original_message;
        self.use_original_body = handler.use_original_body;
        self.failure_processor = None;
        self.on_redelivery = handler.on_redelivery.clone();
        self.on_exception_occurred = handler.on_exception_occurred.clone();
    }

    fn apply(&mut self, policy: &ExceptionPolicy, base: &RedeliveryPolicy) {
        self.policy = policy.redelivery_policy(base);
        if let Some(handled) = policy.handled_predicate() {
            self.handled = Some(handled.clone());
        }
        if let Some(continued) = policy.continued_predicate() {
            self.continued = Some(continued.clone());
        }
        if let Some(retry_while) = policy.retry_while_predicate() {
            self.retry_while = Some(retry_while.clone());
        }
        self.use_original_message |= policy.is_use_original_message();
        self.use_original_body |= policy.is_use_original_body();
        if let Some(processor) = policy.failure_processor() {
            self.failure_processor = Some(processor.clone());
        }
        if let Some(processor) = policy.on_redelivery_processor() {
            self.on_redelivery = Some(processor.clone());
        }
        if let Some(processor) = policy.on_exception_occurred_processor() {
            self.on_exception_occurred = Some(processor.clone());
        }
    }
}

/// Retries a failing output according to a [`RedeliveryPolicy`], then hands the exchange to a
/// failure processor and decides whether the failure is handled, continued or propagated.
///
/// The exception policies registered on the handler can replace the redelivery policy and
/// the handled/continued/retry-while decisions for the failures they match.
pub struct RedeliveryErrorHandler {
    output: SharedProcessor,
    route_id: Option<String>,
    redelivery_policy: RedeliveryPolicy,
    policies: ExceptionPolicyTable,
    dead_letter: Option<SharedProcessor>,
    dead_letter_uri: Option<String>,
    dead_letter_handle_new_exception: bool,
    handled: Option<SharedPredicate>,
    retry_while: Option<SharedPredicate>,
    use_original_message: bool,
    use_original_body: bool,
    on_redelivery: Option<SharedProcessor>,
    on_exception_occurred: Option<SharedProcessor>,
    on_prepare_failure: Option<SharedProcessor>,
    shutdown: Arc<dyn ShutdownStrategy>,
    logger: RouteLogger,
    redelivery_enabled: bool,
}

impl RedeliveryErrorHandler {
    pub fn new(output: SharedProcessor) -> Self {
        Self {
            output,
            route_id: None,
            redelivery_policy: RedeliveryPolicy::default(),
            policies: ExceptionPolicyTable::new(),
            dead_letter: None,
            dead_letter_uri: None,
            dead_letter_handle_new_exception: true,
            handled: None,
            retry_while: None,
            use_original_message: false,
            use_original_body: false,
            on_redelivery: None,
            on_exception_occurred: None,
            on_prepare_failure: None,
            shutdown: Arc::new(DefaultShutdownStrategy::new()),
            logger: RouteLogger::new(Component::ErrorHandler),
            redelivery_enabled: false,
        }
        .refresh()
    }

    fn refresh(mut self) -> Self {
        self.redelivery_enabled = self.redelivery_policy.maximum_redeliveries != 0
            || self.retry_while.is_some()
            || self.policies.allows_redelivery(&self.redelivery_policy);
        self
    }

    pub fn route_id(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = Some(route_id.into());
        self
    }

    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery_policy = policy;
        self.refresh()
    }

    pub fn exception_policies(mut self, policies: ExceptionPolicyTable) -> Self {
        self.policies = policies;
        self.refresh()
    }

    pub fn retry_while(mut self, predicate: SharedPredicate) -> Self {
        self.retry_while = Some(predicate);
        self.refresh()
    }

    /// Default "handled" decision for failures no exception policy decides.
    pub fn handled(mut self, predicate: SharedPredicate) -> Self {
        self.handled = Some(predicate);
        self
    }

    pub fn use_original_message(mut self, use_original: bool) -> Self {
        self.use_original_message = use_original;
        self
    }

    pub fn use_original_body(mut self, use_original: bool) -> Self {
        self.use_original_body = use_original;
        self
    }

    pub fn on_redelivery(mut self, processor: SharedProcessor) -> Self {
        self.on_redelivery = Some(processor);
        self
    }

    pub fn on_exception_occurred(mut self, processor: SharedProcessor) -> Self {
        self.on_exception_occurred = Some(processor);
        self
    }

    pub fn on_prepare_failure(mut self, processor: SharedProcessor) -> Self {
        self.on_prepare_failure = Some(processor);
        self
    }

    pub fn shutdown_strategy(mut self, shutdown: Arc<dyn ShutdownStrategy>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn logger(mut self, logger: RouteLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn output(&self) -> &SharedProcessor {
        &self.output
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.redelivery_policy
    }

    pub fn is_dead_letter_channel(&self) -> bool {
        self.dead_letter.is_some()
    }

    pub fn dead_letter_uri(&self) -> Option<&str> {
        self.dead_letter_uri.as_deref()
    }

    fn route_id_of(&self, exchange: &Exchange) -> Option<String> {
        exchange.current_route_id().or_else(|| self.route_id.clone())
    }

    fn is_run_allowed(&self, data: &RedeliveryData) -> bool {
        let forced = self.shutdown.is_forced_shutdown();
        if data.counter == 0 {
            return !forced;
        }
        if forced {
            return self.is_dead_letter_channel();
        }
        if data.policy.allow_redelivery_while_stopping || !self.shutdown.is_stopping() {
            return true;
        }
        self.is_dead_letter_channel()
    }

    fn is_redelivery_allowed(&self, data: &RedeliveryData) -> bool {
        if self.shutdown.is_forced_shutdown() {
            return false;
        }
        !self.shutdown.is_stopping() || data.policy.allow_redelivery_while_stopping
    }

    fn is_done(exchange: &Exchange) -> bool {
        let interrupted = exchange
            .exception()
            .map(|e| e.is_instance_of(&classes::INTERRUPTED))
            .unwrap_or(false);
        interrupted
            || !exchange.is_failed()
            || exchange.is_failure_handled()
            || exchange.is_redelivery_exhausted()
    }

    fn handle_exception(&self, exchange: &mut Exchange, data: &mut RedeliveryData) {
        let Some(failure) = exchange.exception().cloned() else {
            return;
        };
        exchange.set_caught_exception(Some(failure.clone()));

        data.reset(self);
        let route_id = self.route_id_of(exchange);
        if let Some(policy) = self.policies.find(exchange, &failure, route_id.as_deref()) {
            data.apply(policy, &self.redelivery_policy);
        }

        if !exchange.is_failure_handled() {
            let message = format!(
                "Failed delivery for (ExchangeId: {}). On delivery attempt: {} caught: {}",
                exchange.id(),
                data.counter,
                failure
            );
            self.log_failed_delivery(true, false, false, false, exchange, &message, Some(&failure), data);
        }

        Self::increment_redelivery_counter(exchange, data);
    }

    async fn run_on_exception_occurred(&self, exchange: &mut Exchange, data: &RedeliveryData) {
        let Some(processor) = data.on_exception_occurred.clone() else {
            return;
        };
        let Some(original) = exchange.exception().cloned() else {
            return;
        };
        log::trace!(
            "OnExceptionOccurred processor {} is processing exchange {}",
            processor.name(),
            exchange.id()
        );
        invoke(processor.as_ref(), exchange).await;
        let replaced = exchange
            .exception()
            .map(|current| !current.same_as(&original))
            .unwrap_or(true);
        if replaced {
            if let Some(current) = exchange.exception()
                && !current.same_as(&original)
            {
                log::warn!(
                    "Error during processing OnExceptionOccurred for exchange {}. This exception is ignored. {}",
                    exchange.id(),
                    current
                );
            }
            exchange.set_exception(original);
        }
    }

    async fn sleep(&self, delay_ms: u64, policy: &RedeliveryPolicy) -> bool {
        log::debug!("Sleeping for {} millis until attempting redelivery", delay_ms);
        let deadline = Instant::now() + Duration::from_millis(delay_ms);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let slice = (deadline - now).min(SLEEP_SLICE);
            if self.shutdown.is_stopping() {
                tokio::time::sleep(slice).await;
            } else {
                sleep_interruptibly(self.shutdown.as_ref(), slice).await;
            }
            if self.shutdown.is_stopping() && !policy.allow_redelivery_while_stopping {
                log::debug!("Rejected redelivery while stopping");
                return false;
            }
        }
    }

    fn prepare_exchange_for_redelivery(&self, exchange: &mut Exchange, data: &RedeliveryData) {
        exchange.clear_exception();
        exchange.set_rollback_only(false);
        exchange.in_mut().reset_stream_cache();

        if let Some(original) = &data.original {
            exchange.set_in(original.clone());
            exchange.clear_out();
        }
        Self::write_redelivery_headers(exchange, data);
    }

    async fn deliver_to_on_redelivery_processor(&self, exchange: &mut Exchange, data: &RedeliveryData) {
        let Some(processor) = &data.on_redelivery else {
            return;
        };
        log::trace!(
            "Redelivery processor {} is processing exchange {} before its redelivery attempt {}",
            processor.name(),
            exchange.id(),
            data.counter
        );
        invoke(processor.as_ref(), exchange).await;
    }

    async fn run_on_prepare_failure(&self, exchange: &mut Exchange) {
        if let Some(processor) = &self.on_prepare_failure {
            log::trace!(
                "OnPrepare processor {} is processing exchange {}",
                processor.name(),
                exchange.id()
            );
            invoke(processor.as_ref(), exchange).await;
        }
    }

    async fn deliver_to_failure_processor(
        &self,
        target: Option<SharedProcessor>,
        dead_letter_channel: bool,
        exchange: &mut Exchange,
        data: &RedeliveryData,
    ) -> Completion {
        let caught = exchange.take_exception();

        let should_handle = data
            .handled
            .as_ref()
            .map(|predicate| predicate.matches(exchange))
            .unwrap_or(false);
        let should_continue = data
            .continued
            .as_ref()
            .map(|predicate| predicate.matches(exchange))
            .unwrap_or(false);

        let handle_or_continue = dead_letter_channel || should_handle || should_continue;
        if handle_or_continue {
            Self::remove_redelivery_headers(exchange);
            exchange.set_redelivery_exhausted(false);
            exchange.set_rollback_only(false);
        } else {
            Self::decrement_redelivery_counter(exchange, data);
        }

        let allow_failure_processor = !should_continue || !dead_letter_channel;
        let processor = target.filter(|_| allow_failure_processor);
        let mut completion = Completion::Sync;
        match &processor {
            Some(processor) => {
                if data.use_original_message || data.use_original_body {
                    Self::restore_original(exchange, data.use_original_message);
                }
                exchange.in_mut().reset_stream_cache();
                self.run_on_prepare_failure(exchange).await;

                if let Some(to_endpoint) = exchange.property(keys::TO_ENDPOINT) {
                    exchange.set_property(keys::FAILURE_ENDPOINT, to_endpoint);
                }
                if let Some(route_id) = self.route_id_of(exchange) {
                    exchange.set_property(keys::FAILURE_ROUTE_ID, route_id);
                }

                if !exchange.is_failed() {
                    log::trace!(
                        "Failure processor {} is processing exchange {}",
                        processor.name(),
                        exchange.id()
                    );
                    completion = invoke(processor.as_ref(), exchange).await;
                }
                self.prepare_exchange_after_failure(
                    exchange,
                    dead_letter_channel,
                    should_handle,
                    should_continue,
                    data,
                );
            }
            None => {
                self.run_on_prepare_failure(exchange).await;
                self.prepare_exchange_after_failure(
                    exchange,
                    dead_letter_channel,
                    should_handle,
                    should_continue,
                    data,
                );
            }
        }

        let mut message = format!(
            "Failed delivery for (ExchangeId: {}). Exhausted after delivery attempt: {} caught: {}",
            exchange.id(),
            data.counter,
            caught
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string())
        );
        if let Some(processor) = &processor {
            match (&self.dead_letter_uri, dead_letter_channel) {
                (Some(uri), true) => {
                    message.push_str(&format!(". Handled by DeadLetterChannel: [{}]", uri))
                }
                _ => message.push_str(&format!(
                    ". Processed by failure processor: {}",
                    processor.name()
                )),
            }
        }
        self.log_failed_delivery(
            false,
            false,
            handle_or_continue,
            false,
            exchange,
            &message,
            caught.as_ref(),
            data,
        );
        completion
    }

    fn prepare_exchange_after_failure(
        &self,
        exchange: &mut Exchange,
        dead_letter_channel: bool,
        should_handle: bool,
        should_continue: bool,
        data: &RedeliveryData,
    ) {
        let new_exception = exchange.exception().cloned();
        exchange.set_failure_handled(true);

        if exchange.error_handler_handled() == Some(false) {
            log::trace!(
                "Exchange {} is already marked as not handled by the error handler",
                exchange.id()
            );
            Self::restore_caught_exception(exchange);
            return;
        }

        if should_continue {
            self.prepare_exchange_for_continue(exchange, data);
            return;
        }

        if should_handle {
            log::trace!("Exchange {} is handled so it is marked as not failed", exchange.id());
            exchange.set_error_handler_handled(Some(true));
            return;
        }

        if dead_letter_channel {
            let handled = new_exception.is_none() || self.dead_letter_handle_new_exception;
            if let Some(new_exception) = &new_exception
                && data.policy.log_new_exception
            {
                let message = format!(
                    "New exception occurred during processing by the DeadLetterChannel[{}] due {}",
                    self.dead_letter_uri.as_deref().unwrap_or("processor"),
                    new_exception
                );
                self.log_failed_delivery(
                    false,
                    true,
                    handled,
                    false,
                    exchange,
                    &message,
                    Some(new_exception),
                    data,
                );
            }
            if handled {
                if let Some(new_exception) = exchange.take_exception()
                    && let Some(mut caught) = exchange.caught_exception().cloned()
                    && !caught.same_as(&new_exception)
                {
                    caught.add_suppressed(new_exception);
                    exchange.set_caught_exception(Some(caught));
                }
                exchange.set_error_handler_handled(Some(true));
                return;
            }
        }

        log::trace!(
            "Exchange {} is not handled, restoring the caught exception",
            exchange.id()
        );
        exchange.set_error_handler_handled(Some(false));
        Self::restore_caught_exception(exchange);
    }

    fn prepare_exchange_for_continue(&self, exchange: &mut Exchange, data: &RedeliveryData) {
        let caught = exchange
            .caught_exception()
            .map(ToString::to_string)
            .unwrap_or_default();
        exchange.clear_exception();
        exchange.set_rollback_only(false);
        exchange.in_mut().reset_stream_cache();
        Self::remove_redelivery_headers(exchange);
        exchange.set_failure_handled(false);

        let message = format!(
            "Failed delivery for (ExchangeId: {}). Exhausted after delivery attempt: {} caught: {}. Handled and continue routing.",
            exchange.id(),
            data.counter,
            caught
        );
        self.log_failed_delivery(false, false, false, true, exchange, &message, None, data);
    }

    fn restore_caught_exception(exchange: &mut Exchange) {
        if let Some(caught) = exchange.caught_exception().cloned() {
            exchange.set_exception(caught);
        }
    }

    fn restore_original(exchange: &mut Exchange, whole_message: bool) {
        let Some(original) = exchange
            .unit_of_work()
            .map(|uow| uow.original_in_message().clone())
        else {
            return;
        };
        if whole_message {
            exchange.set_in(original);
            exchange.clear_out();
        } else {
            let mut original = original;
            exchange.in_mut().set_body(original.take_body());
        }
    }

    /// The attempt count lives in `data`. The headers only mirror it, a step may replace the
    /// in-message and drop them.
    fn increment_redelivery_counter(exchange: &mut Exchange, data: &mut RedeliveryData) {
        data.counter += 1;
        Self::write_redelivery_headers(exchange, data);
    }

    fn write_redelivery_headers(exchange: &mut Exchange, data: &RedeliveryData) {
        let message = exchange.in_mut();
        message.set_header(keys::REDELIVERY_COUNTER, data.counter);
        message.set_header(keys::REDELIVERED, data.counter > 0);
        if data.policy.maximum_redeliveries > 0 {
            message.set_header(keys::REDELIVERY_MAX_COUNTER, data.policy.maximum_redeliveries);
        }
    }

    fn decrement_redelivery_counter(exchange: &mut Exchange, data: &RedeliveryData) {
        let previous = data.counter.saturating_sub(1);
        let message = exchange.in_mut();
        message.set_header(keys::REDELIVERY_COUNTER, previous);
        message.set_header(keys::REDELIVERED, previous > 0);
    }

    fn remove_redelivery_headers(exchange: &mut Exchange) {
        let message = exchange.in_mut();
        message.remove_header(keys::REDELIVERED);
        message.remove_header(keys::REDELIVERY_COUNTER);
        message.remove_header(keys::REDELIVERY_MAX_COUNTER);
    }

    #[allow(clippy::too_many_arguments)]
    fn log_failed_delivery(
        &self,
        should_redeliver: bool,
        new_exception: bool,
        handled: bool,
        continued: bool,
        exchange: &Exchange,
        message: &str,
        failure: Option<&Exception>,
        data: &RedeliveryData,
    ) {
        let policy = &data.policy;
        let rollback = exchange.flags().is_rollback();
        if !rollback {
            if new_exception && !policy.log_new_exception {
                return;
            }
            if handled && !policy.log_handled {
                return;
            }
            if continued && !policy.log_continued {
                return;
            }
            if should_redeliver
                && (!policy.log_retry_attempted || !policy.is_retry_logged(data.counter))
            {
                return;
            }
            if !should_redeliver && !new_exception && !policy.log_exhausted {
                return;
            }
        }

        let (level, stack_trace) = if rollback || !should_redeliver {
            (policy.retries_exhausted_log_level, policy.log_stack_trace)
        } else {
            (policy.retry_attempted_log_level, policy.log_retry_stack_trace)
        };
        if !self.logger.is_enabled(level) {
            return;
        }

        let failure = failure.or(exchange.caught_exception());
        let text = if rollback {
            match failure {
                Some(failure) => format!(
                    "Rollback (ExchangeId: {}) due: {}",
                    exchange.id(),
                    failure.message()
                ),
                None => format!("Rollback (ExchangeId: {})", exchange.id()),
            }
        } else {
            match failure {
                Some(failure) if stack_trace => {
                    format!("{}\n{}", message, failure.describe(true))
                }
                _ => message.to_string(),
            }
        };
        self.logger.log(level, Some(exchange.id()), text);
    }
}

#[async_trait]
impl Processor for RedeliveryErrorHandler {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let mut data = RedeliveryData::new(self, exchange);
        let mut completion = Completion::Sync;

        loop {
            if !self.is_run_allowed(&data) {
                log::trace!("Run not allowed, rejecting exchange {}", exchange.id());
                if !exchange.is_failed() {
                    exchange.set_exception(Exception::rejected_execution(format!(
                        "Run not allowed for exchange {} as the error handler is shutting down",
                        exchange.id()
                    )));
                }
                return completion;
            }

            if exchange.is_failed() {
                self.handle_exception(exchange, &mut data);
                self.run_on_exception_occurred(exchange, &data).await;
            }

            let mut redeliver_allowed = data.counter == 0 || self.is_redelivery_allowed(&data);
            let mut exhausted = false;
            if redeliver_allowed {
                exhausted = exchange.is_redelivery_exhausted() || exchange.is_rollback_only();
                if !exhausted && data.counter > 0 {
                    redeliver_allowed = data.policy.should_redeliver(
                        exchange,
                        data.counter,
                        data.retry_while.as_ref(),
                    );
                }
            }

            if !redeliver_allowed || exhausted {
                let (target, dead_letter_channel) = match &data.failure_processor {
                    Some(processor) => (Some(processor.clone()), false),
                    None => (self.dead_letter.clone(), self.is_dead_letter_channel()),
                };
                let delivered = self
                    .deliver_to_failure_processor(target, dead_letter_channel, exchange, &data)
                    .await;
                return completion.and(delivered);
            }

            if data.counter > 0 {
                data.delay = data
                    .policy
                    .calculate_redelivery_delay(data.delay, data.counter);
                if data.delay > 0 {
                    completion = Completion::Async;
                    if !self.sleep(data.delay, &data.policy).await {
                        exchange.set_exception(Exception::rejected_execution(
                            "Redelivery not allowed while stopping",
                        ));
                        exchange.set_redelivery_exhausted(true);
                        continue;
                    }
                }
                self.prepare_exchange_for_redelivery(exchange, &data);
                self.deliver_to_on_redelivery_processor(exchange, &data).await;
                if exchange.is_failed() {
                    // counted as a spent attempt, the output is not invoked
                    continue;
                }
                log::debug!(
                    "Redelivery attempt {} of exchange {}",
                    data.counter,
                    exchange.id()
                );
            }

            completion = completion.and(invoke(self.output.as_ref(), exchange).await);
            if Self::is_done(exchange) {
                return completion;
            }
        }
    }

    fn name(&self) -> &str {
        self.output.name()
    }
}

/// A [`RedeliveryErrorHandler`] whose failure destination is always a dead letter.
///
/// Exhausted exchanges are handled once the dead letter received them, including when the
/// dead letter itself fails, unless `dead_letter_handle_new_exception` is turned off.
/// Exhausted redeliveries still reach the dead letter while the context shuts down.
pub struct DeadLetterChannel {
    handler: RedeliveryErrorHandler,
}

impl DeadLetterChannel {
    pub fn new(handler: RedeliveryErrorHandler, dead_letter: SharedProcessor) -> Self {
        let mut handler = handler;
        handler.dead_letter = Some(Arc::new(FatalFallbackErrorHandler::new(dead_letter, true)));
        Self { handler }
    }

    pub fn dead_letter_uri(mut self, uri: impl Into<String>) -> Self {
        self.handler.dead_letter_uri = Some(uri.into());
        self
    }

    pub fn dead_letter_handle_new_exception(mut self, handle: bool) -> Self {
        self.handler.dead_letter_handle_new_exception = handle;
        self
    }

    pub fn into_inner(self) -> RedeliveryErrorHandler {
        self.handler
    }
}

impl Deref for DeadLetterChannel {
    type Target = RedeliveryErrorHandler;

    fn deref(&self) -> &Self::Target {
        &self.handler
    }
}

#[async_trait]
impl Processor for DeadLetterChannel {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        self.handler.process(exchange).await
    }

    fn name(&self) -> &str {
        self.handler.name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlerType {
    #[default]
    #[serde(alias = "defaultErrorHandler")]
    Default,
    #[serde(alias = "deadLetterChannel")]
    DeadLetterChannel,
    #[serde(alias = "noErrorHandler")]
    None,
}

/// Serializable description of an error handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlerConfig {
    #[serde(rename = "type")]
    pub error_handler_type: ErrorHandlerType,
    #[serde(alias = "deadLetterUri")]
    pub dead_letter_uri: Option<String>,
    #[serde(alias = "deadLetterHandleNewException")]
    pub dead_letter_handle_new_exception: bool,
    #[serde(alias = "useOriginalMessage")]
    pub use_original_message: bool,
    #[serde(alias = "useOriginalBody")]
    pub use_original_body: bool,
    #[serde(alias = "redeliveryPolicy")]
    pub redelivery_policy: RedeliveryPolicy,
    #[serde(alias = "structuredLogging")]
    pub structured_logging: bool,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            error_handler_type: ErrorHandlerType::Default,
            dead_letter_uri: None,
            dead_letter_handle_new_exception: true,
            use_original_message: false,
            use_original_body: false,
            redelivery_policy: RedeliveryPolicy::default(),
            structured_logging: false,
        }
    }
}

/// Wraps a route's processors in an error handler.
pub trait ErrorHandlerFactory: Send + Sync {
    fn create_error_handler(
        &self,
        context: &RoutingContext,
        route_id: Option<&str>,
        output: SharedProcessor,
    ) -> Result<SharedProcessor, EndpointError>;
}

#[derive(Clone)]
enum DeadLetter {
    Uri(String),
    Processor(SharedProcessor),
}

/// Describes an error handler and creates one per wrapped processor.
///
/// ```rust
/// use idemio_route::errorhandler::{ErrorHandlerBuilder, RedeliveryPolicy};
///
/// let builder = ErrorHandlerBuilder::dead_letter_channel("direct:dead")
///     .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(3))
///     .use_original_message();
/// assert!(builder.is_dead_letter_channel());
/// ```
#[derive(Clone)]
pub struct ErrorHandlerBuilder {
    error_handler_type: ErrorHandlerType,
    dead_letter: Option<DeadLetter>,
    dead_letter_handle_new_exception: bool,
    redelivery_policy: RedeliveryPolicy,
    policies: ExceptionPolicyTable,
    retry_while: Option<SharedPredicate>,
    use_original_message: bool,
    use_original_body: bool,
    on_redelivery: Option<SharedProcessor>,
    on_exception_occurred: Option<SharedProcessor>,
    on_prepare_failure: Option<SharedProcessor>,
    structured_logging: bool,
}

impl Default for ErrorHandlerBuilder {
    fn default() -> Self {
        Self::default_error_handler()
    }
}

impl ErrorHandlerBuilder {
    fn of(error_handler_type: ErrorHandlerType, dead_letter: Option<DeadLetter>) -> Self {
        Self {
            error_handler_type,
            dead_letter,
            dead_letter_handle_new_exception: true,
            redelivery_policy: RedeliveryPolicy::default(),
            policies: ExceptionPolicyTable::new(),
            retry_while: None,
            use_original_message: false,
            use_original_body: false,
            on_redelivery: None,
            on_exception_occurred: None,
            on_prepare_failure: None,
            structured_logging: false,
        }
    }

    pub fn default_error_handler() -> Self {
        Self::of(ErrorHandlerType::Default, None)
    }

    pub fn dead_letter_channel(uri: impl Into<String>) -> Self {
        Self::of(
            ErrorHandlerType::DeadLetterChannel,
            Some(DeadLetter::Uri(uri.into())),
        )
    }

    pub fn dead_letter_processor(processor: SharedProcessor) -> Self {
        Self::of(
            ErrorHandlerType::DeadLetterChannel,
            Some(DeadLetter::Processor(processor)),
        )
    }

    pub fn no_error_handler() -> Self {
        Self::of(ErrorHandlerType::None, None)
    }

    pub fn from_config(config: &ErrorHandlerConfig) -> Result<Self, ConfigProviderError> {
        let builder = match config.error_handler_type {
            ErrorHandlerType::Default => Self::default_error_handler(),
            ErrorHandlerType::None => Self::no_error_handler(),
            ErrorHandlerType::DeadLetterChannel => match &config.dead_letter_uri {
                Some(uri) => Self::dead_letter_channel(uri.clone()),
                None => {
                    return Err(ConfigProviderError::invalid(
                        "a dead letter channel requires a dead_letter_uri",
                    ));
                }
            },
        };
        let mut builder = builder
            .redelivery_policy(config.redelivery_policy.clone())
            .dead_letter_handle_new_exception(config.dead_letter_handle_new_exception)
            .structured_logging(config.structured_logging);
        builder.use_original_message = config.use_original_message;
        builder.use_original_body = config.use_original_body;
        Ok(builder)
    }

    pub fn error_handler_type(&self) -> ErrorHandlerType {
        self.error_handler_type
    }

    pub fn is_dead_letter_channel(&self) -> bool {
        self.error_handler_type == ErrorHandlerType::DeadLetterChannel
    }

    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery_policy = policy;
        self
    }

    pub fn maximum_redeliveries(mut self, maximum: i32) -> Self {
        self.redelivery_policy.maximum_redeliveries = maximum;
        self
    }

    pub fn redelivery_delay(mut self, delay_ms: u64) -> Self {
        self.redelivery_policy.redelivery_delay_ms = delay_ms;
        self
    }

    pub fn exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.policies.add(policy);
        self
    }

    pub fn retry_while(mut self, predicate: SharedPredicate) -> Self {
        self.retry_while = Some(predicate);
        self
    }

    pub fn use_original_message(mut self) -> Self {
        self.use_original_message = true;
        self
    }

    pub fn use_original_body(mut self) -> Self {
        self.use_original_body = true;
        self
    }

    pub fn on_redelivery(mut self, processor: SharedProcessor) -> Self {
        self.on_redelivery = Some(processor);
        self
    }

    pub fn on_exception_occurred(mut self, processor: SharedProcessor) -> Self {
        self.on_exception_occurred = Some(processor);
        self
    }

    pub fn on_prepare_failure(mut self, processor: SharedProcessor) -> Self {
        self.on_prepare_failure = Some(processor);
        self
    }

    pub fn dead_letter_handle_new_exception(mut self, handle: bool) -> Self {
        self.dead_letter_handle_new_exception = handle;
        self
    }

    pub fn structured_logging(mut self, structured: bool) -> Self {
        self.structured_logging = structured;
        self
    }

    fn handler(
        &self,
        route_id: Option<&str>,
        output: SharedProcessor,
        shutdown: Arc<dyn ShutdownStrategy>,
    ) -> RedeliveryErrorHandler {
        let logger = if self.structured_logging {
            RouteLogger::structured(Component::ErrorHandler)
        } else {
            RouteLogger::new(Component::ErrorHandler)
        };
        let mut handler = RedeliveryErrorHandler::new(output)
            .redelivery_policy(self.redelivery_policy.clone())
            .exception_policies(self.policies.clone())
            .use_original_message(self.use_original_message)
            .use_original_body(self.use_original_body)
            .shutdown_strategy(shutdown)
            .logger(logger);
        if let Some(route_id) = route_id {
            handler = handler.route_id(route_id);
        }
        if let Some(predicate) = &self.retry_while {
            handler = handler.retry_while(predicate.clone());
        }
        if let Some(processor) = &self.on_redelivery {
            handler = handler.on_redelivery(processor.clone());
        }
        if let Some(processor) = &self.on_exception_occurred {
            handler = handler.on_exception_occurred(processor.clone());
        }
        if let Some(processor) = &self.on_prepare_failure {
            handler = handler.on_prepare_failure(processor.clone());
        }
        handler
    }
}

impl ErrorHandlerFactory for ErrorHandlerBuilder {
    fn create_error_handler(
        &self,
        context: &RoutingContext,
        route_id: Option<&str>,
        output: SharedProcessor,
    ) -> Result<SharedProcessor, EndpointError> {
        let shutdown = context.shutdown_strategy();
        match (&self.error_handler_type, &self.dead_letter) {
            (ErrorHandlerType::None, _) => Ok(output),
            (ErrorHandlerType::DeadLetterChannel, Some(dead_letter)) => {
                let (processor, uri): (SharedProcessor, Option<String>) = match dead_letter {
                    DeadLetter::Uri(uri) => {
                        let endpoint = context.endpoints().resolve(uri)?;
                        let sender = SendProcessor::new(endpoint, context.producer_cache().clone());
                        (Arc::new(sender), Some(uri.clone()))
                    }
                    DeadLetter::Processor(processor) => (processor.clone(), None),
                };
                let mut channel = DeadLetterChannel::new(self.handler(route_id, output, shutdown), processor)
                    .dead_letter_handle_new_exception(self.dead_letter_handle_new_exception);
                if let Some(uri) = uri {
                    channel = channel.dead_letter_uri(uri);
                }
                Ok(Arc::new(channel))
            }
            _ => Ok(Arc::new(self.handler(route_id, output, shutdown))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::predicate;
    use crate::processor::pipeline::Pipeline;
    use crate::processor::{continue_processing, process_fn};
    use crate::test_support::{CountingProcessor, FailingProcessor, RecordingProcessor, call_log, entries};
    use crate::unit_of_work::UnitOfWork;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_header(exchange: &Exchange) -> Option<u64> {
        exchange
            .in_message()
            .header(keys::REDELIVERY_COUNTER)
            .and_then(Value::as_u64)
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivers_exactly_max_times_then_dead_letter_once() {
        let target = FailingProcessor::shared("target", "always");
        let dead_letter = CountingProcessor::shared("dlq");
        let handler = DeadLetterChannel::new(
            RedeliveryErrorHandler::new(target.clone())
                .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(3).redelivery_delay(10)),
            dead_letter.clone(),
        );
        let mut exchange = Exchange::with_body("order");
        handler.process(&mut exchange).await;

        assert_eq!(target.count(), 4);
        assert_eq!(dead_letter.count(), 1);
        assert!(!exchange.is_failed());
        assert!(exchange.is_error_handler_handled());
        assert_eq!(exchange.caught_exception().unwrap().message(), "always");
        assert!(!exchange.in_message().has_header(keys::REDELIVERY_COUNTER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_redeliveries_invokes_once() {
        let target = FailingProcessor::shared("target", "always");
        let handler = RedeliveryErrorHandler::new(target.clone());
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;
        assert_eq!(target.count(), 1);
        assert_eq!(exchange.exception().unwrap().message(), "always");
        assert_eq!(exchange.error_handler_handled(), Some(false));
        assert_eq!(counter_header(&exchange), Some(0));
        assert_eq!(
            exchange.in_message().header(keys::REDELIVERED),
            Some(&Value::Bool(false))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_while_overrides_maximum() {
        let target = FailingProcessor::shared("target", "always");
        let retry_while = predicate(|exchange: &Exchange| {
            exchange
                .in_message()
                .header(keys::REDELIVERY_COUNTER)
                .and_then(Value::as_u64)
                .map(|counter| counter < 5)
                .unwrap_or(true)
        });
        let handler = RedeliveryErrorHandler::new(target.clone())
            .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(1).redelivery_delay(5))
            .retry_while(retry_while);
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;
        assert_eq!(target.count(), 5);
        assert!(exchange.is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_scenario_restores_exception() {
        let log = call_log();
        let step1 = RecordingProcessor::shared("step1", log.clone());
        let step2 = FailingProcessor::shared("step2", "business failure");
        let step3 = RecordingProcessor::shared("step3", log.clone());
        let pipeline: SharedProcessor = Arc::new(Pipeline::new(
            "route",
            vec![step1, step2.clone(), step3],
        ));
        let handler = RedeliveryErrorHandler::new(pipeline)
            .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(2).redelivery_delay(10));
        let mut exchange = Exchange::with_body("in");
        handler.process(&mut exchange).await;

        assert_eq!(entries(&log), vec!["step1", "step1", "step1"]);
        assert_eq!(step2.count(), 3);
        assert_eq!(exchange.exception().unwrap().message(), "business failure");
        assert_eq!(exchange.error_handler_handled(), Some(false));
        assert_eq!(counter_header(&exchange), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_redelivery_keeps_headers() {
        let target = FailingProcessor::failing_times("target", "flaky", 1);
        let handler = RedeliveryErrorHandler::new(target.clone())
            .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(3).redelivery_delay(100));
        let mut exchange = Exchange::default();
        let completion = handler.process(&mut exchange).await;
        assert_eq!(target.count(), 2);
        assert!(!exchange.is_failed());
        assert_eq!(completion, Completion::Async);
        assert_eq!(counter_header(&exchange), Some(1));
        assert_eq!(
            exchange.in_message().header(keys::REDELIVERY_MAX_COUNTER),
            Some(&Value::from(3))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_restores_original_in_message() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let target = process_fn("mutating", move |exchange| {
            let attempt = seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(exchange.in_message().body().as_text().as_deref(), Some("original"));
            exchange.in_mut().set_body("mutated");
            if attempt == 0 {
                return Err(Exception::illegal_state("first attempt"));
            }
            Ok(())
        });
        let handler = RedeliveryErrorHandler::new(target)
            .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(1).redelivery_delay(1));
        let mut exchange = Exchange::with_body("original");
        handler.process(&mut exchange).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!exchange.is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handled_policy_routes_to_its_processor() {
        let target = FailingProcessor::shared("target", "bad state");
        let on_exception = CountingProcessor::shared("on-exception");
        let mut policies = ExceptionPolicyTable::new();
        policies.add(
            ExceptionPolicy::on(&classes::ILLEGAL_STATE)
                .maximum_redeliveries(1)
                .redelivery_delay(5)
                .handled(true)
                .to(on_exception.clone()),
        );
        let handler = RedeliveryErrorHandler::new(target.clone())
            .route_id("orders")
            .exception_policies(policies);
        let mut exchange = Exchange::builder().property(keys::TO_ENDPOINT, "mock:out").build();
        handler.process(&mut exchange).await;

        assert_eq!(target.count(), 2);
        assert_eq!(on_exception.count(), 1);
        assert!(!exchange.is_failed());
        assert!(exchange.is_error_handler_handled());
        assert_eq!(exchange.property_str(keys::FAILURE_ROUTE_ID).as_deref(), Some("orders"));
        assert_eq!(exchange.property_str(keys::FAILURE_ENDPOINT).as_deref(), Some("mock:out"));
        assert!(!continue_processing(&exchange, "next"));
    }

    #[tokio::test]
    async fn test_continued_policy_keeps_routing() {
        let target = FailingProcessor::shared("target", "ignorable");
        let mut policies = ExceptionPolicyTable::new();
        policies.add(ExceptionPolicy::on(&classes::RUNTIME).continued(true));
        let handler = RedeliveryErrorHandler::new(target).exception_policies(policies);
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;

        assert!(!exchange.is_failed());
        assert_eq!(exchange.error_handler_handled(), None);
        assert_eq!(exchange.caught_exception().unwrap().message(), "ignorable");
        assert!(!exchange.is_failure_handled());
        assert!(continue_processing(&exchange, "next"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_redelivery_runs_before_each_retry() {
        let target = FailingProcessor::shared("target", "always");
        let on_redelivery = CountingProcessor::shared("on-redelivery");
        let handler = RedeliveryErrorHandler::new(target.clone())
            .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(2).redelivery_delay(1))
            .on_redelivery(on_redelivery.clone());
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;
        assert_eq!(target.count(), 3);
        assert_eq!(on_redelivery.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_on_redelivery_spends_the_attempt() {
        let target = FailingProcessor::shared("target", "always");
        let on_redelivery = FailingProcessor::shared("on-redelivery", "cannot prepare");
        let handler = RedeliveryErrorHandler::new(target.clone())
            .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(3).redelivery_delay(1))
            .on_redelivery(on_redelivery.clone());
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;

        assert_eq!(target.count(), 1);
        assert_eq!(on_redelivery.count(), 3);
        assert_eq!(exchange.exception().unwrap().message(), "cannot prepare");
        assert_eq!(counter_header(&exchange), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_survives_steps_that_replace_the_in_message() {
        let log = call_log();
        let writes_out = RecordingProcessor::shared("writes-out", log.clone());
        let failing = FailingProcessor::shared("failing", "downstream");
        let pipeline: SharedProcessor =
            Arc::new(Pipeline::new("route", vec![writes_out, failing.clone()]));
        let handler = RedeliveryErrorHandler::new(pipeline)
            .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(3).redelivery_delay(5));
        let mut exchange = Exchange::with_body("in");
        handler.process(&mut exchange).await;

        assert_eq!(failing.count(), 4);
        assert_eq!(entries(&log).len(), 4);
        assert!(exchange.is_failed());
        assert_eq!(counter_header(&exchange), Some(3));
        assert_eq!(
            exchange.in_message().header(keys::REDELIVERED),
            Some(&Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_on_exception_occurred_failure_is_ignored() {
        let target = FailingProcessor::shared("target", "original");
        let handler = RedeliveryErrorHandler::new(target)
            .on_exception_occurred(process_fn("broken", |_| Err(Exception::illegal_argument("noise"))));
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;
        assert_eq!(exchange.exception().unwrap().message(), "original");
    }

    #[tokio::test]
    async fn test_dead_letter_receives_original_message() {
        let received = Arc::new(std::sync::Mutex::new(None));
        let sink = received.clone();
        let dead_letter = process_fn("dlq", move |exchange| {
            let body = exchange.in_message().body().as_text().map(|b| b.to_string());
            *sink.lock().unwrap() = body;
            Ok(())
        });
        let target = process_fn("transform-then-fail", |exchange| {
            exchange.in_mut().set_body("transformed");
            Err(Exception::illegal_state("downstream"))
        });
        let handler = DeadLetterChannel::new(
            RedeliveryErrorHandler::new(target).use_original_message(true),
            dead_letter,
        );
        let mut exchange = Exchange::with_body("pristine");
        let uow = Arc::new(UnitOfWork::new(&exchange));
        exchange.set_unit_of_work(Some(uow));
        handler.process(&mut exchange).await;

        assert_eq!(received.lock().unwrap().as_deref(), Some("pristine"));
        assert!(!exchange.is_failed());
    }

    #[tokio::test]
    async fn test_dead_letter_handles_its_own_failure_by_default() {
        let target = FailingProcessor::shared("target", "original");
        let dead_letter = process_fn("dlq", |_| Err(Exception::illegal_state("dlq down")));
        let handler = DeadLetterChannel::new(RedeliveryErrorHandler::new(target), dead_letter);
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;

        assert!(!exchange.is_failed());
        assert!(exchange.is_error_handler_handled());
        let caught = exchange.caught_exception().unwrap();
        assert_eq!(caught.message(), "dlq down");
        assert_eq!(caught.suppressed()[0].message(), "original");
    }

    #[tokio::test]
    async fn test_dead_letter_can_propagate_its_own_failure() {
        let target = FailingProcessor::shared("target", "original");
        let dead_letter = process_fn("dlq", |_| Err(Exception::illegal_state("dlq down")));
        let handler = DeadLetterChannel::new(RedeliveryErrorHandler::new(target), dead_letter)
            .dead_letter_handle_new_exception(false);
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;
        assert_eq!(exchange.exception().unwrap().message(), "dlq down");
        assert_eq!(exchange.error_handler_handled(), Some(false));
    }

    #[tokio::test]
    async fn test_rollback_only_is_never_redelivered() {
        let target = process_fn("rollback", |exchange| {
            exchange.set_rollback_only(true);
            Err(Exception::illegal_state("rollback"))
        });
        let counter = CountingProcessor::shared("count");
        let pipeline: SharedProcessor =
            Arc::new(Pipeline::new("p", vec![counter.clone(), target]));
        let handler = RedeliveryErrorHandler::new(pipeline)
            .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(5));
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;
        assert_eq!(counter.count(), 1);
        assert!(exchange.is_failed());
    }

    #[tokio::test]
    async fn test_forced_shutdown_rejects_before_processing() {
        let shutdown = Arc::new(DefaultShutdownStrategy::new());
        shutdown.force_shutdown();
        let target = CountingProcessor::shared("target");
        let handler = RedeliveryErrorHandler::new(target.clone()).shutdown_strategy(shutdown);
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;
        assert_eq!(target.count(), 0);
        assert!(exchange.exception().unwrap().is_instance_of(&classes::REJECTED_EXECUTION));
    }

    #[tokio::test]
    async fn test_no_redelivery_while_stopping_when_disallowed() {
        let shutdown = Arc::new(DefaultShutdownStrategy::new());
        shutdown.begin_shutdown();
        let target = FailingProcessor::shared("target", "always");
        let handler = RedeliveryErrorHandler::new(target.clone())
            .redelivery_policy(
                RedeliveryPolicy::new()
                    .maximum_redeliveries(5)
                    .redelivery_delay(10)
                    .allow_redelivery_while_stopping(false),
            )
            .shutdown_strategy(shutdown);
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;
        assert_eq!(target.count(), 1);
        assert_eq!(exchange.exception().unwrap().message(), "always");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_sleep_sends_to_dead_letter() {
        let shutdown = Arc::new(DefaultShutdownStrategy::new());
        let target = FailingProcessor::shared("target", "always");
        let dead_letter = CountingProcessor::shared("dlq");
        let handler = DeadLetterChannel::new(
            RedeliveryErrorHandler::new(target.clone())
                .redelivery_policy(
                    RedeliveryPolicy::new()
                        .maximum_redeliveries(3)
                        .redelivery_delay(5_000)
                        .allow_redelivery_while_stopping(false),
                )
                .shutdown_strategy(shutdown.clone()),
            dead_letter.clone(),
        );
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            stopper.begin_shutdown();
        });
        let mut exchange = Exchange::default();
        handler.process(&mut exchange).await;

        assert_eq!(target.count(), 1);
        assert_eq!(dead_letter.count(), 1);
        assert!(
            exchange
                .caught_exception()
                .unwrap()
                .is_instance_of(&classes::REJECTED_EXECUTION)
        );
    }

    #[tokio::test]
    async fn test_builder_creates_handlers() {
        let context = RoutingContext::builder().build();
        let dead_letter = CountingProcessor::shared("dlq");
        let target = FailingProcessor::shared("target", "x");

        let none = ErrorHandlerBuilder::no_error_handler()
            .create_error_handler(&context, Some("r"), target.clone())
            .unwrap();
        let mut exchange = Exchange::default();
        none.process(&mut exchange).await;
        assert!(exchange.is_failed());
        assert_eq!(exchange.error_handler_handled(), None);

        let dlc = ErrorHandlerBuilder::dead_letter_processor(dead_letter.clone())
            .create_error_handler(&context, Some("r"), target.clone())
            .unwrap();
        let mut exchange = Exchange::default();
        dlc.process(&mut exchange).await;
        assert!(!exchange.is_failed());
        assert_eq!(dead_letter.count(), 1);

        let missing = ErrorHandlerBuilder::dead_letter_channel("direct:missing")
            .create_error_handler(&context, Some("r"), target);
        assert!(matches!(missing, Err(EndpointError::NoSuchEndpoint { .. })));
    }

    #[test]
    fn test_config_requires_dead_letter_uri() {
        let config: ErrorHandlerConfig =
            serde_json::from_str(r#"{"type": "dead_letter_channel"}"#).unwrap();
        assert!(ErrorHandlerBuilder::from_config(&config).is_err());

        let config: ErrorHandlerConfig = serde_json::from_str(
            r#"{"type": "deadLetterChannel", "deadLetterUri": "direct:dlq", "redeliveryPolicy": {"maximumRedeliveries": 2}}"#,
        )
        .unwrap();
        let builder = ErrorHandlerBuilder::from_config(&config).unwrap();
        assert!(builder.is_dead_letter_channel());
    }
}
