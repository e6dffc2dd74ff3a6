use crate::advice::{
    DelayAdvice, InflightAdvice, InternalProcessor, RoutePolicy, RoutePolicyAdvice,
    StreamCachingAdvice, UnitOfWorkAdvice,
};
use crate::channel::Channel;
use crate::context::RoutingContext;
use crate::endpoint::EndpointError;
use crate::errorhandler::{ErrorHandlerBuilder, ErrorHandlerFactory};
use crate::exchange::{Exception, Exchange};
use crate::processor::pipeline::Pipeline;
use crate::processor::send::SendProcessor;
use crate::processor::{Processor, SharedProcessor};
use crate::status::Completion;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Where the error handler of a route is woven in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlerScope {
    /// One error handler around the whole pipeline. A redelivery replays the route from its
    /// first step.
    #[default]
    Route,
    /// One error handler per step. A redelivery replays only the failing step.
    Step,
}

enum Step {
    Process(SharedProcessor),
    To(String),
}

/// Builds a [`Route`] from its steps.
///
/// Steps run as a pipeline in the order they were added. A route without steps cannot be
/// built. When no error handler is set, the context's error handler is used.
///
/// # Example
///
/// ```rust
/// use idemio_route::context::RoutingContext;
/// use idemio_route::processor::process_fn;
/// use idemio_route::route::RouteBuilder;
///
/// let context = RoutingContext::builder().build();
/// let route = RouteBuilder::new("greetings")
///     .from("direct:greet")
///     .process(process_fn("greet", |exchange| {
///         exchange.out_mut().set_body("hello");
///         Ok(())
///     }))
///     .build(&context)
///     .unwrap();
/// assert_eq!(route.id(), "greetings");
/// ```
pub struct RouteBuilder {
    id: String,
    from_uri: Option<String>,
    steps: Vec<Step>,
    error_handler: Option<ErrorHandlerBuilder>,
    error_handler_scope: ErrorHandlerScope,
    policies: Vec<Arc<dyn RoutePolicy>>,
    delay: Option<Duration>,
    force_synchronous: bool,
}

impl RouteBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from_uri: None,
            steps: Vec::new(),
            error_handler: None,
            error_handler_scope: ErrorHandlerScope::default(),
            policies: Vec::new(),
            delay: None,
            force_synchronous: false,
        }
    }

    /// The uri under which [`RoutingContext::add_route`] makes this route reachable.
    pub fn from(mut self, uri: impl Into<String>) -> Self {
        self.from_uri = Some(uri.into());
        self
    }

    pub fn process(mut self, processor: SharedProcessor) -> Self {
        self.steps.push(Step::Process(processor));
        self
    }

    /// Sends the exchange to the endpoint registered under `uri`. Resolved when the route is
    /// built.
    pub fn to(mut self, uri: impl Into<String>) -> Self {
        self.steps.push(Step::To(uri.into()));
        self
    }

    pub fn error_handler(mut self, error_handler: ErrorHandlerBuilder) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    pub fn no_error_handler(self) -> Self {
        self.error_handler(ErrorHandlerBuilder::no_error_handler())
    }

    pub fn error_handler_scope(mut self, scope: ErrorHandlerScope) -> Self {
        self.error_handler_scope = scope;
        self
    }

    pub fn route_policy(mut self, policy: Arc<dyn RoutePolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Runs every exchange on the calling task, as transacted exchanges always do.
    pub fn force_synchronous(mut self, synchronous: bool) -> Self {
        self.force_synchronous = synchronous;
        self
    }

    pub fn build(self, context: &RoutingContext) -> Result<Arc<Route>, RouteError> {
        if self.steps.is_empty() {
            return Err(RouteError::empty_route(self.id));
        }
        let route_id = self.id;
        let error_handler = self
            .error_handler
            .unwrap_or_else(|| context.error_handler().clone());
        let step_handler: Option<&dyn ErrorHandlerFactory> = match self.error_handler_scope {
            ErrorHandlerScope::Step => Some(&error_handler),
            ErrorHandlerScope::Route => None,
        };

        let mut channels: Vec<SharedProcessor> = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.into_iter().enumerate() {
            let (node_id, processor) = match step {
                Step::Process(processor) => (format!("process{}", index + 1), processor),
                Step::To(uri) => {
                    let endpoint = context
                        .endpoints()
                        .resolve(&uri)
                        .map_err(|e| RouteError::endpoint_error(route_id.clone(), e))?;
                    let sender: SharedProcessor = Arc::new(SendProcessor::new(
                        endpoint,
                        context.producer_cache().clone(),
                    ));
                    (format!("to{}", index + 1), sender)
                }
            };
            let channel = Channel::new(context, Some(&route_id), node_id, processor, step_handler)
                .map_err(|e| RouteError::endpoint_error(route_id.clone(), e))?;
            channels.push(channel.shared());
        }

        let mut output = Pipeline::of(route_id.clone(), channels);
        if self.error_handler_scope == ErrorHandlerScope::Route {
            output = error_handler
                .create_error_handler(context, Some(&route_id), output)
                .map_err(|e| RouteError::endpoint_error(route_id.clone(), e))?;
        }

        let mut internal = InternalProcessor::new(route_id.clone(), output)
            .with_advice(UnitOfWorkAdvice::new(Some(route_id.clone())))
            .shutdown_strategy(context.shutdown_strategy())
            .force_synchronous(self.force_synchronous);
        if !self.policies.is_empty() {
            internal.add_advice(RoutePolicyAdvice::new(route_id.clone(), self.policies));
        }
        internal.add_advice(InflightAdvice::new(
            Some(route_id.clone()),
            context.inflight_repository(),
        ));
        if context.is_stream_caching() {
            internal.add_advice(StreamCachingAdvice);
        }
        if let Some(delay) = self.delay {
            internal.add_advice(DelayAdvice::new(delay, context.shutdown_strategy()));
        }

        log::debug!(
            "Built route {} with {} advices and error handler scope {:?}",
            route_id,
            internal.advice_count(),
            self.error_handler_scope
        );
        Ok(Arc::new(Route {
            id: route_id,
            from_uri: self.from_uri,
            error_handler_scope: self.error_handler_scope,
            output: internal,
        }))
    }
}

/// A built route: its steps behind the route's advices and error handler.
///
/// A route is itself a [`Processor`], so it can be registered as an endpoint and reached from
/// other routes. [`Route::request`] is the outer boundary for callers outside the engine.
pub struct Route {
    id: String,
    from_uri: Option<String>,
    error_handler_scope: ErrorHandlerScope,
    output: InternalProcessor,
}

impl Route {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn from_uri(&self) -> Option<&str> {
        self.from_uri.as_deref()
    }

    pub fn error_handler_scope(&self) -> ErrorHandlerScope {
        self.error_handler_scope
    }

    /// Routes `exchange` and hands it back, or the exception it ended with.
    ///
    /// # Errors
    ///
    /// * `RouteError::ExchangeFailed` - The exchange still carried an exception once routing
    ///   finished, so no error handler handled or continued the failure.
    pub async fn request(&self, mut exchange: Exchange) -> Result<Exchange, RouteError> {
        self.process(&mut exchange).await;
        match exchange.take_exception() {
            Some(exception) => {
                log::debug!(
                    "Route {} returning failure of exchange {}: {}",
                    self.id,
                    exchange.id(),
                    exception
                );
                Err(RouteError::exchange_failed(
                    exchange.id().to_string(),
                    exception,
                ))
            }
            None => Ok(exchange),
        }
    }
}

#[async_trait]
impl Processor for Route {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        log::trace!("Route {} processing exchange {}", self.id, exchange.id());
        self.output.process(exchange).await
    }

    fn name(&self) -> &str {
        &self.id
    }
}

/// Errors raised while building or calling a route.
#[derive(Error, Debug)]
pub enum RouteError {
    /// A route must have at least one step.
    #[error("Route '{route_id}' has no steps.")]
    EmptyRoute { route_id: String },
    /// A `to` step or the dead letter uri could not be resolved.
    #[error("Route '{route_id}' could not be built. {source}")]
    Endpoint {
        route_id: String,
        #[source]
        source: EndpointError,
    },
    /// The exchange ended with an unhandled exception.
    #[error("Exchange '{exchange_id}' failed. {exception}")]
    ExchangeFailed {
        exchange_id: String,
        exception: Exception,
    },
}

impl RouteError {
    #[inline]
    pub(crate) const fn empty_route(route_id: String) -> Self {
        Self::EmptyRoute { route_id }
    }

    #[inline]
    pub(crate) const fn endpoint_error(route_id: String, source: EndpointError) -> Self {
        Self::Endpoint { route_id, source }
    }

    #[inline]
    pub(crate) const fn exchange_failed(exchange_id: String, exception: Exception) -> Self {
        Self::ExchangeFailed {
            exchange_id,
            exception,
        }
    }

    /// The exception an exchange failed with, if this error came from routing.
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            Self::ExchangeFailed { exception, .. } => Some(exception),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errorhandler::{ExceptionPolicy, RedeliveryPolicy};
    use crate::exchange::exception::classes;
    use crate::exchange::keys;
    use crate::processor::process_fn;
    use crate::test_support::{
        CountingProcessor, FailingProcessor, RecordingProcessor, call_log, entries,
    };
    use std::sync::Mutex;

    fn retrying(maximum: i32) -> ErrorHandlerBuilder {
        ErrorHandlerBuilder::default_error_handler()
            .redelivery_policy(RedeliveryPolicy::new().maximum_redeliveries(maximum).redelivery_delay(10))
    }

    #[test]
    fn test_empty_route_is_rejected() {
        let context = RoutingContext::builder().build();
        let result = RouteBuilder::new("empty").build(&context);
        assert!(matches!(result, Err(RouteError::EmptyRoute { .. })));
    }

    #[test]
    fn test_unknown_endpoint_is_rejected() {
        let context = RoutingContext::builder().build();
        let result = RouteBuilder::new("r").to("direct:nowhere").build(&context);
        assert!(matches!(result, Err(RouteError::Endpoint { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_middle_step_is_replayed_then_propagated() {
        let context = RoutingContext::builder().build();
        let log = call_log();
        let step1 = RecordingProcessor::shared("step1", log.clone());
        let step2 = FailingProcessor::shared("step2", "business failure");
        let step3 = RecordingProcessor::shared("step3", log.clone());
        let route = RouteBuilder::new("orders")
            .process(step1)
            .process(step2.clone())
            .process(step3)
            .error_handler(retrying(2))
            .build(&context)
            .unwrap();

        let mut exchange = Exchange::with_body("order");
        route.process(&mut exchange).await;

        assert_eq!(entries(&log), vec!["step1", "step1", "step1"]);
        assert_eq!(step2.count(), 3);
        assert_eq!(exchange.exception().unwrap().message(), "business failure");
        assert_eq!(exchange.error_handler_handled(), Some(false));
        assert!(exchange.unit_of_work().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_scope_replays_only_the_failing_step() {
        let context = RoutingContext::builder().build();
        let first = CountingProcessor::shared("first");
        let flaky = FailingProcessor::failing_times("flaky", "transient", 2);
        let route = RouteBuilder::new("r")
            .process(first.clone())
            .process(flaky.clone())
            .error_handler(retrying(3))
            .error_handler_scope(ErrorHandlerScope::Step)
            .build(&context)
            .unwrap();

        let exchange = route.request(Exchange::default()).await.unwrap();
        assert_eq!(first.count(), 1);
        assert_eq!(flaky.count(), 3);
        assert_eq!(
            exchange.in_message().header(keys::REDELIVERY_COUNTER),
            Some(&serde_json::Value::from(2))
        );
    }

    #[tokio::test]
    async fn test_request_returns_unhandled_failure() {
        let context = RoutingContext::builder().build();
        let route = RouteBuilder::new("r")
            .process(FailingProcessor::shared("fails", "nope"))
            .build(&context)
            .unwrap();
        let error = route.request(Exchange::default()).await.unwrap_err();
        assert_eq!(error.exception().unwrap().message(), "nope");
        assert!(error.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_dead_letter_uri_handles_failure() {
        let context = RoutingContext::builder().build();
        let dead_letter = CountingProcessor::shared("dlq");
        context
            .register_processor("direct:dlq", dead_letter.clone())
            .unwrap();
        let route = RouteBuilder::new("r")
            .process(FailingProcessor::shared("fails", "nope"))
            .error_handler(ErrorHandlerBuilder::dead_letter_channel("direct:dlq"))
            .build(&context)
            .unwrap();

        let exchange = route.request(Exchange::default()).await.unwrap();
        assert_eq!(dead_letter.count(), 1);
        assert_eq!(exchange.caught_exception().unwrap().message(), "nope");
        assert_eq!(exchange.property_str(keys::FAILURE_ROUTE_ID).as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn test_route_reaches_other_route_by_uri() {
        let context = RoutingContext::builder().build();
        let billing = RouteBuilder::new("billing")
            .from("direct:billing")
            .process(process_fn("bill", |exchange| {
                let order = exchange.in_message().body().as_text().unwrap_or_default().to_string();
                exchange.out_mut().set_body(format!("billed {}", order));
                Ok(())
            }))
            .build(&context)
            .unwrap();
        context.add_route(billing).unwrap();

        let orders = RouteBuilder::new("orders")
            .process(process_fn("accept", |exchange| {
                exchange.in_mut().set_body("order-7");
                Ok(())
            }))
            .to("direct:billing")
            .build(&context)
            .unwrap();

        let exchange = orders.request(Exchange::default()).await.unwrap();
        assert_eq!(
            exchange.message().body().as_text().as_deref(),
            Some("billed order-7")
        );
        assert_eq!(context.inflight_repository().size(), 0);
    }

    #[tokio::test]
    async fn test_exception_policy_handles_in_route() {
        let context = RoutingContext::builder().build();
        let on_state = CountingProcessor::shared("on-state");
        let route = RouteBuilder::new("r")
            .process(FailingProcessor::shared("fails", "bad state"))
            .error_handler(
                ErrorHandlerBuilder::default_error_handler().exception_policy(
                    ExceptionPolicy::on(&classes::ILLEGAL_STATE)
                        .route_scoped("r")
                        .handled(true)
                        .to(on_state.clone()),
                ),
            )
            .build(&context)
            .unwrap();
        let exchange = route.request(Exchange::default()).await.unwrap();
        assert_eq!(on_state.count(), 1);
        assert!(exchange.is_error_handler_handled());
    }

    struct RecordingPolicy {
        events: Mutex<Vec<String>>,
    }

    impl RoutePolicy for RecordingPolicy {
        fn on_exchange_begin(&self, route_id: &str, _exchange: &Exchange) -> Result<(), Exception> {
            self.events.lock().unwrap().push(format!("begin {}", route_id));
            Ok(())
        }

        fn on_exchange_done(&self, route_id: &str, _exchange: &Exchange) -> Result<(), Exception> {
            self.events.lock().unwrap().push(format!("done {}", route_id));
            Err(Exception::illegal_state("policy broke"))
        }
    }

    #[tokio::test]
    async fn test_route_policy_notified_and_errors_ignored() {
        let context = RoutingContext::builder().build();
        let policy = Arc::new(RecordingPolicy {
            events: Mutex::new(Vec::new()),
        });
        let route = RouteBuilder::new("watched")
            .process(CountingProcessor::shared("noop"))
            .route_policy(policy.clone())
            .build(&context)
            .unwrap();
        assert!(route.request(Exchange::default()).await.is_ok());
        assert_eq!(
            *policy.events.lock().unwrap(),
            vec!["begin watched".to_string(), "done watched".to_string()]
        );
    }

    #[tokio::test]
    async fn test_forced_shutdown_rejects_new_exchanges() {
        let context = RoutingContext::builder().build();
        let target = CountingProcessor::shared("target");
        let route = RouteBuilder::new("r")
            .process(target.clone())
            .no_error_handler()
            .build(&context)
            .unwrap();
        context.force_stop();
        let error = route.request(Exchange::default()).await.unwrap_err();
        assert!(
            error
                .exception()
                .unwrap()
                .is_instance_of(&classes::REJECTED_EXECUTION)
        );
        assert_eq!(target.count(), 0);
    }
}
