use crate::advice::Advice;
use crate::exchange::{Exception, Exchange};
use crate::logger::{Component, LoggingLevel, RouteLogger};
use crate::spi::{InflightRepository, ShutdownStrategy, sleep_interruptibly};
use crate::unit_of_work::UnitOfWork;
use async_trait::async_trait;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Creates the unit of work when the exchange has none, tracks the current route on its
/// route stack, and fires `done` once the exchange leaves the advice that created it.
pub struct UnitOfWorkAdvice {
    route_id: Option<String>,
}

impl UnitOfWorkAdvice {
    pub fn new(route_id: Option<String>) -> Self {
        Self { route_id }
    }
}

pub struct UnitOfWorkState {
    unit_of_work: Arc<UnitOfWork>,
    created: bool,
}

#[async_trait]
impl Advice for UnitOfWorkAdvice {
    type State = UnitOfWorkState;

    async fn before(&self, exchange: &mut Exchange) -> Result<UnitOfWorkState, Exception> {
        let (unit_of_work, created) = match exchange.unit_of_work() {
            Some(existing) => (existing.clone(), false),
            None => {
                let created = Arc::new(UnitOfWork::new(exchange));
                exchange.set_unit_of_work(Some(created.clone()));
                log::trace!("Created unit of work {} for exchange {}", created.id(), exchange.id());
                (created, true)
            }
        };
        if let Some(route_id) = &self.route_id {
            if exchange.from_route_id().is_none() {
                exchange.set_from_route_id(route_id.clone());
            }
            unit_of_work.push_route(route_id.clone());
        }
        Ok(UnitOfWorkState {
            unit_of_work,
            created,
        })
    }

    async fn after(&self, exchange: &mut Exchange, state: UnitOfWorkState) {
        if self.route_id.is_some() {
            state.unit_of_work.pop_route();
        }
        if state.created {
            state.unit_of_work.done(exchange);
            exchange.set_unit_of_work(None);
        }
    }

    fn name(&self) -> &str {
        "unit-of-work"
    }
}

/// Notified when exchanges begin and finish a route.
///
/// Errors and panics raised by a policy are logged and otherwise ignored.
pub trait RoutePolicy: Send + Sync {
    fn on_exchange_begin(&self, route_id: &str, exchange: &Exchange) -> Result<(), Exception>;

    fn on_exchange_done(&self, route_id: &str, exchange: &Exchange) -> Result<(), Exception>;
}

pub struct RoutePolicyAdvice {
    route_id: String,
    policies: Vec<Arc<dyn RoutePolicy>>,
}

impl RoutePolicyAdvice {
    pub fn new(route_id: impl Into<String>, policies: Vec<Arc<dyn RoutePolicy>>) -> Self {
        Self {
            route_id: route_id.into(),
            policies,
        }
    }

    fn notify<F>(&self, stage: &str, exchange: &Exchange, callback: F)
    where
        F: Fn(&dyn RoutePolicy) -> Result<(), Exception>,
    {
        for policy in &self.policies {
            match catch_unwind(AssertUnwindSafe(|| callback(policy.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(exception)) => log::warn!(
                    "Error on {} of route policy for route {} with exchange {}: {}. This is ignored.",
                    stage,
                    self.route_id,
                    exchange.id(),
                    exception
                ),
                Err(_) => log::warn!(
                    "Route policy panicked on {} for route {} with exchange {}. This is ignored.",
                    stage,
                    self.route_id,
                    exchange.id()
                ),
            }
        }
    }
}

#[async_trait]
impl Advice for RoutePolicyAdvice {
    type State = ();

    async fn before(&self, exchange: &mut Exchange) -> Result<(), Exception> {
        self.notify("begin", exchange, |policy| {
            policy.on_exchange_begin(&self.route_id, exchange)
        });
        Ok(())
    }

    async fn after(&self, exchange: &mut Exchange, _state: ()) {
        self.notify("done", exchange, |policy| {
            policy.on_exchange_done(&self.route_id, exchange)
        });
    }

    fn name(&self) -> &str {
        "route-policy"
    }
}

/// Adds the exchange to the in-flight repository before processing and removes it after,
/// whether or not processing failed.
pub struct InflightAdvice {
    route_id: Option<String>,
    repository: Arc<dyn InflightRepository>,
}

impl InflightAdvice {
    pub fn new(route_id: Option<String>, repository: Arc<dyn InflightRepository>) -> Self {
        Self {
            route_id,
            repository,
        }
    }
}

#[async_trait]
impl Advice for InflightAdvice {
    type State = ();

    async fn before(&self, exchange: &mut Exchange) -> Result<(), Exception> {
        self.repository.add(exchange, self.route_id.as_deref());
        Ok(())
    }

    async fn after(&self, exchange: &mut Exchange, _state: ()) {
        self.repository.remove(exchange, self.route_id.as_deref());
    }

    fn name(&self) -> &str {
        "inflight"
    }
}

/// Turns a read-once stream body into a re-readable cache before processing and rewinds the
/// cache afterwards.
#[derive(Debug, Default)]
pub struct StreamCachingAdvice;

#[async_trait]
impl Advice for StreamCachingAdvice {
    type State = bool;

    async fn before(&self, exchange: &mut Exchange) -> Result<bool, Exception> {
        let cached = exchange.in_mut().cache_stream();
        if cached {
            log::trace!("Cached stream body of exchange {}", exchange.id());
        }
        Ok(cached)
    }

    async fn after(&self, exchange: &mut Exchange, _cached: bool) {
        exchange.message_mut().reset_stream_cache();
    }

    fn name(&self) -> &str {
        "stream-caching"
    }
}

/// Holds every exchange back for a fixed delay before processing.
///
/// The wait ends early on shutdown; processing then continues without the rest of the delay.
pub struct DelayAdvice {
    delay: Duration,
    shutdown: Arc<dyn ShutdownStrategy>,
}

impl DelayAdvice {
    pub fn new(delay: Duration, shutdown: Arc<dyn ShutdownStrategy>) -> Self {
        Self { delay, shutdown }
    }
}

#[async_trait]
impl Advice for DelayAdvice {
    /// Whether the exchange was held back.
    type State = bool;

    async fn before(&self, exchange: &mut Exchange) -> Result<bool, Exception> {
        if self.delay.is_zero() {
            return Ok(false);
        }
        log::trace!("Delaying exchange {} for {:?}", exchange.id(), self.delay);
        if !sleep_interruptibly(self.shutdown.as_ref(), self.delay).await {
            log::debug!("Delay of exchange {} interrupted by shutdown", exchange.id());
        }
        Ok(true)
    }

    async fn after(&self, _exchange: &mut Exchange, _delayed: bool) {}

    fn suspended(&self, delayed: &bool) -> bool {
        *delayed
    }

    fn name(&self) -> &str {
        "delay"
    }
}

/// Logs entry to and exit from a node through the route logger.
pub struct TracingAdvice {
    node_id: String,
    level: LoggingLevel,
    logger: RouteLogger,
}

impl TracingAdvice {
    pub fn new(node_id: impl Into<String>, level: LoggingLevel) -> Self {
        Self {
            node_id: node_id.into(),
            level,
            logger: RouteLogger::new(Component::Advice),
        }
    }

    pub fn structured(mut self) -> Self {
        self.logger = RouteLogger::structured(Component::Advice);
        self
    }
}

#[async_trait]
impl Advice for TracingAdvice {
    type State = Instant;

    async fn before(&self, exchange: &mut Exchange) -> Result<Instant, Exception> {
        if self.logger.is_enabled(self.level) {
            self.logger.log(
                self.level,
                Some(exchange.id()),
                format!(">>> {} in: {:?}", self.node_id, exchange.in_message().body()),
            );
        }
        Ok(Instant::now())
    }

    async fn after(&self, exchange: &mut Exchange, started: Instant) {
        if !self.logger.is_enabled(self.level) {
            return;
        }
        let outcome = match exchange.exception() {
            Some(exception) => format!("failed: {}", exception),
            None => format!("out: {:?}", exchange.message().body()),
        };
        self.logger.log(
            self.level,
            Some(exchange.id()),
            format!("<<< {} {} ({:?})", self.node_id, outcome, started.elapsed()),
        );
    }

    fn name(&self) -> &str {
        "tracing"
    }
}
