use crate::config::{ConfigProviderError, ContextConfig};
use crate::endpoint::cache::ProducerCache;
use crate::endpoint::registry::EndpointRegistry;
use crate::endpoint::{EndpointError, ProcessorEndpoint};
use crate::errorhandler::ErrorHandlerBuilder;
use crate::logger::LoggingLevel;
use crate::processor::SharedProcessor;
use crate::processor::threads::{ThreadPoolConfig, WorkerPool};
use crate::route::Route;
use crate::spi::{
    Clock, DefaultInflightRepository, DefaultShutdownStrategy, ExceptionHandler,
    InflightRepository, InterceptStrategy, LoggingExceptionHandler, SYSTEM_CLOCK,
    ShutdownStrategy,
};
use dashmap::{DashMap, Entry};
use fnv::FnvBuildHasher;
use std::sync::Arc;

/// Shared collaborators and settings of the routes built against one context.
///
/// Holds the endpoint registry, the pooled producers, the shutdown strategy, the in-flight
/// repository, the clock, the intercept strategies, the context-wide error handler and the
/// named worker pools.
pub struct RoutingContext {
    name: String,
    endpoints: EndpointRegistry,
    producer_cache: ProducerCache,
    shutdown: Arc<DefaultShutdownStrategy>,
    exception_handler: Arc<dyn ExceptionHandler>,
    inflight: Arc<dyn InflightRepository>,
    clock: Arc<dyn Clock>,
    intercept_strategies: Vec<Arc<dyn InterceptStrategy>>,
    error_handler: ErrorHandlerBuilder,
    thread_pools: DashMap<String, Arc<WorkerPool>, FnvBuildHasher>,
    message_history: bool,
    stream_caching: bool,
    tracing: Option<LoggingLevel>,
    structured_logging: bool,
}

impl RoutingContext {
    pub fn builder() -> RoutingContextBuilder {
        RoutingContextBuilder::new()
    }

    pub fn from_config(config: &ContextConfig) -> Result<Arc<Self>, ConfigProviderError> {
        let mut builder = Self::builder()
            .name(config.name.clone())
            .message_history(config.message_history)
            .stream_caching(config.stream_caching)
            .structured_logging(config.structured_logging)
            .producer_cache(ProducerCache::with_capacity(config.producer_cache_size))
            .error_handler(ErrorHandlerBuilder::from_config(&config.error_handler)?);
        if config.tracing {
            builder = builder.tracing(config.tracing_level);
        }
        for pool in &config.thread_pools {
            builder = builder.thread_pool(pool.clone());
        }
        Ok(builder.build())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn producer_cache(&self) -> &ProducerCache {
        &self.producer_cache
    }

    pub fn shutdown_strategy(&self) -> Arc<dyn ShutdownStrategy> {
        self.shutdown.clone()
    }

    pub fn exception_handler(&self) -> Arc<dyn ExceptionHandler> {
        self.exception_handler.clone()
    }

    pub fn inflight_repository(&self) -> Arc<dyn InflightRepository> {
        self.inflight.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn intercept_strategies(&self) -> &[Arc<dyn InterceptStrategy>] {
        &self.intercept_strategies
    }

    pub fn error_handler(&self) -> &ErrorHandlerBuilder {
        &self.error_handler
    }

    pub fn is_message_history(&self) -> bool {
        self.message_history
    }

    pub fn is_stream_caching(&self) -> bool {
        self.stream_caching
    }

    /// Level of per-node tracing, `None` when tracing is off.
    pub fn tracing(&self) -> Option<LoggingLevel> {
        self.tracing
    }

    pub fn is_structured_logging(&self) -> bool {
        self.structured_logging
    }

    /// Named worker pool, created with default settings on first use.
    pub fn thread_pool(&self, name: &str) -> Arc<WorkerPool> {
        match self.thread_pools.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                log::debug!("Creating worker pool {} with default settings", name);
                let pool = WorkerPool::new(ThreadPoolConfig {
                    name: name.to_string(),
                    ..Default::default()
                });
                entry.insert(pool.clone());
                pool
            }
        }
    }

    /// Makes a processor reachable as `uri` from `to(uri)` steps and dead letter uris.
    pub fn register_processor(
        &self,
        uri: impl Into<String>,
        processor: SharedProcessor,
    ) -> Result<(), EndpointError> {
        self.endpoints
            .register_endpoint(ProcessorEndpoint::shared(uri, processor))
    }

    /// Registers a route under its `from` uri.
    pub fn add_route(&self, route: Arc<Route>) -> Result<(), EndpointError> {
        let Some(uri) = route.from_uri().map(str::to_string) else {
            log::debug!("Route {} has no from uri, it is not registered", route.id());
            return Ok(());
        };
        log::debug!("Registering route {} as {}", route.id(), uri);
        self.register_processor(uri, route)
    }

    /// Starts a graceful shutdown: in-flight exchanges finish, sleeping waits wake up.
    pub fn stop(&self) {
        log::info!("Routing context {} is stopping", self.name);
        self.shutdown.begin_shutdown();
        self.thread_pools.iter().for_each(|pool| pool.shutdown());
    }

    /// Rejects all new work.
    pub fn force_stop(&self) {
        log::warn!("Routing context {} is forcing shutdown", self.name);
        self.shutdown.force_shutdown();
        self.thread_pools.iter().for_each(|pool| pool.shutdown());
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_stopping()
    }
}

pub struct RoutingContextBuilder {
    name: String,
    endpoints: EndpointRegistry,
    producer_cache: ProducerCache,
    shutdown: Arc<DefaultShutdownStrategy>,
    exception_handler: Arc<dyn ExceptionHandler>,
    inflight: Arc<dyn InflightRepository>,
    clock: Arc<dyn Clock>,
    intercept_strategies: Vec<Arc<dyn InterceptStrategy>>,
    error_handler: ErrorHandlerBuilder,
    thread_pools: Vec<ThreadPoolConfig>,
    message_history: bool,
    stream_caching: bool,
    tracing: Option<LoggingLevel>,
    structured_logging: bool,
}

impl RoutingContextBuilder {
    pub fn new() -> Self {
        Self {
            name: "idemio-route".to_string(),
            endpoints: EndpointRegistry::new(),
            producer_cache: ProducerCache::new(),
            shutdown: Arc::new(DefaultShutdownStrategy::new()),
            exception_handler: Arc::new(LoggingExceptionHandler::default()),
            inflight: Arc::new(DefaultInflightRepository::new()),
            clock: SYSTEM_CLOCK.clone(),
            intercept_strategies: Vec::new(),
            error_handler: ErrorHandlerBuilder::default(),
            thread_pools: Vec::new(),
            message_history: false,
            stream_caching: false,
            tracing: None,
            structured_logging: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn endpoints(mut self, endpoints: EndpointRegistry) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn producer_cache(mut self, cache: ProducerCache) -> Self {
        self.producer_cache = cache;
        self
    }

    pub fn shutdown_strategy(mut self, shutdown: Arc<DefaultShutdownStrategy>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn inflight_repository(mut self, repository: Arc<dyn InflightRepository>) -> Self {
        self.inflight = repository;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn intercept_strategy(mut self, strategy: Arc<dyn InterceptStrategy>) -> Self {
        self.intercept_strategies.push(strategy);
        self
    }

    pub fn error_handler(mut self, error_handler: ErrorHandlerBuilder) -> Self {
        self.error_handler = error_handler;
        self
    }

    pub fn thread_pool(mut self, config: ThreadPoolConfig) -> Self {
        self.thread_pools.push(config);
        self
    }

    pub fn message_history(mut self, enabled: bool) -> Self {
        self.message_history = enabled;
        self
    }

    pub fn stream_caching(mut self, enabled: bool) -> Self {
        self.stream_caching = enabled;
        self
    }

    pub fn tracing(mut self, level: LoggingLevel) -> Self {
        self.tracing = Some(level);
        self
    }

    pub fn structured_logging(mut self, structured: bool) -> Self {
        self.structured_logging = structured;
        self
    }

    pub fn build(self) -> Arc<RoutingContext> {
        let thread_pools = DashMap::with_hasher(FnvBuildHasher::default());
        for config in self.thread_pools {
            thread_pools.insert(config.name.clone(), WorkerPool::new(config));
        }
        Arc::new(RoutingContext {
            name: self.name,
            endpoints: self.endpoints,
            producer_cache: self.producer_cache,
            shutdown: self.shutdown,
            exception_handler: self.exception_handler,
            inflight: self.inflight,
            clock: self.clock,
            intercept_strategies: self.intercept_strategies,
            error_handler: self.error_handler,
            thread_pools,
            message_history: self.message_history,
            stream_caching: self.stream_caching,
            tracing: self.tracing,
            structured_logging: self.structured_logging,
        })
    }
}

impl Default for RoutingContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
