//! Collaborator interfaces the routing engine consumes, with default implementations.

use crate::exchange::{Body, Exception, Exchange};
use crate::logger::{Component, LoggingLevel, RouteLogger};
use crate::processor::SharedProcessor;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, Entry};
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Receives failures from paths that have no caller to report to, such as wire taps and
/// background senders.
pub trait ExceptionHandler: Send + Sync {
    fn handle_exception(&self, message: &str, exchange: Option<&Exchange>, exception: &Exception);
}

/// Logs the failure and swallows it.
pub struct LoggingExceptionHandler {
    logger: RouteLogger,
    level: LoggingLevel,
}

impl LoggingExceptionHandler {
    pub fn new(level: LoggingLevel) -> Self {
        Self {
            logger: RouteLogger::new(Component::Processor),
            level,
        }
    }
}

impl Default for LoggingExceptionHandler {
    fn default() -> Self {
        Self::new(LoggingLevel::WARN)
    }
}

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle_exception(&self, message: &str, exchange: Option<&Exchange>, exception: &Exception) {
        self.logger.log(
            self.level,
            exchange.map(Exchange::id),
            format!("{}. Caused by: {}", message, exception.describe(true)),
        );
    }
}

/// Tells processors whether the context is shutting down.
pub trait ShutdownStrategy: Send + Sync {
    /// New work must be rejected.
    fn is_forced_shutdown(&self) -> bool;

    /// Shutdown has started; in-flight work may still finish.
    fn is_stopping(&self) -> bool;

    /// Cancelled when shutdown starts, waking any interruptible sleep.
    fn shutdown_token(&self) -> CancellationToken;
}

#[derive(Default)]
pub struct DefaultShutdownStrategy {
    stopping: AtomicBool,
    forced: AtomicBool,
    token: CancellationToken,
}

impl DefaultShutdownStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.token.cancel();
    }

    pub fn force_shutdown(&self) {
        self.forced.store(true, Ordering::Release);
        self.begin_shutdown();
    }
}

impl ShutdownStrategy for DefaultShutdownStrategy {
    fn is_forced_shutdown(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Sleeps for `duration` unless shutdown starts first.
///
/// Returns `true` when the full duration elapsed and `false` when the sleep was interrupted.
pub async fn sleep_interruptibly(strategy: &dyn ShutdownStrategy, duration: Duration) -> bool {
    if duration.is_zero() {
        return true;
    }
    let token = strategy.shutdown_token();
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = token.cancelled() => false,
    }
}

/// Tracks the exchanges currently being processed, in total and per route.
pub trait InflightRepository: Send + Sync {
    fn add(&self, exchange: &Exchange, route_id: Option<&str>);

    fn remove(&self, exchange: &Exchange, route_id: Option<&str>);

    fn size(&self) -> usize;

    fn route_size(&self, route_id: &str) -> usize;
}

/// Reference-counted in-flight bookkeeping. The same exchange may be in flight in several
/// nested routes at once.
pub struct DefaultInflightRepository {
    exchanges: DashMap<String, usize, fnv::FnvBuildHasher>,
    routes: DashMap<String, usize, fnv::FnvBuildHasher>,
}

impl DefaultInflightRepository {
    pub fn new() -> Self {
        Self {
            exchanges: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
            routes: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
        }
    }

    fn increment(map: &DashMap<String, usize, fnv::FnvBuildHasher>, key: &str) {
        *map.entry(key.to_string()).or_insert(0) += 1;
    }

    fn decrement(map: &DashMap<String, usize, fnv::FnvBuildHasher>, key: &str) {
        if let Entry::Occupied(mut entry) = map.entry(key.to_string()) {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }
}

impl Default for DefaultInflightRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InflightRepository for DefaultInflightRepository {
    fn add(&self, exchange: &Exchange, route_id: Option<&str>) {
        Self::increment(&self.exchanges, exchange.id());
        if let Some(route_id) = route_id {
            Self::increment(&self.routes, route_id);
        }
    }

    fn remove(&self, exchange: &Exchange, route_id: Option<&str>) {
        Self::decrement(&self.exchanges, exchange.id());
        if let Some(route_id) = route_id {
            Self::decrement(&self.routes, route_id);
        }
    }

    fn size(&self) -> usize {
        self.exchanges.len()
    }

    fn route_size(&self, route_id: &str) -> usize {
        self.routes.get(route_id).map(|count| *count).unwrap_or(0)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn elapsed_since(&self, earlier: DateTime<Utc>) -> Duration {
        (self.now() - earlier).to_std().unwrap_or_default()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub static SYSTEM_CLOCK: Lazy<Arc<dyn Clock>> = Lazy::new(|| Arc::new(SystemClock));

/// Converts bodies to and from a wire representation.
pub trait DataFormat: Send + Sync {
    fn marshal(&self, exchange: &Exchange, body: Body) -> Result<Body, Exception>;

    fn unmarshal(&self, exchange: &Exchange, body: Body) -> Result<Body, Exception>;
}

/// Wraps the processor of every route node, for instance to trace or count invocations.
pub trait InterceptStrategy: Send + Sync {
    fn wrap(&self, node_id: &str, target: SharedProcessor) -> SharedProcessor;
}
