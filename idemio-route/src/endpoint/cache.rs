use crate::endpoint::{Endpoint, EndpointError, Producer};
use dashmap::DashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const DEFAULT_MAX_IDLE: usize = 100;

struct CacheInner {
    idle: DashMap<String, Vec<Arc<dyn Producer>>, fnv::FnvBuildHasher>,
    max_idle_per_endpoint: usize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    created: AtomicUsize,
}

impl CacheInner {
    fn release(&self, uri: &str, producer: Arc<dyn Producer>) {
        self.released.fetch_add(1, Ordering::AcqRel);
        let mut idle = self.idle.entry(uri.to_string()).or_insert_with(Vec::new);
        if idle.len() < self.max_idle_per_endpoint {
            idle.push(producer);
        }
    }
}

/// Pools producers per endpoint uri.
///
/// [`ProducerCache::acquire`] hands out a [`PooledProducer`] guard which returns the producer
/// to the pool when dropped, so a producer is released on every path, including failures and
/// panics inside the destination.
#[derive(Clone)]
pub struct ProducerCache {
    inner: Arc<CacheInner>,
}

impl ProducerCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_IDLE)
    }

    pub fn with_capacity(max_idle_per_endpoint: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                idle: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
                max_idle_per_endpoint,
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
            }),
        }
    }

    pub fn acquire(&self, endpoint: &Arc<dyn Endpoint>) -> Result<PooledProducer, EndpointError> {
        let uri = endpoint.uri();
        let pooled = self
            .inner
            .idle
            .get_mut(uri)
            .and_then(|mut idle| idle.pop());
        let producer = match pooled {
            Some(producer) => producer,
            None => {
                let producer = endpoint.create_producer()?;
                self.inner.created.fetch_add(1, Ordering::AcqRel);
                producer
            }
        };
        self.inner.acquired.fetch_add(1, Ordering::AcqRel);
        log::trace!("Acquired producer for {}", uri);
        Ok(PooledProducer {
            uri: uri.to_string(),
            producer: Some(producer),
            cache: self.inner.clone(),
        })
    }

    pub fn acquired_count(&self) -> usize {
        self.inner.acquired.load(Ordering::Acquire)
    }

    pub fn released_count(&self) -> usize {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn created_count(&self) -> usize {
        self.inner.created.load(Ordering::Acquire)
    }

    /// Producers currently leased out.
    pub fn in_use(&self) -> usize {
        self.acquired_count()
            .saturating_sub(self.released_count())
    }

    pub fn idle_count(&self, uri: &str) -> usize {
        self.inner.idle.get(uri).map(|idle| idle.len()).unwrap_or(0)
    }
}

impl Default for ProducerCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A leased producer, returned to its cache on drop.
pub struct PooledProducer {
    uri: String,
    producer: Option<Arc<dyn Producer>>,
    cache: Arc<CacheInner>,
}

impl PooledProducer {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn producer(&self) -> Arc<dyn Producer> {
        self.deref().clone()
    }
}

impl Deref for PooledProducer {
    type Target = Arc<dyn Producer>;

    fn deref(&self) -> &Self::Target {
        match &self.producer {
            Some(producer) => producer,
            None => unreachable!("producer is only taken on drop"),
        }
    }
}

impl Drop for PooledProducer {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            self.cache.release(&self.uri, producer);
            log::trace!("Released producer for {}", self.uri);
        }
    }
}
