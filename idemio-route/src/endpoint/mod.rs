pub mod cache;
pub mod registry;

pub use cache::{PooledProducer, ProducerCache};
pub use registry::EndpointRegistry;

use crate::exchange::Exchange;
use crate::processor::{SharedProcessor, invoke};
use crate::status::Completion;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while resolving endpoints or creating producers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EndpointError {
    /// No endpoint is registered for the uri and no component handles its scheme.
    #[error("No endpoint could be found for: {uri}")]
    NoSuchEndpoint { uri: String },

    /// Registration failed because the uri is already taken.
    #[error("Endpoint with uri '{uri}' already exists.")]
    ConflictingUri { uri: String },

    /// Registration failed because a component is already bound to the scheme.
    #[error("Component for scheme '{scheme}' already exists.")]
    ConflictingScheme { scheme: String },

    /// The endpoint could not create a producer.
    #[error("Failed to create producer for {uri}. {message}")]
    ProducerCreation { uri: String, message: String },
}

impl EndpointError {
    #[inline]
    pub(crate) const fn no_such_endpoint(uri: String) -> Self {
        Self::NoSuchEndpoint { uri }
    }

    #[inline]
    pub(crate) const fn conflicting_uri(uri: String) -> Self {
        Self::ConflictingUri { uri }
    }

    #[inline]
    pub(crate) const fn conflicting_scheme(scheme: String) -> Self {
        Self::ConflictingScheme { scheme }
    }

    #[inline]
    pub const fn producer_creation(uri: String, message: String) -> Self {
        Self::ProducerCreation { uri, message }
    }
}

/// Sends exchanges to a transport.
#[async_trait]
pub trait Producer: Send + Sync {
    fn endpoint_uri(&self) -> &str;

    async fn process(&self, exchange: &mut Exchange) -> Completion;
}

/// A named destination able to create producers.
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EndpointError>;
}

/// Creates endpoints for every uri of one scheme, such as `log:` or `mock:`.
pub trait Component: Send + Sync {
    fn create_endpoint(&self, uri: &str, remaining: &str)
    -> Result<Arc<dyn Endpoint>, EndpointError>;
}

/// An endpoint whose producers hand the exchange to a processor.
pub struct ProcessorEndpoint {
    uri: String,
    processor: SharedProcessor,
}

impl ProcessorEndpoint {
    pub fn new(uri: impl Into<String>, processor: SharedProcessor) -> Self {
        Self {
            uri: uri.into(),
            processor,
        }
    }

    pub fn shared(uri: impl Into<String>, processor: SharedProcessor) -> Arc<dyn Endpoint> {
        Arc::new(Self::new(uri, processor))
    }
}

impl Endpoint for ProcessorEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EndpointError> {
        Ok(Arc::new(ProcessorProducer {
            uri: self.uri.clone(),
            processor: self.processor.clone(),
        }))
    }
}

struct ProcessorProducer {
    uri: String,
    processor: SharedProcessor,
}

#[async_trait]
impl Producer for ProcessorProducer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn process(&self, exchange: &mut Exchange) -> Completion {
        invoke(self.processor.as_ref(), exchange).await
    }
}

/// Splits `scheme:remaining` uris. A uri without a scheme has none.
pub(crate) fn split_scheme(uri: &str) -> Option<(&str, &str)> {
    uri.split_once(':')
        .filter(|(scheme, _)| !scheme.is_empty())
        .map(|(scheme, remaining)| (scheme, remaining.trim_start_matches("//")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CountingProcessor;

    #[tokio::test]
    async fn test_processor_endpoint_producer_invokes_processor() {
        let counting = CountingProcessor::shared("target");
        let endpoint = ProcessorEndpoint::shared("direct:target", counting.clone());
        let producer = endpoint.create_producer().unwrap();
        assert_eq!(producer.endpoint_uri(), "direct:target");
        producer.process(&mut Exchange::default()).await;
        assert_eq!(counting.count(), 1);
    }

    #[test]
    fn test_split_scheme() {
        assert_eq!(split_scheme("mock:result"), Some(("mock", "result")));
        assert_eq!(split_scheme("http://host"), Some(("http", "host")));
        assert_eq!(split_scheme("plain"), None);
        assert_eq!(split_scheme(":x"), None);
    }
}
