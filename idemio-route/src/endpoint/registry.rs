use crate::endpoint::{Component, Endpoint, EndpointError, split_scheme};
use dashmap::{DashMap, Entry};
use std::sync::Arc;

/// A thread-safe registry of endpoints by uri and components by scheme.
///
/// Resolution tries the exact uri first and then asks the component registered for the uri's
/// scheme, caching the endpoint it creates.
pub struct EndpointRegistry {
    endpoints: DashMap<String, Arc<dyn Endpoint>, fnv::FnvBuildHasher>,
    components: DashMap<String, Arc<dyn Component>, fnv::FnvBuildHasher>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
            components: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
        }
    }

    /// Registers an endpoint under its own uri.
    pub fn register_endpoint(&self, endpoint: Arc<dyn Endpoint>) -> Result<(), EndpointError> {
        let uri = endpoint.uri().to_string();
        match self.endpoints.entry(uri.clone()) {
            Entry::Occupied(_) => Err(EndpointError::conflicting_uri(uri)),
            Entry::Vacant(entry) => {
                entry.insert(endpoint);
                Ok(())
            }
        }
    }

    pub fn register_component(
        &self,
        scheme: impl Into<String>,
        component: Arc<dyn Component>,
    ) -> Result<(), EndpointError> {
        let scheme = scheme.into();
        match self.components.entry(scheme.clone()) {
            Entry::Occupied(_) => Err(EndpointError::conflicting_scheme(scheme)),
            Entry::Vacant(entry) => {
                entry.insert(component);
                Ok(())
            }
        }
    }

    pub fn resolve(&self, uri: &str) -> Result<Arc<dyn Endpoint>, EndpointError> {
        let uri = uri.trim();
        if let Some(endpoint) = self.endpoints.get(uri) {
            return Ok(endpoint.value().clone());
        }
        let (scheme, remaining) =
            split_scheme(uri).ok_or_else(|| EndpointError::no_such_endpoint(uri.to_string()))?;
        let component = match self.components.get(scheme) {
            None => return Err(EndpointError::no_such_endpoint(uri.to_string())),
            Some(component) => component.value().clone(),
        };
        let created = component.create_endpoint(uri, remaining)?;
        log::debug!("Created endpoint {} using component {}", uri, scheme);
        let endpoint = self
            .endpoints
            .entry(uri.to_string())
            .or_insert(created)
            .value()
            .clone();
        Ok(endpoint)
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.endpoints.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ProcessorEndpoint;
    use crate::test_support::CountingProcessor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingComponent {
        created: AtomicUsize,
    }

    impl Component for CountingComponent {
        fn create_endpoint(
            &self,
            uri: &str,
            _remaining: &str,
        ) -> Result<Arc<dyn Endpoint>, EndpointError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessorEndpoint::shared(uri, CountingProcessor::shared(uri)))
        }
    }

    #[test]
    fn test_register_endpoint_with_conflicting_uri() {
        let registry = EndpointRegistry::new();
        let first = ProcessorEndpoint::shared("direct:a", CountingProcessor::shared("first"));
        let second = ProcessorEndpoint::shared("direct:a", CountingProcessor::shared("second"));
        assert!(registry.register_endpoint(first).is_ok());
        assert_eq!(
            registry.register_endpoint(second).err(),
            Some(EndpointError::ConflictingUri {
                uri: "direct:a".to_string()
            })
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_exact_uri() {
        let registry = EndpointRegistry::new();
        registry
            .register_endpoint(ProcessorEndpoint::shared(
                "direct:a",
                CountingProcessor::shared("a"),
            ))
            .unwrap();
        assert_eq!(registry.resolve(" direct:a ").unwrap().uri(), "direct:a");
        assert!(registry.resolve("direct:b").is_err());
        assert!(registry.resolve("no-scheme").is_err());
    }

    #[test]
    fn test_component_endpoints_are_cached() {
        let registry = EndpointRegistry::new();
        let component = Arc::new(CountingComponent {
            created: AtomicUsize::new(0),
        });
        registry.register_component("mock", component.clone()).unwrap();
        assert!(registry.register_component("mock", component.clone()).is_err());

        let first = registry.resolve("mock:result").unwrap();
        let second = registry.resolve("mock:result").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(component.created.load(Ordering::SeqCst), 1);
        assert!(registry.contains("mock:result"));
    }

    #[test]
    fn test_registry_thread_safety() {
        use std::thread;

        let registry = Arc::new(EndpointRegistry::new());
        for i in 0..5 {
            let uri = format!("direct:{}", i);
            registry
                .register_endpoint(ProcessorEndpoint::shared(
                    uri.clone(),
                    CountingProcessor::shared(&uri),
                ))
                .unwrap();
        }
        let mut handles = vec![];
        for i in 0..5 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                registry
                    .resolve(&format!("direct:{}", i))
                    .map(|endpoint| endpoint.uri().to_string())
            }));
        }
        let mut results = vec![];
        for handle in handles {
            results.push(handle.join().unwrap().unwrap());
        }
        for i in 0..5 {
            assert!(results.contains(&format!("direct:{}", i)));
        }
    }
}
