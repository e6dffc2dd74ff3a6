use crate::endpoint::{EndpointRegistry, ProducerCache};
use crate::exchange::exception::classes;
use crate::exchange::{Exception, Exchange, keys};
use crate::expression::{SharedExpression, evaluate_items};
use crate::processor::aggregation::{AggregationOrder, SharedAggregationStrategy};
use crate::processor::multicast::{BranchPair, MULTICAST_KEYS, MulticastSettings};
use crate::processor::send::{ProducerProcessor, send_to};
use crate::processor::{Processor, continue_processing};
use crate::status::Completion;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

fn endpoint_uris(
    expression: &dyn crate::expression::Expression,
    exchange: &Exchange,
    delimiter: &str,
) -> Result<Vec<String>, Exception> {
    let items = evaluate_items(expression, exchange, Some(delimiter))?;
    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(uri) => Some(uri),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .collect())
}

fn no_such_endpoint(error: impl std::fmt::Display) -> Exception {
    Exception::new(&classes::NO_SUCH_ENDPOINT, error.to_string())
}

/// Sends a copy of the exchange to every endpoint named by an expression.
///
/// Producers are leased from the producer cache per branch and returned as soon as that
/// branch finishes, whether it succeeded or failed.
pub struct RecipientList {
    id: String,
    expression: SharedExpression,
    registry: Arc<EndpointRegistry>,
    producers: ProducerCache,
    delimiter: String,
    ignore_invalid_endpoints: bool,
    settings: MulticastSettings,
}

impl RecipientList {
    pub fn new(
        id: impl Into<String>,
        expression: SharedExpression,
        registry: Arc<EndpointRegistry>,
        producers: ProducerCache,
    ) -> Self {
        Self {
            id: id.into(),
            expression,
            registry,
            producers,
            delimiter: ",".to_string(),
            ignore_invalid_endpoints: false,
            settings: MulticastSettings::default(),
        }
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn ignore_invalid_endpoints(mut self, ignore: bool) -> Self {
        self.ignore_invalid_endpoints = ignore;
        self
    }

    pub fn aggregation_strategy(mut self, strategy: SharedAggregationStrategy) -> Self {
        self.settings.strategy = strategy;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.settings.parallel = parallel;
        self
    }

    pub fn aggregation_order(mut self, order: AggregationOrder) -> Self {
        self.settings.order = order;
        self
    }

    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.settings.stop_on_exception = stop;
        self
    }

    pub fn share_unit_of_work(mut self, share: bool) -> Self {
        self.settings.share_unit_of_work = share;
        self
    }
}

#[async_trait]
impl Processor for RecipientList {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let uris = match endpoint_uris(self.expression.as_ref(), exchange, &self.delimiter) {
            Ok(uris) => uris,
            Err(exception) => {
                exchange.set_exception(exception);
                return Completion::Sync;
            }
        };
        let mut pairs = Vec::with_capacity(uris.len());
        for uri in uris {
            let leased = self
                .registry
                .resolve(&uri)
                .and_then(|endpoint| self.producers.acquire(&endpoint));
            let producer = match leased {
                Ok(producer) => producer,
                Err(error) if self.ignore_invalid_endpoints => {
                    log::warn!("{} ignoring invalid endpoint {}: {}", self.id, uri, error);
                    continue;
                }
                Err(error) => {
                    // already leased producers go back to the cache with `pairs`
                    exchange.set_exception(no_such_endpoint(error));
                    return Completion::Sync;
                }
            };
            let mut copy = self.settings.branch_copy(exchange);
            copy.set_property(keys::RECIPIENT_LIST_ENDPOINT, uri.as_str());
            let index = pairs.len();
            let processor = Arc::new(ProducerProcessor::new(producer.producer()));
            pairs.push(BranchPair::new(index, processor, copy).with_lease(producer));
        }
        self.settings
            .execute(&self.id, exchange, pairs, MULTICAST_KEYS)
            .await
    }

    fn name(&self) -> &str {
        &self.id
    }
}

/// Routes the exchange through a list of endpoints computed at runtime, one after the other,
/// each endpoint seeing the previous endpoint's result.
pub struct RoutingSlip {
    id: String,
    expression: SharedExpression,
    registry: Arc<EndpointRegistry>,
    producers: ProducerCache,
    delimiter: String,
    ignore_invalid_endpoints: bool,
}

impl RoutingSlip {
    pub fn new(
        id: impl Into<String>,
        expression: SharedExpression,
        registry: Arc<EndpointRegistry>,
        producers: ProducerCache,
    ) -> Self {
        Self {
            id: id.into(),
            expression,
            registry,
            producers,
            delimiter: ",".to_string(),
            ignore_invalid_endpoints: false,
        }
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn ignore_invalid_endpoints(mut self, ignore: bool) -> Self {
        self.ignore_invalid_endpoints = ignore;
        self
    }
}

#[async_trait]
impl Processor for RoutingSlip {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let uris = match endpoint_uris(self.expression.as_ref(), exchange, &self.delimiter) {
            Ok(uris) => uris,
            Err(exception) => {
                exchange.set_exception(exception);
                return Completion::Sync;
            }
        };
        let mut completion = Completion::Sync;
        let mut first = true;
        for uri in uris {
            if !first {
                if !continue_processing(exchange, &self.id) {
                    break;
                }
                exchange.prepare_for_next_step();
            }
            let leased = self
                .registry
                .resolve(&uri)
                .and_then(|endpoint| self.producers.acquire(&endpoint));
            let producer = match leased {
                Ok(producer) => producer,
                Err(error) if self.ignore_invalid_endpoints => {
                    log::warn!("{} ignoring invalid endpoint {}: {}", self.id, uri, error);
                    continue;
                }
                Err(error) => {
                    exchange.set_exception(no_such_endpoint(error));
                    break;
                }
            };
            first = false;
            exchange.set_property(keys::SLIP_ENDPOINT, uri.as_str());
            exchange.set_property(keys::TO_ENDPOINT, uri.as_str());
            completion = completion.and(send_to(&**producer, exchange).await);
        }
        completion
    }

    fn name(&self) -> &str {
        &self.id
    }
}
