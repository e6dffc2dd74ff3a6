use crate::exchange::{Body, Exchange, keys};
use crate::expression::{SharedExpression, evaluate_items};
use crate::processor::aggregation::{
    AggregationOrder, SharedAggregationStrategy, UseOriginalAggregationStrategy,
};
use crate::processor::multicast::{BranchKeys, BranchPair, MulticastSettings};
use crate::processor::{Processor, SharedProcessor};
use crate::status::Completion;
use async_trait::async_trait;
use std::sync::Arc;

const SPLIT_KEYS: BranchKeys = BranchKeys {
    index: keys::SPLIT_INDEX,
    complete: keys::SPLIT_COMPLETE,
    size: Some(keys::SPLIT_SIZE),
};

/// Splits the exchange into one part per item of an expression result and routes every part
/// through the same processor.
///
/// By default the exchange leaving the splitter is the input exchange, failed when any part
/// failed.
pub struct Splitter {
    id: String,
    expression: SharedExpression,
    processor: SharedProcessor,
    delimiter: Option<String>,
    settings: MulticastSettings,
}

impl Splitter {
    pub fn new(id: impl Into<String>, expression: SharedExpression, processor: SharedProcessor) -> Self {
        let settings = MulticastSettings {
            strategy: Arc::new(UseOriginalAggregationStrategy::default()),
            ..MulticastSettings::default()
        };
        Self {
            id: id.into(),
            expression,
            processor,
            delimiter: Some(",".to_string()),
            settings,
        }
    }

    /// Splits string results on `delimiter`. `None` keeps a string as a single part.
    pub fn delimiter(mut self, delimiter: Option<String>) -> Self {
        self.delimiter = delimiter;
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
impl Processor for Splitter {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let items = match evaluate_items(
            self.expression.as_ref(),
            exchange,
            self.delimiter.as_deref(),
        ) {
            Ok(items) => items,
            Err(exception) => {
                exchange.set_exception(exception);
                return Completion::Sync;
            }
        };
        log::trace!("{} splitting exchange {} into {} parts", self.id, exchange.id(), items.len());
        let mut pairs = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let mut part = self.settings.branch_copy(exchange);
            part.in_mut().set_body(Body::from(item));
            pairs.push(BranchPair::new(index, self.processor.clone(), part));
        }
        self.settings
            .execute(&self.id, exchange, pairs, SPLIT_KEYS)
            .await
    }

    fn name(&self) -> &str {
        &self.id
    }
}
