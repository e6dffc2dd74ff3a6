use crate::exchange::{Exchange, keys};
use crate::expression::SharedPredicate;
use crate::processor::{Processor, SharedProcessor, invoke};
use crate::status::Completion;
use async_trait::async_trait;

/// Runs the processor only when the predicate matches. The outcome is recorded under
/// [`keys::FILTER_MATCHED`].
pub struct Filter {
    id: String,
    predicate: SharedPredicate,
    processor: SharedProcessor,
}

impl Filter {
    pub fn new(id: impl Into<String>, predicate: SharedPredicate, processor: SharedProcessor) -> Self {
        Self {
            id: id.into(),
            predicate,
            processor,
        }
    }

    pub(crate) fn matches(&self, exchange: &mut Exchange) -> bool {
        let matched = self.predicate.matches(exchange);
        exchange.set_property(keys::FILTER_MATCHED, matched);
        matched
    }
}

#[async_trait]
impl Processor for Filter {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        if self.matches(exchange) {
            invoke(self.processor.as_ref(), exchange).await
        } else {
            log::trace!("{} filtered out exchange {}", self.id, exchange.id());
            Completion::Sync
        }
    }

    fn name(&self) -> &str {
        &self.id
    }
}

/// Content based routing: the first `when` whose predicate matches handles the exchange,
/// otherwise the `otherwise` processor, if any.
pub struct Choice {
    id: String,
    whens: Vec<Filter>,
    otherwise: Option<SharedProcessor>,
}

impl Choice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            whens: Vec::new(),
            otherwise: None,
        }
    }

    pub fn when(mut self, predicate: SharedPredicate, processor: SharedProcessor) -> Self {
        let id = format!("{}-when-{}", self.id, self.whens.len());
        self.whens.push(Filter::new(id, predicate, processor));
        self
    }

    pub fn otherwise(mut self, processor: SharedProcessor) -> Self {
        self.otherwise = Some(processor);
        self
    }
}

#[async_trait]
impl Processor for Choice {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        for when in &self.whens {
            if when.matches(exchange) {
                return invoke(when.processor.as_ref(), exchange).await;
            }
        }
        match &self.otherwise {
            Some(otherwise) => invoke(otherwise.as_ref(), exchange).await,
            None => Completion::Sync,
        }
    }

    fn name(&self) -> &str {
        &self.id
    }
}
