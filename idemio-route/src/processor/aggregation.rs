use crate::exchange::Exchange;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub type SharedAggregationStrategy = Arc<dyn AggregationStrategy>;

/// Combines the accumulated result of a fan-out with the next branch result.
///
/// `old` is `None` for the first result. `input` is the exchange that entered the composite,
/// for strategies that want to answer with the original input.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange, input: &Exchange) -> Exchange;
}

/// In which order parallel branch results are handed to the aggregation strategy.
///
/// Sequential execution always aggregates in destination order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AggregationOrder {
    /// As branches finish. The order is not deterministic.
    #[default]
    Completion,
    /// In destination order, on the calling task, after all branches finished.
    Submission,
}

/// Last result wins. A failure carried by the accumulated result is kept when the newer
/// result succeeded.
#[derive(Debug, Default, Clone, Copy)]
pub struct UseLatestAggregationStrategy;

impl AggregationStrategy for UseLatestAggregationStrategy {
    fn aggregate(&self, old: Option<Exchange>, mut new: Exchange, _input: &Exchange) -> Exchange {
        if let Some(old) = old {
            if !new.is_failed() {
                if let Some(exception) = old.exception() {
                    new.set_exception(exception.clone());
                }
            }
        }
        new
    }
}

/// Answers with the input exchange, optionally carrying over a branch failure.
#[derive(Debug, Clone, Copy)]
pub struct UseOriginalAggregationStrategy {
    propagate_exception: bool,
}

impl UseOriginalAggregationStrategy {
    pub fn new(propagate_exception: bool) -> Self {
        Self {
            propagate_exception,
        }
    }
}

impl Default for UseOriginalAggregationStrategy {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AggregationStrategy for UseOriginalAggregationStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange, input: &Exchange) -> Exchange {
        let mut result = match old {
            Some(old) => old,
            None => input.copy(),
        };
        if self.propagate_exception && !result.is_failed() {
            if let Some(exception) = new.exception() {
                result.set_exception(exception.clone());
            }
        }
        result
    }
}

/// Collects every branch body into a JSON array on the result's `in` message.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupedBodyAggregationStrategy;

impl AggregationStrategy for GroupedBodyAggregationStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange, _input: &Exchange) -> Exchange {
        let body = new.message().body().to_json();
        let mut result = match old {
            Some(old) => old,
            None => {
                let mut first = new;
                first.clear_out();
                first.in_mut().set_body(Value::Array(Vec::new()));
                first
            }
        };
        if let crate::exchange::Body::Json(Value::Array(items)) = result.in_mut().body_mut() {
            items.push(body);
        }
        result
    }
}
