use crate::exchange::{Exception, Exchange, keys};
use crate::expression::{SharedExpression, SharedPredicate};
use crate::processor::{Processor, SharedProcessor, continue_processing, invoke};
use crate::status::Completion;
use async_trait::async_trait;

enum LoopMode {
    Count(SharedExpression),
    While(SharedPredicate),
}

/// Runs a processor repeatedly, either a computed number of times or while a predicate holds.
///
/// Each iteration sees the previous iteration's result unless `copy` is set, in which case
/// every iteration starts from a copy of the exchange as it entered the loop.
pub struct Loop {
    id: String,
    mode: LoopMode,
    processor: SharedProcessor,
    copy: bool,
}

impl Loop {
    pub fn count(id: impl Into<String>, count: SharedExpression, processor: SharedProcessor) -> Self {
        Self {
            id: id.into(),
            mode: LoopMode::Count(count),
            processor,
            copy: false,
        }
    }

    pub fn while_loop(
        id: impl Into<String>,
        predicate: SharedPredicate,
        processor: SharedProcessor,
    ) -> Self {
        Self {
            id: id.into(),
            mode: LoopMode::While(predicate),
            processor,
            copy: false,
        }
    }

    pub fn copy(mut self, copy: bool) -> Self {
        self.copy = copy;
        self
    }

    fn iterations(&self, exchange: &Exchange) -> Result<Option<i64>, Exception> {
        match &self.mode {
            LoopMode::While(_) => Ok(None),
            LoopMode::Count(expression) => {
                let value = expression.evaluate(exchange)?;
                let count = match &value {
                    serde_json::Value::Number(number) => number.as_i64(),
                    serde_json::Value::String(text) => text.trim().parse::<i64>().ok(),
                    _ => None,
                };
                count.map(Some).ok_or_else(|| {
                    Exception::illegal_argument(format!(
                        "Loop count must be an integer but was: {}",
                        value
                    ))
                })
            }
        }
    }

    fn should_continue(&self, exchange: &Exchange, index: i64, count: Option<i64>) -> bool {
        match (&self.mode, count) {
            (LoopMode::Count(_), Some(count)) => index < count,
            (LoopMode::While(predicate), _) => predicate.matches(exchange),
            _ => false,
        }
    }
}

#[async_trait]
impl Processor for Loop {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let count = match self.iterations(exchange) {
            Ok(count) => count,
            Err(exception) => {
                exchange.set_exception(exception);
                return Completion::Sync;
            }
        };
        let original = if self.copy { Some(exchange.copy()) } else { None };
        let mut completion = Completion::Sync;
        let mut index: i64 = 0;
        while self.should_continue(exchange, index, count) {
            if index > 0 {
                exchange.prepare_for_next_step();
            }
            if let Some(original) = &original {
                let mut fresh = original.copy();
                fresh.set_unit_of_work(exchange.unit_of_work().cloned());
                *exchange = fresh;
            }
            exchange.set_property(keys::LOOP_INDEX, index);
            if let Some(count) = count {
                exchange.set_property(keys::LOOP_SIZE, count);
            }
            log::trace!("{} iteration {} for exchange {}", self.id, index, exchange.id());
            completion = completion.and(invoke(self.processor.as_ref(), exchange).await);
            index += 1;
            if !continue_processing(exchange, &self.id) {
                break;
            }
        }
        completion
    }

    fn name(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{constant, header, predicate};
    use crate::processor::process_fn;
    use crate::test_support::{CountingProcessor, FailingProcessor};

    fn append_index() -> SharedProcessor {
        process_fn("append", |exchange| {
            let text = exchange.in_message().body().as_text().unwrap_or_default().to_string();
            let index = exchange.property_i64(keys::LOOP_INDEX).unwrap_or(-1);
            exchange.out_mut().set_body(format!("{}{}", text, index));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_count_loop_chains_results() {
        let looped = Loop::count("loop", header("times"), append_index());
        let mut exchange = Exchange::builder().body(">").header("times", "3").build();
        looped.process(&mut exchange).await;
        assert_eq!(exchange.message().body().as_text().unwrap(), ">012");
        assert_eq!(exchange.property_i64(keys::LOOP_SIZE), Some(3));
        assert_eq!(exchange.property_i64(keys::LOOP_INDEX), Some(2));
    }

    #[tokio::test]
    async fn test_copy_mode_restarts_from_input() {
        let looped = Loop::count("loop", constant(3), append_index()).copy(true);
        let mut exchange = Exchange::with_body(">");
        looped.process(&mut exchange).await;
        assert_eq!(exchange.message().body().as_text().unwrap(), ">2");
    }

    #[tokio::test]
    async fn test_while_loop() {
        let increment = process_fn("inc", |exchange| {
            let n = exchange.property_i64("n").unwrap_or(0);
            exchange.set_property("n", n + 1);
            Ok(())
        });
        let looped = Loop::while_loop(
            "loop",
            predicate(|exchange| exchange.property_i64("n").unwrap_or(0) < 5),
            increment,
        );
        let mut exchange = Exchange::default();
        looped.process(&mut exchange).await;
        assert_eq!(exchange.property_i64("n"), Some(5));
        assert_eq!(exchange.property(keys::LOOP_SIZE), None);
    }

    #[tokio::test]
    async fn test_failure_stops_loop() {
        let failing = FailingProcessor::shared("f", "iteration failed");
        let looped = Loop::count("loop", constant(5), failing.clone());
        let mut exchange = Exchange::default();
        looped.process(&mut exchange).await;
        assert_eq!(failing.count(), 1);
        assert!(exchange.is_failed());
    }

    #[tokio::test]
    async fn test_invalid_count() {
        let counting = CountingProcessor::shared("c");
        let looped = Loop::count("loop", constant("many"), counting.clone());
        let mut exchange = Exchange::default();
        looped.process(&mut exchange).await;
        assert!(exchange.is_failed());
        assert_eq!(counting.count(), 0);
    }
}
