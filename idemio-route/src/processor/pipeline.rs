use crate::exchange::Exchange;
use crate::processor::{Processor, SharedProcessor, continue_processing, invoke};
use crate::status::Completion;
use async_trait::async_trait;

/// Runs processors in order, feeding each step's `out` message to the next step as `in`.
///
/// Before every step after the first, the exchange is checked with
/// [`continue_processing`]; a failed, rollback-only, handled, or stopped exchange ends the
/// pipeline without invoking the remaining steps. The caller's exchange is mutated in place,
/// so it always reflects the state of the last step that ran.
pub struct Pipeline {
    id: String,
    processors: Vec<SharedProcessor>,
}

impl Pipeline {
    pub fn new(id: impl Into<String>, processors: Vec<SharedProcessor>) -> Self {
        Self {
            id: id.into(),
            processors,
        }
    }

    /// Builds a pipeline, or returns the single processor unchanged when there is only one.
    pub fn of(id: impl Into<String>, mut processors: Vec<SharedProcessor>) -> SharedProcessor {
        if processors.len() == 1 {
            if let Some(only) = processors.pop() {
                return only;
            }
        }
        std::sync::Arc::new(Pipeline::new(id, processors))
    }

    pub fn processors(&self) -> &[SharedProcessor] {
        &self.processors
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let mut completion = Completion::Sync;
        for (index, processor) in self.processors.iter().enumerate() {
            if index > 0 {
                if !continue_processing(exchange, &self.id) {
                    break;
                }
                exchange.prepare_for_next_step();
            }
            log::trace!(
                "Pipeline {} processing exchange {} with step {} ({})",
                self.id,
                exchange.id(),
                index,
                processor.name()
            );
            completion = completion.and(invoke(processor.as_ref(), exchange).await);
        }
        log::trace!(
            "Pipeline {} finished exchange {} ({:?})",
            self.id,
            exchange.id(),
            completion
        );
        completion
    }

    fn name(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exception;
    use crate::processor::process_fn;
    use crate::test_support::{CountingProcessor, FailingProcessor, HoppingProcessor};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_out_feeds_next_step() {
        let first = process_fn("first", |exchange| {
            exchange.out_mut().set_body("from first");
            Ok(())
        });
        let second = process_fn("second", |exchange| {
            let seen = exchange.in_message().body().as_text().unwrap_or_default().to_string();
            assert!(!exchange.has_out());
            exchange.in_mut().set_body(format!("{} then second", seen));
            Ok(())
        });
        let pipeline = Pipeline::new("p", vec![first, second]);
        let mut exchange = Exchange::with_body("start");
        pipeline.process(&mut exchange).await;
        assert_eq!(
            exchange.in_message().body().as_text().unwrap(),
            "from first then second"
        );
    }

    #[tokio::test]
    async fn test_failure_short_circuits_remaining_steps() {
        let first = CountingProcessor::shared("s1");
        let failing = FailingProcessor::shared("s2", "step two failed");
        let third = CountingProcessor::shared("s3");
        let fourth = CountingProcessor::shared("s4");
        let pipeline = Pipeline::new(
            "p",
            vec![first.clone(), failing.clone(), third.clone(), fourth.clone()],
        );
        let mut exchange = Exchange::with_body("x");
        pipeline.process(&mut exchange).await;
        assert_eq!(first.count(), 1);
        assert_eq!(failing.count(), 1);
        assert_eq!(third.count(), 0);
        assert_eq!(fourth.count(), 0);
        assert_eq!(exchange.exception().unwrap().message(), "step two failed");
    }

    #[tokio::test]
    async fn test_rollback_and_stop_short_circuit() {
        let rollback = process_fn("rollback", |exchange| {
            exchange.set_rollback_only(true);
            Ok(())
        });
        let after = CountingProcessor::shared("after");
        let pipeline = Pipeline::new("p", vec![rollback, after.clone()]);
        pipeline.process(&mut Exchange::default()).await;
        assert_eq!(after.count(), 0);

        let stop = process_fn("stop", |exchange| {
            exchange.set_route_stop(true);
            Ok(())
        });
        let pipeline = Pipeline::new("p", vec![stop, after.clone()]);
        let mut exchange = Exchange::default();
        pipeline.process(&mut exchange).await;
        assert_eq!(after.count(), 0);
        assert!(!exchange.is_failed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_steps_keep_order_and_report_async() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let hopping = HoppingProcessor::shared("hop", log.clone());
        let log_after = log.clone();
        let after = process_fn("after", move |_| {
            log_after.lock().unwrap().push("after".to_string());
            Ok(())
        });
        let pipeline = Pipeline::new("p", vec![hopping, after]);
        let mut exchange = Exchange::default();
        let completion = pipeline.process(&mut exchange).await;
        assert_eq!(completion, Completion::Async);
        assert_eq!(*log.lock().unwrap(), vec!["hop".to_string(), "after".to_string()]);
    }

    #[tokio::test]
    async fn test_panicking_step_becomes_exception() {
        let panics = process_fn("panics", |_| -> Result<(), Exception> { panic!("kaboom") });
        let after = CountingProcessor::shared("after");
        let pipeline = Pipeline::new("p", vec![panics, after.clone()]);
        let mut exchange = Exchange::default();
        pipeline.process(&mut exchange).await;
        assert!(exchange.is_failed());
        assert_eq!(after.count(), 0);
    }

    #[test]
    fn test_single_step_degenerates() {
        let only = CountingProcessor::shared("only");
        let processor = Pipeline::of("p", vec![only.clone()]);
        assert_eq!(processor.name(), "only");
    }
}
