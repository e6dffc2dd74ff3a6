use crate::exchange::{Exception, Exchange};
use crate::expression::SharedExpression;
use crate::processor::Processor;
use crate::spi::{ShutdownStrategy, sleep_interruptibly};
use crate::status::Completion;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

enum Delay {
    Fixed(Duration),
    Computed(SharedExpression),
}

/// Holds the exchange back for a fixed or computed number of milliseconds.
///
/// The wait ends early when shutdown starts; unless the delayer is allowed to finish during
/// shutdown, the exchange is then rejected.
pub struct Delayer {
    id: String,
    delay: Delay,
    shutdown: Arc<dyn ShutdownStrategy>,
    run_during_shutdown: bool,
}

impl Delayer {
    pub fn fixed(id: impl Into<String>, delay: Duration, shutdown: Arc<dyn ShutdownStrategy>) -> Self {
        Self {
            id: id.into(),
            delay: Delay::Fixed(delay),
            shutdown,
            run_during_shutdown: false,
        }
    }

    /// The expression yields the delay in milliseconds. Missing, zero or negative values mean
    /// no delay.
    pub fn computed(
        id: impl Into<String>,
        expression: SharedExpression,
        shutdown: Arc<dyn ShutdownStrategy>,
    ) -> Self {
        Self {
            id: id.into(),
            delay: Delay::Computed(expression),
            shutdown,
            run_during_shutdown: false,
        }
    }

    pub fn run_during_shutdown(mut self, run: bool) -> Self {
        self.run_during_shutdown = run;
        self
    }

    fn delay_for(&self, exchange: &Exchange) -> Result<Duration, Exception> {
        match &self.delay {
            Delay::Fixed(delay) => Ok(*delay),
            Delay::Computed(expression) => {
                let millis = match expression.evaluate(exchange)? {
                    Value::Number(number) => number
                        .as_i64()
                        .or_else(|| number.as_f64().map(|millis| millis.round() as i64))
                        .unwrap_or(0),
                    Value::String(text) => text.trim().parse::<i64>().map_err(|_| {
                        Exception::illegal_argument(format!("Invalid delay value: {}", text))
                    })?,
                    _ => 0,
                };
                Ok(Duration::from_millis(millis.max(0) as u64))
            }
        }
    }
}

#[async_trait]
impl Processor for Delayer {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let delay = match self.delay_for(exchange) {
            Ok(delay) => delay,
            Err(exception) => {
                exchange.set_exception(exception);
                return Completion::Sync;
            }
        };
        if delay.is_zero() {
            return Completion::Sync;
        }
        log::trace!("{} delaying exchange {} for {:?}", self.id, exchange.id(), delay);
        if !sleep_interruptibly(self.shutdown.as_ref(), delay).await {
            if self.run_during_shutdown {
                log::debug!("{} interrupted during shutdown, continuing exchange {}", self.id, exchange.id());
            } else {
                exchange.set_exception(Exception::rejected_execution(format!(
                    "Delay of exchange {} interrupted by shutdown",
                    exchange.id()
                )));
            }
        }
        Completion::Async
    }

    fn name(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::exception::classes;
    use crate::expression::header;
    use crate::spi::DefaultShutdownStrategy;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_computed_delay() {
        let shutdown = Arc::new(DefaultShutdownStrategy::new());
        let delayer = Delayer::computed("d", header("delay"), shutdown);
        let mut exchange = Exchange::builder().header("delay", 250).build();
        let started = Instant::now();
        let completion = delayer.process(&mut exchange).await;
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(!exchange.is_failed());
        assert_eq!(completion, Completion::Async);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_delay_is_rounded() {
        let shutdown = Arc::new(DefaultShutdownStrategy::new());
        let delayer = Delayer::computed("d", header("delay"), shutdown);
        let mut exchange = Exchange::builder().header("delay", 10.6).build();
        let started = Instant::now();
        let completion = delayer.process(&mut exchange).await;
        assert!(started.elapsed() >= Duration::from_millis(11));
        assert_eq!(completion, Completion::Async);
    }

    #[tokio::test]
    async fn test_zero_delay_stays_sync() {
        let shutdown = Arc::new(DefaultShutdownStrategy::new());
        let delayer = Delayer::fixed("d", Duration::ZERO, shutdown);
        let completion = delayer.process(&mut Exchange::default()).await;
        assert_eq!(completion, Completion::Sync);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_delayed_exchange() {
        let shutdown = Arc::new(DefaultShutdownStrategy::new());
        let delayer = Delayer::fixed("d", Duration::from_secs(30), shutdown.clone());
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stopper.begin_shutdown();
        });
        let mut exchange = Exchange::default();
        delayer.process(&mut exchange).await;
        assert!(exchange.exception().unwrap().is_instance_of(&classes::REJECTED_EXECUTION));
    }

    #[tokio::test]
    async fn test_invalid_delay_value() {
        let shutdown = Arc::new(DefaultShutdownStrategy::new());
        let delayer = Delayer::computed("d", header("delay"), shutdown);
        let mut exchange = Exchange::builder().header("delay", "soon").build();
        delayer.process(&mut exchange).await;
        assert!(exchange.exception().unwrap().is_instance_of(&classes::ILLEGAL_ARGUMENT));
    }
}
