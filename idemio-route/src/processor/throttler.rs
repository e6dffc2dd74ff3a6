use crate::exchange::exception::classes;
use crate::exchange::{Exception, Exchange};
use crate::processor::Processor;
use crate::spi::{ShutdownStrategy, sleep_interruptibly};
use crate::status::Completion;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Lets at most `max_requests` exchanges through per `period`, using a sliding window.
///
/// Exchanges over the limit wait for a free slot, or fail with `ThrottlerRejected` when the
/// throttler rejects instead of waiting.
pub struct Throttler {
    id: String,
    max_requests: usize,
    period: Duration,
    reject_when_exceeded: bool,
    window: Mutex<VecDeque<Instant>>,
    shutdown: Arc<dyn ShutdownStrategy>,
}

impl Throttler {
    pub fn new(
        id: impl Into<String>,
        max_requests: usize,
        period: Duration,
        shutdown: Arc<dyn ShutdownStrategy>,
    ) -> Self {
        Self {
            id: id.into(),
            max_requests: max_requests.max(1),
            period,
            reject_when_exceeded: false,
            window: Mutex::new(VecDeque::new()),
            shutdown,
        }
    }

    pub fn reject_when_exceeded(mut self, reject: bool) -> Self {
        self.reject_when_exceeded = reject;
        self
    }

    /// Takes a slot, or returns how long until the oldest slot frees up.
    fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.period {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() < self.max_requests {
            window.push_back(now);
            return Ok(());
        }
        let wait = window
            .front()
            .map(|oldest| self.period.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or_default();
        Err(wait)
    }
}

#[async_trait]
impl Processor for Throttler {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let mut completion = Completion::Sync;
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return completion,
                Err(wait) => wait,
            };
            if self.reject_when_exceeded {
                exchange.set_exception(Exception::new(
                    &classes::THROTTLER_REJECTED,
                    format!(
                        "Exceeded the max throttle rate of {} within {}ms",
                        self.max_requests,
                        self.period.as_millis()
                    ),
                ));
                return completion;
            }
            log::trace!("{} throttling exchange {} for {:?}", self.id, exchange.id(), wait);
            completion = Completion::Async;
            if !sleep_interruptibly(self.shutdown.as_ref(), wait.max(Duration::from_millis(1))).await {
                exchange.set_exception(Exception::rejected_execution(format!(
                    "Throttled exchange {} rejected during shutdown",
                    exchange.id()
                )));
                return completion;
            }
        }
    }

    fn name(&self) -> &str {
        &self.id
    }
}
