use crate::exchange::{Exchange, Message};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Callbacks fired once when a unit of work finishes.
pub trait Synchronization: Send + Sync {
    fn on_complete(&self, exchange: &Exchange);

    fn on_failure(&self, exchange: &Exchange);
}

/// Lifecycle tracking for one exchange: the pristine input, the stack of routes currently
/// processing it, and the synchronizations to fire when it is done.
pub struct UnitOfWork {
    id: String,
    exchange_id: String,
    original_in: Message,
    started: Instant,
    route_stack: Mutex<Vec<String>>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    done: AtomicBool,
}

impl UnitOfWork {
    pub fn new(exchange: &Exchange) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            exchange_id: exchange.id().to_string(),
            original_in: exchange.in_message().clone(),
            started: Instant::now(),
            route_stack: Mutex::new(Vec::new()),
            synchronizations: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    /// The `in` message as it was when the unit of work started.
    pub fn original_in_message(&self) -> &Message {
        &self.original_in
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn add_synchronization(&self, synchronization: Arc<dyn Synchronization>) {
        let mut guard = self.synchronizations.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(synchronization);
    }

    pub fn push_route(&self, route_id: impl Into<String>) {
        let mut guard = self.route_stack.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(route_id.into());
    }

    pub fn pop_route(&self) -> Option<String> {
        let mut guard = self.route_stack.lock().unwrap_or_else(|e| e.into_inner());
        guard.pop()
    }

    pub fn current_route(&self) -> Option<String> {
        let guard = self.route_stack.lock().unwrap_or_else(|e| e.into_inner());
        guard.last().cloned()
    }

    pub fn route_stack_level(&self) -> usize {
        let guard = self.route_stack.lock().unwrap_or_else(|e| e.into_inner());
        guard.len()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Fires the registered synchronizations. Only the first call has any effect; it returns
    /// `true`, later calls return `false`.
    ///
    /// A failed exchange (exception set) triggers `on_failure`, anything else `on_complete`.
    /// A panicking synchronization is logged and does not prevent the others from running.
    pub fn done(&self, exchange: &Exchange) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        let synchronizations = {
            let mut guard = self.synchronizations.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let failed = exchange.is_failed();
        log::trace!(
            "Unit of work {} done for exchange {} (failed: {}, synchronizations: {})",
            self.id,
            exchange.id(),
            failed,
            synchronizations.len()
        );
        for synchronization in synchronizations {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if failed {
                    synchronization.on_failure(exchange);
                } else {
                    synchronization.on_complete(exchange);
                }
            }));
            if outcome.is_err() {
                log::warn!(
                    "Synchronization panicked while completing exchange {}. This is ignored.",
                    exchange.id()
                );
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exception;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        completed: AtomicUsize,
        failed: AtomicUsize,
    }

    impl Synchronization for Counting {
        fn on_complete(&self, _exchange: &Exchange) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _exchange: &Exchange) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl Synchronization for Panicking {
        fn on_complete(&self, _exchange: &Exchange) {
            panic!("misbehaving synchronization");
        }

        fn on_failure(&self, _exchange: &Exchange) {}
    }

    #[test]
    fn test_done_fires_exactly_once() {
        let exchange = Exchange::with_body("x");
        let uow = UnitOfWork::new(&exchange);
        let counting = Arc::new(Counting::default());
        uow.add_synchronization(counting.clone());
        assert!(uow.done(&exchange));
        assert!(!uow.done(&exchange));
        assert_eq!(counting.completed.load(Ordering::SeqCst), 1);
        assert_eq!(counting.failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_exchange_fires_on_failure() {
        let mut exchange = Exchange::with_body("x");
        let uow = UnitOfWork::new(&exchange);
        let counting = Arc::new(Counting::default());
        uow.add_synchronization(counting.clone());
        exchange.set_exception(Exception::illegal_state("boom"));
        uow.done(&exchange);
        assert_eq!(counting.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_synchronization_does_not_block_others() {
        let exchange = Exchange::default();
        let uow = UnitOfWork::new(&exchange);
        let counting = Arc::new(Counting::default());
        uow.add_synchronization(Arc::new(Panicking));
        uow.add_synchronization(counting.clone());
        uow.done(&exchange);
        assert_eq!(counting.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_route_stack_and_original_message() {
        let mut exchange = Exchange::with_body("original");
        let uow = UnitOfWork::new(&exchange);
        exchange.in_mut().set_body("changed");
        uow.push_route("outer");
        uow.push_route("inner");
        assert_eq!(uow.current_route().as_deref(), Some("inner"));
        assert_eq!(uow.route_stack_level(), 2);
        assert_eq!(uow.pop_route().as_deref(), Some("inner"));
        assert_eq!(uow.current_route().as_deref(), Some("outer"));
        assert_eq!(
            uow.original_in_message().body().as_text().unwrap(),
            "original"
        );
    }
}
