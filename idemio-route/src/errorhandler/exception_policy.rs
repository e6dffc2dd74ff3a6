use crate::errorhandler::fatal::FatalFallbackErrorHandler;
use crate::errorhandler::policy::{RedeliveryPolicy, RedeliveryPolicyOverride};
use crate::exchange::{Exception, ExceptionClass, Exchange};
use crate::expression::{SharedPredicate, always, never};
use crate::processor::SharedProcessor;
use std::sync::Arc;

/// Error handling that applies to failures of the given exception classes.
///
/// Matches a class and every class below it. A policy can be limited to one route and to
/// exchanges that satisfy a guard predicate.
#[derive(Clone)]
pub struct ExceptionPolicy {
    classes: Vec<&'static ExceptionClass>,
    route_id: Option<String>,
    on_when: Option<SharedPredicate>,
    redelivery: RedeliveryPolicyOverride,
    handled: Option<SharedPredicate>,
    continued: Option<SharedPredicate>,
    retry_while: Option<SharedPredicate>,
    failure_processor: Option<SharedProcessor>,
    on_redelivery: Option<SharedProcessor>,
    on_exception_occurred: Option<SharedProcessor>,
    use_original_message: bool,
    use_original_body: bool,
}

impl ExceptionPolicy {
    pub fn on(class: &'static ExceptionClass) -> Self {
        Self::on_any(vec![class])
    }

    pub fn on_any(classes: Vec<&'static ExceptionClass>) -> Self {
        Self {
            classes,
            route_id: None,
            on_when: None,
            redelivery: RedeliveryPolicyOverride::default(),
            handled: None,
            continued: None,
            retry_while: None,
            failure_processor: None,
            on_redelivery: None,
            on_exception_occurred: None,
            use_original_message: false,
            use_original_body: false,
        }
    }

    pub fn route_scoped(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = Some(route_id.into());
        self
    }

    pub fn on_when(mut self, guard: SharedPredicate) -> Self {
        self.on_when = Some(guard);
        self
    }

    pub fn maximum_redeliveries(mut self, maximum: i32) -> Self {
        self.redelivery.maximum_redeliveries = Some(maximum);
        self
    }

    pub fn redelivery_delay(mut self, delay_ms: u64) -> Self {
        self.redelivery.redelivery_delay_ms = Some(delay_ms);
        self
    }

    pub fn redelivery(mut self, redelivery: RedeliveryPolicyOverride) -> Self {
        self.redelivery = redelivery;
        self
    }

    pub fn handled(self, handled: bool) -> Self {
        self.handled_when(if handled { always() } else { never() })
    }

    pub fn handled_when(mut self, predicate: SharedPredicate) -> Self {
        self.handled = Some(predicate);
        self
    }

    pub fn continued(self, continued: bool) -> Self {
        self.continued_when(if continued { always() } else { never() })
    }

    pub fn continued_when(mut self, predicate: SharedPredicate) -> Self {
        self.continued = Some(predicate);
        self
    }

    pub fn retry_while(mut self, predicate: SharedPredicate) -> Self {
        self.retry_while = Some(predicate);
        self
    }

    /// Processor receiving exchanges that exhausted redelivery under this policy.
    pub fn to(mut self, processor: SharedProcessor) -> Self {
        self.failure_processor = Some(Arc::new(FatalFallbackErrorHandler::new(processor, false)));
        self
    }

    pub fn on_redelivery(mut self, processor: SharedProcessor) -> Self {
        self.on_redelivery = Some(processor);
        self
    }

    pub fn on_exception_occurred(mut self, processor: SharedProcessor) -> Self {
        self.on_exception_occurred = Some(processor);
        self
    }

    pub fn use_original_message(mut self) -> Self {
        self.use_original_message = true;
        self
    }

    pub fn use_original_body(mut self) -> Self {
        self.use_original_body = true;
        self
    }

    pub fn classes(&self) -> &[&'static ExceptionClass] {
        &self.classes
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn redelivery_policy(&self, base: &RedeliveryPolicy) -> RedeliveryPolicy {
        self.redelivery.apply(base)
    }

    pub fn handled_predicate(&self) -> Option<&SharedPredicate> {
        self.handled.as_ref()
    }

    pub fn continued_predicate(&self) -> Option<&SharedPredicate> {
        self.continued.as_ref()
    }

    pub fn retry_while_predicate(&self) -> Option<&SharedPredicate> {
        self.retry_while.as_ref()
    }

    pub fn failure_processor(&self) -> Option<&SharedProcessor> {
        self.failure_processor.as_ref()
    }

    pub fn on_redelivery_processor(&self) -> Option<&SharedProcessor> {
        self.on_redelivery.as_ref()
    }

    pub fn on_exception_occurred_processor(&self) -> Option<&SharedProcessor> {
        self.on_exception_occurred.as_ref()
    }

    pub fn is_use_original_message(&self) -> bool {
        self.use_original_message
    }

    pub fn is_use_original_body(&self) -> bool {
        self.use_original_body
    }

    fn applies_to(&self, exchange: &Exchange, route_id: Option<&str>) -> bool {
        if let Some(scope) = &self.route_id
            && route_id != Some(scope.as_str())
        {
            return false;
        }
        self.on_when
            .as_ref()
            .map(|guard| guard.matches(exchange))
            .unwrap_or(true)
    }

    fn distance(&self, class: &ExceptionClass) -> Option<usize> {
        self.classes
            .iter()
            .filter_map(|candidate| class.distance_to(candidate))
            .min()
    }
}

/// The exception policies of an error handler, in registration order.
///
/// [`find`](ExceptionPolicyTable::find) walks the failure's cause chain from the root cause
/// outward and returns the best policy for the first exception in the chain that any policy
/// matches. Among the policies matching that exception, a nearer class wins, then a
/// route-scoped policy over a global one, then the earlier registration.
#[derive(Clone, Default)]
pub struct ExceptionPolicyTable {
    policies: Vec<ExceptionPolicy>,
}

impl ExceptionPolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, policy: ExceptionPolicy) {
        self.policies.push(policy);
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn policies(&self) -> &[ExceptionPolicy] {
        &self.policies
    }

    /// Whether any policy may cause a redelivery on top of `base`.
    pub fn allows_redelivery(&self, base: &RedeliveryPolicy) -> bool {
        self.policies.iter().any(|policy| {
            policy.retry_while.is_some() || policy.redelivery_policy(base).maximum_redeliveries != 0
        })
    }

    pub fn find(
        &self,
        exchange: &Exchange,
        exception: &Exception,
        route_id: Option<&str>,
    ) -> Option<&ExceptionPolicy> {
        let chain: Vec<&Exception> = exception.chain().collect();
        for candidate in chain.into_iter().rev() {
            let best = self
                .policies
                .iter()
                .enumerate()
                .filter(|(_, policy)| policy.applies_to(exchange, route_id))
                .filter_map(|(order, policy)| {
                    policy.distance(candidate.class()).map(|distance| {
                        let scope_rank = if policy.route_id.is_some() { 0 } else { 1 };
                        ((distance, scope_rank, order), policy)
                    })
                })
                .min_by_key(|(rank, _)| *rank);
            if let Some((rank, policy)) = best {
                log::trace!(
                    "Exception policy for {} matched {} at distance {}",
                    candidate.class(),
                    policy
                        .classes
                        .iter()
                        .map(|c| c.name())
                        .collect::<Vec<_>>()
                        .join(","),
                    rank.0
                );
                return Some(policy);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::exception::classes;
    use crate::expression::header_equals;

    fn table(policies: Vec<ExceptionPolicy>) -> ExceptionPolicyTable {
        let mut table = ExceptionPolicyTable::new();
        for policy in policies {
            table.add(policy);
        }
        table
    }

    #[test]
    fn test_exact_class_beats_ancestor() {
        let table = table(vec![
            ExceptionPolicy::on(&classes::RUNTIME).maximum_redeliveries(1),
            ExceptionPolicy::on(&classes::ILLEGAL_STATE).maximum_redeliveries(2),
        ]);
        let exchange = Exchange::default();
        let found = table
            .find(&exchange, &Exception::illegal_state("boom"), None)
            .unwrap();
        assert_eq!(found.classes()[0].name(), "IllegalState");
    }

    #[test]
    fn test_nearest_ancestor_wins() {
        let table = table(vec![
            ExceptionPolicy::on(&classes::EXCEPTION),
            ExceptionPolicy::on(&classes::RUNTIME),
        ]);
        let found = table
            .find(&Exchange::default(), &Exception::illegal_argument("bad"), None)
            .unwrap();
        assert_eq!(found.classes()[0].name(), "Runtime");
    }

    #[test]
    fn test_route_scope_beats_global_then_registration_order() {
        let table = table(vec![
            ExceptionPolicy::on(&classes::IO).maximum_redeliveries(1),
            ExceptionPolicy::on(&classes::IO).maximum_redeliveries(2),
            ExceptionPolicy::on(&classes::IO).route_scoped("orders").maximum_redeliveries(3),
        ]);
        let exception = Exception::new(&classes::IO, "disk");
        let base = RedeliveryPolicy::default();
        let exchange = Exchange::default();

        let scoped = table.find(&exchange, &exception, Some("orders")).unwrap();
        assert_eq!(scoped.redelivery_policy(&base).maximum_redeliveries, 3);

        let global = table.find(&exchange, &exception, Some("billing")).unwrap();
        assert_eq!(global.redelivery_policy(&base).maximum_redeliveries, 1);
    }

    #[test]
    fn test_root_cause_is_matched_first() {
        let table = table(vec![
            ExceptionPolicy::on(&classes::EXCHANGE_FAILED).maximum_redeliveries(1),
            ExceptionPolicy::on(&classes::IO).maximum_redeliveries(5),
        ]);
        let exception =
            Exception::exchange_failed("wrapped", Exception::new(&classes::IO, "socket closed"));
        let found = table.find(&Exchange::default(), &exception, None).unwrap();
        assert_eq!(found.classes()[0].name(), "Io");
    }

    #[test]
    fn test_guard_predicate_filters() {
        let table = table(vec![
            ExceptionPolicy::on(&classes::RUNTIME).on_when(header_equals("retry", true)),
        ]);
        let exception = Exception::illegal_state("x");
        assert!(table.find(&Exchange::default(), &exception, None).is_none());

        let exchange = Exchange::builder().header("retry", true).build();
        assert!(table.find(&exchange, &exception, None).is_some());
    }

    #[test]
    fn test_no_match() {
        let table = table(vec![ExceptionPolicy::on(&classes::IO)]);
        assert!(
            table
                .find(&Exchange::default(), &Exception::illegal_state("x"), None)
                .is_none()
        );
        assert!(!table.allows_redelivery(&RedeliveryPolicy::default()));
    }
}
