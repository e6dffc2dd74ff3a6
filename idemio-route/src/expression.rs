use crate::exchange::{Exception, ExceptionClass, Exchange};
use serde_json::Value;
use std::sync::Arc;

pub type SharedExpression = Arc<dyn Expression>;
pub type SharedPredicate = Arc<dyn Predicate>;

/// Computes a value from an exchange.
pub trait Expression: Send + Sync {
    fn evaluate(&self, exchange: &Exchange) -> Result<Value, Exception>;
}

/// A yes/no test against an exchange.
pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> bool;
}

impl<F> Expression for F
where
    F: Fn(&Exchange) -> Result<Value, Exception> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> Result<Value, Exception> {
        self(exchange)
    }
}

impl<F> Predicate for F
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> bool {
        self(exchange)
    }
}

pub fn expression<F>(f: F) -> SharedExpression
where
    F: Fn(&Exchange) -> Result<Value, Exception> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn predicate<F>(f: F) -> SharedPredicate
where
    F: Fn(&Exchange) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn constant(value: impl Into<Value>) -> SharedExpression {
    let value = value.into();
    expression(move |_| Ok(value.clone()))
}

/// The named header of the `in` message, or `null` when absent.
pub fn header(name: impl Into<String>) -> SharedExpression {
    let name = name.into();
    expression(move |exchange| {
        Ok(exchange
            .in_message()
            .header(&name)
            .cloned()
            .unwrap_or(Value::Null))
    })
}

/// The named exchange property, or `null` when absent.
pub fn property(name: impl Into<String>) -> SharedExpression {
    let name = name.into();
    expression(move |exchange| Ok(exchange.property(&name).unwrap_or(Value::Null)))
}

/// The `in` body as JSON.
pub fn body() -> SharedExpression {
    expression(|exchange| Ok(exchange.in_message().body().to_json()))
}

pub fn always() -> SharedPredicate {
    predicate(|_| true)
}

pub fn never() -> SharedPredicate {
    predicate(|_| false)
}

pub fn header_equals(name: impl Into<String>, value: impl Into<Value>) -> SharedPredicate {
    let name = name.into();
    let value = value.into();
    predicate(move |exchange| exchange.in_message().header(&name) == Some(&value))
}

/// Matches when the current exception, or any of its causes, is of `class`.
pub fn exception_of(class: &'static ExceptionClass) -> SharedPredicate {
    predicate(move |exchange| {
        exchange
            .exception()
            .map(|exception| exception.chain().any(|e| e.is_instance_of(class)))
            .unwrap_or(false)
    })
}

/// Evaluates `expression` and interprets the result as a list of items.
///
/// Arrays are returned as is, `null` yields no items, a string is split on `delimiter` (when
/// given) and any other value is a single item.
pub(crate) fn evaluate_items(
    expression: &dyn Expression,
    exchange: &Exchange,
    delimiter: Option<&str>,
) -> Result<Vec<Value>, Exception> {
    let items = match expression.evaluate(exchange)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        Value::String(text) => match delimiter {
            Some(delimiter) => text
                .split(delimiter)
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect(),
            None => vec![Value::String(text)],
        },
        other => vec![other],
    };
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::exception::classes;
    use serde_json::json;

    #[test]
    fn test_header_and_property_expressions() {
        let mut exchange = Exchange::builder().body("b").header("h", 7).build();
        exchange.set_property("p", "value");
        assert_eq!(header("h").evaluate(&exchange).unwrap(), json!(7));
        assert_eq!(header("missing").evaluate(&exchange).unwrap(), Value::Null);
        assert_eq!(property("p").evaluate(&exchange).unwrap(), json!("value"));
        assert_eq!(body().evaluate(&exchange).unwrap(), json!("b"));
        assert_eq!(constant(3).evaluate(&exchange).unwrap(), json!(3));
    }

    #[test]
    fn test_predicates() {
        let exchange = Exchange::builder().header("type", "gold").build();
        assert!(header_equals("type", "gold").matches(&exchange));
        assert!(!header_equals("type", "silver").matches(&exchange));
        assert!(always().matches(&exchange));
        assert!(!never().matches(&exchange));
    }

    #[test]
    fn test_exception_of_checks_causes() {
        let mut exchange = Exchange::default();
        assert!(!exception_of(&classes::IO).matches(&exchange));
        let cause = Exception::new(&classes::IO, "disk");
        exchange.set_exception(Exception::illegal_state("wrapper").with_cause(cause));
        assert!(exception_of(&classes::IO).matches(&exchange));
        assert!(exception_of(&classes::RUNTIME).matches(&exchange));
        assert!(!exception_of(&classes::TIMEOUT).matches(&exchange));
    }

    #[test]
    fn test_evaluate_items() {
        let exchange = Exchange::default();
        let items = evaluate_items(&*constant("a, b,,c"), &exchange, Some(",")).unwrap();
        assert_eq!(items, vec![json!("a"), json!("b"), json!("c")]);
        let items = evaluate_items(&*constant(json!([1, 2])), &exchange, Some(",")).unwrap();
        assert_eq!(items.len(), 2);
        assert!(evaluate_items(&*constant(Value::Null), &exchange, None).unwrap().is_empty());
        assert_eq!(evaluate_items(&*constant(5), &exchange, None).unwrap(), vec![json!(5)]);
    }
}
