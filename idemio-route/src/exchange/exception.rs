use std::any::Any;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// A node in the single-inheritance classification used to match exceptions against
/// exception policies.
///
/// Classes are declared as statics so identity comparisons are pointer comparisons:
///
/// ```rust
/// use idemio_route::exchange::exception::{ExceptionClass, classes};
///
/// static VALIDATION: ExceptionClass = ExceptionClass::new("Validation", Some(&classes::ILLEGAL_ARGUMENT));
///
/// assert_eq!(VALIDATION.distance_to(&classes::ILLEGAL_ARGUMENT), Some(1));
/// assert_eq!(VALIDATION.distance_to(&classes::EXCEPTION), Some(3));
/// assert_eq!(VALIDATION.distance_to(&classes::IO), None);
/// ```
#[derive(Debug)]
pub struct ExceptionClass {
    name: &'static str,
    parent: Option<&'static ExceptionClass>,
}

impl ExceptionClass {
    pub const fn new(name: &'static str, parent: Option<&'static ExceptionClass>) -> Self {
        Self { name, parent }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static ExceptionClass> {
        self.parent
    }

    pub fn is(&self, other: &ExceptionClass) -> bool {
        std::ptr::eq(self, other)
    }

    /// Number of inheritance hops from this class up to `ancestor`, `Some(0)` for the class
    /// itself, `None` when `ancestor` is not in the chain.
    pub fn distance_to(&self, ancestor: &ExceptionClass) -> Option<usize> {
        let mut current: Option<&ExceptionClass> = Some(self);
        let mut distance = 0;
        while let Some(class) = current {
            if class.is(ancestor) {
                return Some(distance);
            }
            current = class.parent;
            distance += 1;
        }
        None
    }

    pub fn is_a(&self, ancestor: &ExceptionClass) -> bool {
        self.distance_to(ancestor).is_some()
    }
}

impl Display for ExceptionClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Built-in exception classes raised by the routing engine itself.
pub mod classes {
    use super::ExceptionClass;

    pub static EXCEPTION: ExceptionClass = ExceptionClass::new("Exception", None);
    pub static RUNTIME: ExceptionClass = ExceptionClass::new("Runtime", Some(&EXCEPTION));
    pub static ILLEGAL_STATE: ExceptionClass = ExceptionClass::new("IllegalState", Some(&RUNTIME));
    pub static ILLEGAL_ARGUMENT: ExceptionClass =
        ExceptionClass::new("IllegalArgument", Some(&RUNTIME));
    pub static REJECTED_EXECUTION: ExceptionClass =
        ExceptionClass::new("RejectedExecution", Some(&RUNTIME));
    pub static THROTTLER_REJECTED: ExceptionClass =
        ExceptionClass::new("ThrottlerRejected", Some(&REJECTED_EXECUTION));
    pub static NO_SUCH_ENDPOINT: ExceptionClass =
        ExceptionClass::new("NoSuchEndpoint", Some(&RUNTIME));
    pub static PANIC: ExceptionClass = ExceptionClass::new("Panic", Some(&RUNTIME));
    pub static INTERRUPTED: ExceptionClass = ExceptionClass::new("Interrupted", Some(&EXCEPTION));
    pub static IO: ExceptionClass = ExceptionClass::new("Io", Some(&EXCEPTION));
    pub static TIMEOUT: ExceptionClass = ExceptionClass::new("Timeout", Some(&EXCEPTION));
    pub static EXCHANGE_FAILED: ExceptionClass =
        ExceptionClass::new("ExchangeFailed", Some(&EXCEPTION));
}

static NEXT_EXCEPTION_ID: AtomicU64 = AtomicU64::new(1);

/// The value stored in an exchange's exception slot.
///
/// Clones share the same identity, so a caught exception can be compared with the one
/// currently on the exchange via [`Exception::same_as`].
#[derive(Error, Debug, Clone)]
#[error("{class}: {message}")]
pub struct Exception {
    id: u64,
    class: &'static ExceptionClass,
    message: String,
    #[source]
    cause: Option<Arc<Exception>>,
    suppressed: Vec<Arc<Exception>>,
}

impl Exception {
    pub fn new(class: &'static ExceptionClass, message: impl Into<String>) -> Self {
        Self {
            id: NEXT_EXCEPTION_ID.fetch_add(1, Ordering::Relaxed),
            class,
            message: message.into(),
            cause: None,
            suppressed: Vec::new(),
        }
    }

    pub fn with_cause(mut self, cause: Exception) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Converts any error into an exception of the given class, keeping its source chain as
    /// generic causes.
    pub fn from_error(
        class: &'static ExceptionClass,
        error: &(dyn std::error::Error + 'static),
    ) -> Self {
        let mut exception = Exception::new(class, error.to_string());
        if let Some(source) = error.source() {
            exception.cause = Some(Arc::new(Exception::from_error(&classes::EXCEPTION, source)));
        }
        exception
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "processor panicked".to_string()
        };
        Exception::new(&classes::PANIC, message)
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Exception::new(&classes::ILLEGAL_STATE, message)
    }

    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Exception::new(&classes::ILLEGAL_ARGUMENT, message)
    }

    pub fn rejected_execution(message: impl Into<String>) -> Self {
        Exception::new(&classes::REJECTED_EXECUTION, message)
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Exception::new(&classes::INTERRUPTED, message)
    }

    pub fn exchange_failed(message: impl Into<String>, cause: Exception) -> Self {
        Exception::new(&classes::EXCHANGE_FAILED, message).with_cause(cause)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> &'static ExceptionClass {
        self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Exception> {
        self.cause.as_deref()
    }

    pub fn suppressed(&self) -> &[Arc<Exception>] {
        &self.suppressed
    }

    pub fn add_suppressed(&mut self, other: Exception) {
        self.suppressed.push(Arc::new(other));
    }

    pub fn is_instance_of(&self, class: &ExceptionClass) -> bool {
        self.class.is_a(class)
    }

    pub fn same_as(&self, other: &Exception) -> bool {
        self.id == other.id
    }

    /// This exception followed by each of its causes, outermost first.
    pub fn chain(&self) -> ExceptionChain<'_> {
        ExceptionChain {
            next: Some(self),
        }
    }

    pub fn root_cause(&self) -> &Exception {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }

    /// Renders the exception, including the cause chain when `with_causes` is set.
    pub fn describe(&self, with_causes: bool) -> String {
        if !with_causes {
            return self.to_string();
        }
        let mut text = self.to_string();
        for cause in self.chain().skip(1) {
            text.push_str("\n\tcaused by: ");
            text.push_str(&cause.to_string());
        }
        for suppressed in &self.suppressed {
            text.push_str("\n\tsuppressed: ");
            text.push_str(&suppressed.to_string());
        }
        text
    }
}

impl PartialEq for Exception {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl From<std::io::Error> for Exception {
    fn from(error: std::io::Error) -> Self {
        Exception::from_error(&classes::IO, &error)
    }
}

impl From<serde_json::Error> for Exception {
    fn from(error: serde_json::Error) -> Self {
        Exception::from_error(&classes::ILLEGAL_ARGUMENT, &error)
    }
}

pub struct ExceptionChain<'a> {
    next: Option<&'a Exception>,
}

impl<'a> Iterator for ExceptionChain<'a> {
    type Item = &'a Exception;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.cause();
        Some(current)
    }
}
