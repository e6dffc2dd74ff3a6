pub mod exception;
pub mod keys;
pub mod message;

pub use exception::{Exception, ExceptionClass};
pub use message::{Body, CachedStream, Headers, Message, StreamBody};

use crate::status::ExchangeFlags;
use crate::unit_of_work::UnitOfWork;
use chrono::{DateTime, Utc};
use fnv::{FnvBuildHasher, FnvHasher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

pub type Properties = HashMap<String, Value, FnvBuildHasher>;

/// Whether the caller expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExchangePattern {
    #[default]
    #[serde(alias = "inOnly", alias = "IN_ONLY")]
    InOnly,
    #[serde(alias = "inOut", alias = "IN_OUT")]
    InOut,
}

impl ExchangePattern {
    pub fn is_out_capable(self) -> bool {
        self == ExchangePattern::InOut
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExchangePattern::InOnly => "InOnly",
            ExchangePattern::InOut => "InOut",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "InOnly" | "inOnly" | "IN_ONLY" => Some(ExchangePattern::InOnly),
            "InOut" | "inOut" | "IN_OUT" => Some(ExchangePattern::InOut),
            _ => None,
        }
    }
}

/// The unit of work routed through processors.
///
/// An exchange holds an `in` message, an optional `out` message, an open property bag, the
/// typed routing directives, and a single exception slot. The exception slot is the only
/// error channel between processors: a step signals failure by setting it, and every
/// composite checks it before continuing.
///
/// # Copies
/// - [`Exchange::copy`] keeps the exchange id and drops the unit of work.
/// - [`Exchange::correlated_copy`] gets a fresh id, records the parent id under
///   [`keys::CORRELATION_ID`], and shares the unit of work only when asked.
///
/// # Examples
/// ```rust
/// use idemio_route::exchange::{Exchange, ExchangePattern};
///
/// let mut exchange = Exchange::builder()
///     .pattern(ExchangePattern::InOut)
///     .body("order-1")
///     .header("priority", 3)
///     .build();
///
/// exchange.out_mut().set_body("accepted");
/// exchange.prepare_for_next_step();
/// assert_eq!(exchange.in_message().body().as_text().unwrap(), "accepted");
/// assert!(!exchange.has_out());
/// ```
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    created: DateTime<Utc>,
    in_message: Message,
    out_message: Option<Message>,
    properties: Properties,
    flags: ExchangeFlags,
    error_handler_handled: Option<bool>,
    exception: Option<Exception>,
    caught_exception: Option<Exception>,
    unit_of_work: Option<Arc<UnitOfWork>>,
    from_route_id: Option<String>,
    attachments: Attachments,
}

impl Default for Exchange {
    fn default() -> Self {
        Exchange::new(ExchangePattern::InOnly)
    }
}

impl Exchange {
    pub fn new(pattern: ExchangePattern) -> Self {
        Self::new_with_id(Uuid::new_v4().to_string(), pattern)
    }

    pub fn new_with_id(id: impl Into<String>, pattern: ExchangePattern) -> Self {
        Self {
            id: id.into(),
            pattern,
            created: Utc::now(),
            in_message: Message::new(),
            out_message: None,
            properties: HashMap::with_hasher(FnvBuildHasher::default()),
            flags: ExchangeFlags::NONE,
            error_handler_handled: None,
            exception: None,
            caught_exception: None,
            unit_of_work: None,
            from_route_id: None,
            attachments: Attachments::new(),
        }
    }

    pub fn with_body(body: impl Into<Body>) -> Self {
        let mut exchange = Exchange::default();
        exchange.in_message.set_body(body);
        exchange
    }

    pub fn builder() -> ExchangeBuilder {
        ExchangeBuilder::new()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    // messages

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn set_in(&mut self, message: Message) {
        self.in_message = message;
    }

    pub fn has_out(&self) -> bool {
        self.out_message.is_some()
    }

    pub fn out(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    /// The `out` message, created empty when absent.
    pub fn out_mut(&mut self) -> &mut Message {
        self.out_message.get_or_insert_with(Message::new)
    }

    pub fn set_out(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    pub fn take_out(&mut self) -> Option<Message> {
        self.out_message.take()
    }

    pub fn clear_out(&mut self) {
        self.out_message = None;
    }

    /// The current result message: `out` if one was produced, otherwise `in`.
    pub fn message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    pub fn message_mut(&mut self) -> &mut Message {
        match self.out_message {
            Some(ref mut out) => out,
            None => &mut self.in_message,
        }
    }

    /// Moves a produced `out` message into `in` so the next step reads it.
    pub fn prepare_for_next_step(&mut self) {
        if let Some(out) = self.out_message.take() {
            self.in_message = out;
        }
    }

    // exception slot

    pub fn exception(&self) -> Option<&Exception> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, exception: impl Into<Exception>) {
        self.exception = Some(exception.into());
    }

    pub fn take_exception(&mut self) -> Option<Exception> {
        self.exception.take()
    }

    pub fn clear_exception(&mut self) {
        self.exception = None;
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    pub fn caught_exception(&self) -> Option<&Exception> {
        self.caught_exception.as_ref()
    }

    pub fn set_caught_exception(&mut self, exception: Option<Exception>) {
        self.caught_exception = exception;
    }

    // directives

    pub fn flags(&self) -> ExchangeFlags {
        self.flags
    }

    pub fn is_rollback_only(&self) -> bool {
        self.flags.is_rollback()
    }

    pub fn set_rollback_only(&mut self, value: bool) {
        self.flags.set(ExchangeFlags::ROLLBACK_ONLY, value);
    }

    pub fn set_rollback_only_last(&mut self, value: bool) {
        self.flags.set(ExchangeFlags::ROLLBACK_ONLY_LAST, value);
    }

    pub fn is_route_stop(&self) -> bool {
        self.flags.any_flags(ExchangeFlags::ROUTE_STOP)
    }

    pub fn set_route_stop(&mut self, value: bool) {
        self.flags.set(ExchangeFlags::ROUTE_STOP, value);
    }

    pub fn is_redelivery_exhausted(&self) -> bool {
        self.flags.any_flags(ExchangeFlags::REDELIVERY_EXHAUSTED)
    }

    pub fn set_redelivery_exhausted(&mut self, value: bool) {
        self.flags.set(ExchangeFlags::REDELIVERY_EXHAUSTED, value);
    }

    pub fn is_failure_handled(&self) -> bool {
        self.flags.any_flags(ExchangeFlags::FAILURE_HANDLED)
    }

    pub fn set_failure_handled(&mut self, value: bool) {
        self.flags.set(ExchangeFlags::FAILURE_HANDLED, value);
    }

    pub fn is_transacted(&self) -> bool {
        self.flags.any_flags(ExchangeFlags::TRANSACTED)
    }

    pub fn set_transacted(&mut self, value: bool) {
        self.flags.set(ExchangeFlags::TRANSACTED, value);
    }

    /// True when work for this exchange must stay on the calling task.
    pub fn requires_synchronous(&self) -> bool {
        self.flags.requires_synchronous()
    }

    pub fn set_synchronous(&mut self, value: bool) {
        self.flags.set(ExchangeFlags::SYNCHRONOUS, value);
    }

    pub fn error_handler_handled(&self) -> Option<bool> {
        self.error_handler_handled
    }

    pub fn set_error_handler_handled(&mut self, value: Option<bool>) {
        self.error_handler_handled = value;
    }

    pub fn is_error_handler_handled(&self) -> bool {
        self.error_handler_handled == Some(true)
    }

    // properties

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Reads a property by name. Well-known control keys are answered from the typed state.
    pub fn property(&self, key: &str) -> Option<Value> {
        match key {
            keys::ROLLBACK_ONLY => Some(Value::Bool(
                self.flags.any_flags(ExchangeFlags::ROLLBACK_ONLY),
            )),
            keys::ROLLBACK_ONLY_LAST => Some(Value::Bool(
                self.flags.any_flags(ExchangeFlags::ROLLBACK_ONLY_LAST),
            )),
            keys::ROUTE_STOP => Some(Value::Bool(self.is_route_stop())),
            keys::REDELIVERY_EXHAUSTED => Some(Value::Bool(self.is_redelivery_exhausted())),
            keys::FAILURE_HANDLED => Some(Value::Bool(self.is_failure_handled())),
            keys::TRANSACTED => Some(Value::Bool(self.is_transacted())),
            keys::ERRORHANDLER_HANDLED => self.error_handler_handled.map(Value::Bool),
            keys::EXCEPTION_CAUGHT => self
                .caught_exception
                .as_ref()
                .map(|e| Value::String(e.to_string())),
            keys::EXCHANGE_PATTERN => Some(Value::String(self.pattern.as_str().to_string())),
            _ => self.properties.get(key).cloned(),
        }
    }

    pub fn property_str(&self, key: &str) -> Option<String> {
        self.property(key)
            .and_then(|value| value.as_str().map(str::to_string))
    }

    pub fn property_i64(&self, key: &str) -> Option<i64> {
        self.property(key).and_then(|value| value.as_i64())
    }

    pub fn property_bool(&self, key: &str) -> bool {
        self.property(key)
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    /// Writes a property by name. Well-known control keys update the typed state.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        let truthy = value.as_bool().unwrap_or(false);
        match key.as_str() {
            keys::ROLLBACK_ONLY => self.set_rollback_only(truthy),
            keys::ROLLBACK_ONLY_LAST => self.set_rollback_only_last(truthy),
            keys::ROUTE_STOP => self.set_route_stop(truthy),
            keys::REDELIVERY_EXHAUSTED => self.set_redelivery_exhausted(truthy),
            keys::FAILURE_HANDLED => self.set_failure_handled(truthy),
            keys::TRANSACTED => self.set_transacted(truthy),
            keys::ERRORHANDLER_HANDLED => self.error_handler_handled = value.as_bool(),
            keys::EXCEPTION_CAUGHT => {
                self.caught_exception = value.as_str().map(|message| {
                    Exception::new(&exception::classes::EXCEPTION, message.to_string())
                })
            }
            keys::EXCHANGE_PATTERN => {
                if let Some(pattern) = value.as_str().and_then(ExchangePattern::parse) {
                    self.pattern = pattern;
                }
            }
            _ => {
                self.properties.insert(key, value);
            }
        }
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        match key {
            keys::ROLLBACK_ONLY
            | keys::ROLLBACK_ONLY_LAST
            | keys::ROUTE_STOP
            | keys::REDELIVERY_EXHAUSTED
            | keys::FAILURE_HANDLED
            | keys::TRANSACTED
            | keys::ERRORHANDLER_HANDLED
            | keys::EXCEPTION_CAUGHT => {
                let previous = self.property(key);
                self.set_property(key, Value::Null);
                previous
            }
            _ => self.properties.remove(key),
        }
    }

    // context

    pub fn unit_of_work(&self) -> Option<&Arc<UnitOfWork>> {
        self.unit_of_work.as_ref()
    }

    pub fn set_unit_of_work(&mut self, unit_of_work: Option<Arc<UnitOfWork>>) {
        self.unit_of_work = unit_of_work;
    }

    pub fn from_route_id(&self) -> Option<&str> {
        self.from_route_id.as_deref()
    }

    pub fn set_from_route_id(&mut self, route_id: impl Into<String>) {
        self.from_route_id = Some(route_id.into());
    }

    /// The route currently processing this exchange, falling back to the route it entered.
    pub fn current_route_id(&self) -> Option<String> {
        self.unit_of_work
            .as_ref()
            .and_then(|uow| uow.current_route())
            .or_else(|| self.from_route_id.clone())
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut Attachments {
        &mut self.attachments
    }

    // copies

    /// A full copy keeping the exchange id. The copy has no unit of work.
    pub fn copy(&self) -> Exchange {
        Exchange {
            id: self.id.clone(),
            pattern: self.pattern,
            created: self.created,
            in_message: self.in_message.clone(),
            out_message: self.out_message.clone(),
            properties: self.properties.clone(),
            flags: self.flags,
            error_handler_handled: self.error_handler_handled,
            exception: self.exception.clone(),
            caught_exception: self.caught_exception.clone(),
            unit_of_work: None,
            from_route_id: self.from_route_id.clone(),
            attachments: self.attachments.clone(),
        }
    }

    /// A copy with a fresh id correlated to this exchange. The unit of work is shared only
    /// when `share_unit_of_work` is set.
    pub fn correlated_copy(&self, share_unit_of_work: bool) -> Exchange {
        let mut copy = self.copy();
        copy.id = Uuid::new_v4().to_string();
        copy.created = Utc::now();
        copy.properties
            .insert(keys::CORRELATION_ID.to_string(), Value::String(self.id.clone()));
        if share_unit_of_work {
            copy.unit_of_work = self.unit_of_work.clone();
        }
        copy
    }

    /// Copies the outcome of `source` onto this exchange: messages, properties, directives,
    /// and exceptions. The unit of work and thread-affinity flags of `self` are kept.
    pub fn copy_results_from(&mut self, source: &Exchange) {
        self.in_message = source.in_message.clone();
        self.out_message = source.out_message.clone();
        for (key, value) in &source.properties {
            self.properties.insert(key.clone(), value.clone());
        }
        let affinity = self.flags & (ExchangeFlags::TRANSACTED | ExchangeFlags::SYNCHRONOUS);
        self.flags = (source.flags & !(ExchangeFlags::TRANSACTED | ExchangeFlags::SYNCHRONOUS))
            | affinity;
        self.error_handler_handled = source.error_handler_handled;
        self.exception = source.exception.clone();
        self.caught_exception = source.caught_exception.clone();
        self.attachments.merge_from(&source.attachments);
    }
}

impl Debug for Exchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("flags", &self.flags)
            .field("error_handler_handled", &self.error_handler_handled)
            .field("exception", &self.exception)
            .field("in", &self.in_message)
            .field("out", &self.out_message)
            .finish()
    }
}

/// Builder for exchanges with an initial message, pattern, and properties.
pub struct ExchangeBuilder {
    id: Option<String>,
    pattern: ExchangePattern,
    message: Message,
    properties: Vec<(String, Value)>,
    transacted: bool,
}

impl ExchangeBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            pattern: ExchangePattern::InOnly,
            message: Message::new(),
            properties: Vec::new(),
            transacted: false,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.message.set_body(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.message.set_header(name, value);
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    pub fn transacted(mut self, transacted: bool) -> Self {
        self.transacted = transacted;
        self
    }

    pub fn build(self) -> Exchange {
        let mut exchange = match self.id {
            Some(id) => Exchange::new_with_id(id, self.pattern),
            None => Exchange::new(self.pattern),
        };
        exchange.in_message = self.message;
        exchange.set_transacted(self.transacted);
        for (name, value) in self.properties {
            exchange.set_property(name, value);
        }
        exchange
    }
}

impl Default for ExchangeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

trait AttachmentValue: Any + Send + Sync {
    fn clone_value(&self) -> Box<dyn AttachmentValue>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> AttachmentValue for T
where
    T: Any + Send + Sync + Clone,
{
    fn clone_value(&self) -> Box<dyn AttachmentValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Typed extension storage keyed by name and type.
///
/// Values must be `Clone` so that exchange copies get their own attachments.
///
/// # Examples
/// ```rust
/// use idemio_route::exchange::Attachments;
///
/// let mut attachments = Attachments::new();
/// attachments.add("tenant", "acme".to_string());
/// attachments.add("tenant", 42u32);
///
/// assert_eq!(attachments.get::<String>("tenant").map(String::as_str), Some("acme"));
/// assert_eq!(attachments.get::<u32>("tenant"), Some(&42));
/// assert!(attachments.get::<u64>("tenant").is_none());
/// ```
pub struct Attachments {
    attachments: HashMap<AttachmentKey, Box<dyn AttachmentValue>, FnvBuildHasher>,
}

impl Attachments {
    pub fn new() -> Self {
        Self {
            attachments: HashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    pub fn add<K>(&mut self, key: impl AsRef<str>, value: K)
    where
        K: Any + Send + Sync + Clone,
    {
        let type_id = TypeId::of::<K>();
        self.attachments
            .insert(AttachmentKey::new(key, type_id), Box::new(value));
    }

    pub fn get<K>(&self, key: impl AsRef<str>) -> Option<&K>
    where
        K: Any + Send + Sync + Clone,
    {
        let type_id = TypeId::of::<K>();
        self.attachments
            .get(&AttachmentKey::new(key, type_id))
            .and_then(|value| (**value).as_any().downcast_ref::<K>())
    }

    pub fn get_mut<K>(&mut self, key: impl AsRef<str>) -> Option<&mut K>
    where
        K: Any + Send + Sync + Clone,
    {
        let type_id = TypeId::of::<K>();
        self.attachments
            .get_mut(&AttachmentKey::new(key, type_id))
            .and_then(|value| (**value).as_any_mut().downcast_mut::<K>())
    }

    /// Returns the value for `key`, inserting `K::default()` first when absent.
    pub fn get_or_default<K>(&mut self, key: impl AsRef<str>) -> &mut K
    where
        K: Any + Send + Sync + Clone + Default,
    {
        let type_id = TypeId::of::<K>();
        let entry = self
            .attachments
            .entry(AttachmentKey::new(key, type_id))
            .or_insert_with(|| Box::new(K::default()));
        match (**entry).as_any_mut().downcast_mut::<K>() {
            Some(value) => value,
            None => unreachable!("attachment key includes the type id"),
        }
    }

    pub fn remove<K>(&mut self, key: impl AsRef<str>) -> Option<K>
    where
        K: Any + Send + Sync + Clone,
    {
        let type_id = TypeId::of::<K>();
        self.attachments
            .remove(&AttachmentKey::new(key, type_id))
            .and_then(|value| (*value).as_any().downcast_ref::<K>().cloned())
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    pub fn merge_from(&mut self, other: &Attachments) {
        for (key, value) in &other.attachments {
            self.attachments.insert(*key, (**value).clone_value());
        }
    }
}

impl Default for Attachments {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Attachments {
    fn clone(&self) -> Self {
        let mut copy = Attachments::new();
        copy.merge_from(self);
        copy
    }
}

#[derive(PartialOrd, PartialEq, Hash, Eq, Clone, Copy, Debug)]
pub struct AttachmentKey {
    key_hash: u64,
    type_hash: u64,
}

impl AttachmentKey {
    pub fn new(key: impl AsRef<str>, type_id: TypeId) -> Self {
        let key = key.as_ref();
        let mut key_hasher = FnvHasher::default();
        key.hash(&mut key_hasher);
        let key_hash = key_hasher.finish();

        let mut type_hasher = FnvHasher::default();
        type_id.hash(&mut type_hasher);
        let type_hash = type_hasher.finish();

        Self {
            key_hash,
            type_hash,
        }
    }
}
