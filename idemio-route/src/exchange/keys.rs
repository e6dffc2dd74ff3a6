//! Well-known property and header names.
//!
//! The flag-backed properties (`ROLLBACK_ONLY`, `ROUTE_STOP`, ...) are views over the typed
//! [`ExchangeFlags`](crate::status::ExchangeFlags); reading or writing them by name through
//! `Exchange::property` / `Exchange::set_property` updates the typed state.

// flag-backed properties
pub const ROLLBACK_ONLY: &str = "RollbackOnly";
pub const ROLLBACK_ONLY_LAST: &str = "RollbackOnlyLast";
pub const ROUTE_STOP: &str = "RouteStop";
pub const REDELIVERY_EXHAUSTED: &str = "RedeliveryExhausted";
pub const FAILURE_HANDLED: &str = "FailureHandled";
pub const TRANSACTED: &str = "Transacted";
pub const ERRORHANDLER_HANDLED: &str = "ErrorHandlerHandled";
pub const EXCEPTION_CAUGHT: &str = "ExceptionCaught";
pub const EXCHANGE_PATTERN: &str = "ExchangePattern";

// breadcrumbs
pub const TO_ENDPOINT: &str = "ToEndpoint";
pub const FAILURE_ENDPOINT: &str = "FailureEndpoint";
pub const FAILURE_ROUTE_ID: &str = "FailureRouteId";
pub const SLIP_ENDPOINT: &str = "SlipEndpoint";
pub const RECIPIENT_LIST_ENDPOINT: &str = "RecipientListEndpoint";
pub const CORRELATION_ID: &str = "CorrelationId";

// composite processors
pub const MULTICAST_INDEX: &str = "MulticastIndex";
pub const MULTICAST_COMPLETE: &str = "MulticastComplete";
pub const SPLIT_INDEX: &str = "SplitIndex";
pub const SPLIT_SIZE: &str = "SplitSize";
pub const SPLIT_COMPLETE: &str = "SplitComplete";
pub const LOOP_INDEX: &str = "LoopIndex";
pub const LOOP_SIZE: &str = "LoopSize";
pub const FILTER_MATCHED: &str = "FilterMatched";
pub const BATCH_INDEX: &str = "BatchIndex";
pub const BATCH_SIZE: &str = "BatchSize";
pub const BATCH_COMPLETE: &str = "BatchComplete";
pub const AGGREGATED_SIZE: &str = "AggregatedSize";
pub const AGGREGATED_COMPLETED_BY: &str = "AggregatedCompletedBy";
pub const AGGREGATED_CORRELATION_KEY: &str = "AggregatedCorrelationKey";

// attachments
pub const MESSAGE_HISTORY: &str = "MessageHistory";
pub const FATAL_FALLBACK_ERROR_HANDLER: &str = "FatalFallbackErrorHandler";

// redelivery headers
pub const REDELIVERED: &str = "Redelivered";
pub const REDELIVERY_COUNTER: &str = "RedeliveryCounter";
pub const REDELIVERY_MAX_COUNTER: &str = "RedeliveryMaxCounter";
