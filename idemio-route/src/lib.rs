pub mod advice;
pub mod channel;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod errorhandler;
pub mod exchange;
pub mod expression;
pub mod logger;
pub mod processor;
pub mod route;
pub mod spi;
pub mod status;
pub mod unit_of_work;

#[cfg(test)]
pub(crate) mod test_support;

pub use exchange::{Exception, Exchange, ExchangePattern};
pub use processor::{Processor, SharedProcessor};
pub use status::Completion;
