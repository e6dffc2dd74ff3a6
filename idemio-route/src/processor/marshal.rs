use crate::exchange::{Body, Exception, Exchange, Message};
use crate::processor::Processor;
use crate::spi::DataFormat;
use crate::status::Completion;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Marshal,
    Unmarshal,
}

/// Converts the body with a [`DataFormat`]. The converted body is set on a copy of the `in`
/// message as the `out` message, so the next step sees it while the headers travel along.
pub struct Marshal {
    id: String,
    format: Arc<dyn DataFormat>,
    direction: Direction,
}

/// The reverse of [`Marshal`].
pub struct Unmarshal(Marshal);

impl Marshal {
    pub fn new(id: impl Into<String>, format: Arc<dyn DataFormat>) -> Self {
        Self {
            id: id.into(),
            format,
            direction: Direction::Marshal,
        }
    }

    fn convert(&self, exchange: &mut Exchange) {
        let mut out = exchange.in_message().clone();
        let body = out.take_body();
        let converted = match self.direction {
            Direction::Marshal => self.format.marshal(exchange, body),
            Direction::Unmarshal => self.format.unmarshal(exchange, body),
        };
        match converted {
            Ok(body) => {
                out.set_body(body);
                exchange.set_out(out);
            }
            Err(exception) => {
                log::debug!(
                    "{} failed to {:?} body of exchange {}: {}",
                    self.id,
                    self.direction,
                    exchange.id(),
                    exception
                );
                exchange.set_exception(exception);
            }
        }
    }
}

impl Unmarshal {
    pub fn new(id: impl Into<String>, format: Arc<dyn DataFormat>) -> Self {
        Self(Marshal {
            id: id.into(),
            format,
            direction: Direction::Unmarshal,
        })
    }
}

#[async_trait]
impl Processor for Marshal {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        self.convert(exchange);
        Completion::Sync
    }

    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Processor for Unmarshal {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        self.0.convert(exchange);
        Completion::Sync
    }

    fn name(&self) -> &str {
        &self.0.id
    }
}

fn body_bytes(body: Body) -> Result<Vec<u8>, Exception> {
    Message::with_body(body).read_body_bytes()
}

/// JSON data format backed by `serde_json`.
///
/// Marshalling writes the body's JSON view as bytes; unmarshalling parses bytes or text into a
/// JSON body.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDataFormat {
    pretty: bool,
}

impl JsonDataFormat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }
}

impl DataFormat for JsonDataFormat {
    fn marshal(&self, _exchange: &Exchange, body: Body) -> Result<Body, Exception> {
        let value = match body {
            Body::Stream(_) | Body::Cached(_) => {
                let bytes = body_bytes(body)?;
                serde_json::from_slice::<Value>(&bytes)?
            }
            other => other.to_json(),
        };
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(&value)?
        } else {
            serde_json::to_vec(&value)?
        };
        Ok(Body::Bytes(bytes))
    }

    fn unmarshal(&self, _exchange: &Exchange, body: Body) -> Result<Body, Exception> {
        if let Body::Json(value) = body {
            return Ok(Body::Json(value));
        }
        let bytes = body_bytes(body)?;
        if bytes.is_empty() {
            return Ok(Body::Empty);
        }
        let value: Value = serde_json::from_slice(&bytes)?;
        Ok(Body::Json(value))
    }
}
