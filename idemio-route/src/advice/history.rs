use crate::advice::Advice;
use crate::exchange::{Exception, Exchange, keys};
use crate::spi::{Clock, SYSTEM_CLOCK};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// One visited node in an exchange's message history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageHistory {
    pub route_id: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    /// Time spent in the node, set once the node is done.
    pub elapsed_ms: Option<u64>,
}

impl MessageHistory {
    /// The history recorded on `exchange`, oldest first.
    pub fn of(exchange: &Exchange) -> &[MessageHistory] {
        exchange
            .attachments()
            .get::<Vec<MessageHistory>>(keys::MESSAGE_HISTORY)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn to_json(exchange: &Exchange) -> Result<String, Exception> {
        Ok(serde_json::to_string(Self::of(exchange))?)
    }
}

/// Appends a [`MessageHistory`] record when the node is entered and closes it when left.
pub struct MessageHistoryAdvice {
    route_id: Option<String>,
    node_id: String,
    clock: Arc<dyn Clock>,
}

impl MessageHistoryAdvice {
    pub fn new(route_id: Option<String>, node_id: impl Into<String>) -> Self {
        Self {
            route_id,
            node_id: node_id.into(),
            clock: SYSTEM_CLOCK.clone(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl Advice for MessageHistoryAdvice {
    type State = (usize, DateTime<Utc>);

    async fn before(&self, exchange: &mut Exchange) -> Result<Self::State, Exception> {
        let timestamp = self.clock.now();
        let history = exchange
            .attachments_mut()
            .get_or_default::<Vec<MessageHistory>>(keys::MESSAGE_HISTORY);
        history.push(MessageHistory {
            route_id: self.route_id.clone(),
            node_id: self.node_id.clone(),
            timestamp,
            elapsed_ms: None,
        });
        Ok((history.len() - 1, timestamp))
    }

    async fn after(&self, exchange: &mut Exchange, (index, started): Self::State) {
        let elapsed = self.clock.elapsed_since(started);
        if let Some(record) = exchange
            .attachments_mut()
            .get_mut::<Vec<MessageHistory>>(keys::MESSAGE_HISTORY)
            .and_then(|history| history.get_mut(index))
        {
            record.elapsed_ms = Some(elapsed.as_millis() as u64);
        }
    }

    fn name(&self) -> &str {
        "message-history"
    }
}
