use crate::exchange::{Exception, Exchange};
use crate::processor::{Processor, hop};
use crate::status::Completion;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

pub(crate) fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Counts invocations and leaves the exchange untouched.
pub(crate) struct CountingProcessor {
    name: String,
    count: AtomicUsize,
}

impl CountingProcessor {
    pub(crate) fn shared(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            count: AtomicUsize::new(0),
        })
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for CountingProcessor {
    async fn process(&self, _exchange: &mut Exchange) -> Completion {
        self.count.fetch_add(1, Ordering::SeqCst);
        Completion::Sync
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fails every invocation, or only the first `failures` invocations when limited.
pub(crate) struct FailingProcessor {
    name: String,
    message: String,
    failures: Option<usize>,
    count: AtomicUsize,
}

impl FailingProcessor {
    pub(crate) fn shared(name: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            message: message.to_string(),
            failures: None,
            count: AtomicUsize::new(0),
        })
    }

    pub(crate) fn failing_times(name: &str, message: &str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            message: message.to_string(),
            failures: Some(failures),
            count: AtomicUsize::new(0),
        })
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for FailingProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let attempt = self.count.fetch_add(1, Ordering::SeqCst);
        let fail = self.failures.map(|limit| attempt < limit).unwrap_or(true);
        if fail {
            exchange.set_exception(Exception::illegal_state(self.message.clone()));
        }
        Completion::Sync
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Records its name in a shared log, setting the `out` body to its name.
pub(crate) struct RecordingProcessor {
    name: String,
    log: CallLog,
}

impl RecordingProcessor {
    pub(crate) fn shared(name: &str, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
        })
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        self.log.lock().unwrap().push(self.name.clone());
        exchange.out_mut().set_body(self.name.clone());
        Completion::Sync
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Records its name from a spawned task, so it always completes asynchronously.
pub(crate) struct HoppingProcessor {
    name: String,
    log: CallLog,
}

impl HoppingProcessor {
    pub(crate) fn shared(name: &str, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
        })
    }
}

#[async_trait]
impl Processor for HoppingProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Completion {
        let log = self.log.clone();
        let name = self.name.clone();
        hop(exchange, move |owned| async move {
            tokio::task::yield_now().await;
            log.lock().unwrap().push(name);
            owned
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
