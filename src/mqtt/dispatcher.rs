//! Handler table and message dispatch
//!
//! Inbound payloads are JSON objects; every topic can have several handlers
//! bound, identified by name. Dispatch decodes once, then invokes the bound
//! handlers in binding order. A failing handler never stops the fan-out; its
//! failure is returned to the caller for reporting.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::mqtt::policy::{recovery_for, Fault, Recovery};

/// Decoded message payload: a JSON object.
pub type Payload = serde_json::Map<String, Value>;

/// Error type handlers are allowed to return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A named message handler. The name identifies the handler in the table
/// (binding the same name to a topic twice is a no-op) and in log lines.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, topic: &str, payload: &Payload) -> Result<(), HandlerError>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(String, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, topic: &str, payload: &Payload) -> Result<(), HandlerError> {
        (self.f)(topic.to_string(), payload.clone()).await
    }
}

/// Wrap an async closure as a named handler.
///
/// The closure receives owned copies of the topic and the decoded payload, so
/// an `async move` block can consume them directly.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(String, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// Topic-to-handlers bindings. Multiple handlers per topic, invoked in
/// binding order.
#[derive(Default)]
pub struct HandlerTable {
    bindings: Mutex<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
        }
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<dyn MessageHandler>>>> {
        self.bindings.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind a handler to a topic. Binding the same handler name again is a
    /// no-op.
    pub fn bind(&self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let topic = topic.into();
        let mut bindings = self.bindings();
        let handlers = bindings.entry(topic.clone()).or_default();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            debug!(
                "Handler '{}' already bound to {}; ignoring",
                handler.name(),
                topic
            );
            return;
        }
        debug!(
            "Bound handler '{}' to {} ({} bound)",
            handler.name(),
            topic,
            handlers.len() + 1
        );
        handlers.push(handler);
    }

    /// Bind several topics at once.
    pub fn bind_many(
        &self,
        bindings: impl IntoIterator<Item = (String, Vec<Arc<dyn MessageHandler>>)>,
    ) {
        for (topic, handlers) in bindings {
            for handler in handlers {
                self.bind(topic.clone(), handler);
            }
        }
    }

    /// Remove one named handler from a topic, or all of the topic's handlers
    /// when `handler_name` is `None`. Returns how many bindings were removed.
    pub fn unbind(&self, topic: &str, handler_name: Option<&str>) -> usize {
        let mut bindings = self.bindings();
        let Some(handlers) = bindings.get_mut(topic) else {
            return 0;
        };
        let removed = match handler_name {
            Some(name) => {
                let before = handlers.len();
                handlers.retain(|h| h.name() != name);
                before - handlers.len()
            }
            None => {
                let before = handlers.len();
                handlers.clear();
                before
            }
        };
        if handlers.is_empty() {
            bindings.remove(topic);
        }
        removed
    }

    /// Handlers bound to a topic, in binding order.
    pub fn handlers_for(&self, topic: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.bindings().get(topic).cloned().unwrap_or_default()
    }

    /// Topics that currently have at least one handler bound.
    pub fn bound_topics(&self) -> Vec<String> {
        self.bindings().keys().cloned().collect()
    }
}

/// Decode an inbound payload. Empty payloads decode to the empty object;
/// anything that is not a JSON object is an error.
pub fn decode_payload(payload: &[u8]) -> Result<Payload, serde_json::Error> {
    if payload.is_empty() {
        return Ok(Payload::new());
    }
    serde_json::from_slice(payload)
}

/// A handler that returned an error during fan-out.
pub struct HandlerFailure {
    pub handler: String,
    pub error: HandlerError,
}

/// Decode one message and fan it out to every bound handler.
///
/// Malformed payloads and unhandled topics are dropped with a warning.
/// Handler failures are logged and collected; the remaining handlers still
/// run.
pub async fn dispatch_message(
    table: &HandlerTable,
    topic: &str,
    payload: &[u8],
) -> Vec<HandlerFailure> {
    let decoded = match decode_payload(payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            if recovery_for(Fault::PayloadDecode) == Recovery::LogAndContinue {
                warn!("Dropping malformed payload on {topic}: {e}");
            }
            return Vec::new();
        }
    };

    let handlers = table.handlers_for(topic);
    if handlers.is_empty() {
        warn!("Unhandled message topic {topic}");
        return Vec::new();
    }

    let mut failures = Vec::new();
    for handler in handlers {
        debug!("Dispatching {} to handler '{}'", topic, handler.name());
        if let Err(error) = handler.handle(topic, &decoded).await {
            error!("Handler '{}' failed for {}: {}", handler.name(), topic, error);
            failures.push(HandlerFailure {
                handler: handler.name().to_string(),
                error,
            });
        }
    }
    failures
}
