//! Message router — the sole inter-component transport.
//!
//! Components never call each other directly: every request is an
//! [`Envelope`] dispatched through the router, which validates shape,
//! enforces size limits, runs the middleware chain (logging → audit →
//! timeout → error-wrap), resolves the recipient in the component
//! registry, and awaits a single correlated response.
//!
//! Errors never propagate to the caller as `Err`: they come back as
//! synthetic `error` reply envelopes so the dispatch call site stays
//! uniform. Outbound broadcast events ride a separate channel that
//! external subscribers tap via [`MessageRouter::subscribe`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::axis::audit::AuditWriter;
use crate::axis::registry::ComponentRegistry;
use crate::config::RouterConfig;
use crate::ids::{canonical_hash, new_id};
use crate::types::{ErrorKind, Event};

/// Capacity of the outbound event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A typed message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope id.
    pub id: Uuid,
    /// Correlation id propagated into the response.
    pub correlation_id: Uuid,
    /// When the envelope was created.
    pub timestamp: DateTime<Utc>,
    /// Sender component id.
    pub from: String,
    /// Recipient component id.
    pub to: String,
    /// Message type, e.g. `plan.request`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form payload.
    pub payload: serde_json::Value,
    /// Component to send any follow-up to, if not the sender.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Job this message concerns, if any.
    #[serde(default)]
    pub job_id: Option<Uuid>,
}

impl Envelope {
    /// Build a fresh request envelope.
    pub fn request(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let id = new_id();
        Self {
            id,
            correlation_id: id,
            timestamp: Utc::now(),
            from: from.into(),
            to: to.into(),
            kind: kind.into(),
            payload,
            reply_to: None,
            job_id: None,
        }
    }

    /// Attach a job id.
    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Build the success reply to this envelope.
    pub fn reply(&self, payload: serde_json::Value) -> Envelope {
        Envelope {
            id: new_id(),
            correlation_id: self.correlation_id,
            timestamp: Utc::now(),
            from: self.to.clone(),
            to: self.reply_to.clone().unwrap_or_else(|| self.from.clone()),
            kind: format!("{}.reply", self.kind),
            payload,
            reply_to: None,
            job_id: self.job_id,
        }
    }

    /// Build an `error` reply to this envelope.
    pub fn error_reply(&self, kind: ErrorKind, message: impl Into<String>) -> Envelope {
        Envelope {
            id: new_id(),
            correlation_id: self.correlation_id,
            timestamp: Utc::now(),
            from: "router".to_owned(),
            to: self.reply_to.clone().unwrap_or_else(|| self.from.clone()),
            kind: "error".to_owned(),
            payload: serde_json::json!({
                "code": kind.code(),
                "message": message.into(),
            }),
            reply_to: None,
            job_id: self.job_id,
        }
    }

    /// Whether this is a synthetic `error` reply, and its code if so.
    pub fn error_code(&self) -> Option<&str> {
        if self.kind == "error" {
            self.payload.get("code").and_then(|c| c.as_str())
        } else {
            None
        }
    }
}

/// Error a handler may return; the router turns it into an `error` reply.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    /// Machine-readable kind.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl HandlerError {
    /// Build a handler error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Generic handler failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerError, message)
    }
}

/// A registered message recipient.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one envelope, returning the reply payload.
    async fn handle(&self, message: Envelope) -> Result<serde_json::Value, HandlerError>;
}

/// A pre-dispatch middleware stage.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stage name for diagnostics.
    fn name(&self) -> &'static str;

    /// Observe or veto an envelope before it reaches the handler.
    async fn on_dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// Logs every dispatched envelope at debug level.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn on_dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        debug!(
            envelope_id = %envelope.id,
            correlation_id = %envelope.correlation_id,
            from = %envelope.from,
            to = %envelope.to,
            kind = %envelope.kind,
            "dispatching message"
        );
        Ok(())
    }
}

/// Appends every dispatched envelope to the audit sink.
///
/// Only the payload *hash* is recorded; payload bodies never enter the
/// audit chain.
pub struct AuditMiddleware {
    writer: Arc<dyn AuditWriter>,
}

impl AuditMiddleware {
    /// Wrap an audit writer.
    pub fn new(writer: Arc<dyn AuditWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl Middleware for AuditMiddleware {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn on_dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self.writer
            .append(
                &envelope.from,
                &format!("message.{}", envelope.kind),
                &envelope.to,
                serde_json::json!({
                    "envelope_id": envelope.id,
                    "correlation_id": envelope.correlation_id,
                    "payload_hash": canonical_hash(&envelope.payload),
                }),
            )
            .await
            .map_err(|e| HandlerError::internal(format!("audit append failed: {e}")))
    }
}

/// The message router.
pub struct MessageRouter {
    registry: Arc<ComponentRegistry>,
    middleware: Vec<Arc<dyn Middleware>>,
    config: RouterConfig,
    events: broadcast::Sender<Event>,
}

impl MessageRouter {
    /// Build a router over a registry with the default middleware chain
    /// (logging → audit). Timeout and error-wrapping are structural.
    pub fn new(
        registry: Arc<ComponentRegistry>,
        audit: Arc<dyn AuditWriter>,
        config: RouterConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            middleware: vec![
                Arc::new(LoggingMiddleware),
                Arc::new(AuditMiddleware::new(audit)),
            ],
            config,
            events,
        }
    }

    /// Append a custom middleware stage after the defaults.
    pub fn push_middleware(&mut self, stage: Arc<dyn Middleware>) {
        self.middleware.push(stage);
    }

    /// Dispatch an envelope and await its single response.
    ///
    /// Never returns `Err`: failures come back as `error` reply envelopes
    /// with the correlation id preserved. A handler that exceeds the
    /// dispatch timeout is cancelled by drop.
    pub async fn dispatch(&self, envelope: Envelope) -> Envelope {
        let budget = Duration::from_millis(self.config.dispatch_timeout_ms);
        self.dispatch_with_timeout(envelope, budget).await
    }

    /// Dispatch with an explicit handler budget instead of the configured
    /// default. Used by callers whose phase budgets exceed the router's.
    pub async fn dispatch_with_timeout(&self, envelope: Envelope, budget: Duration) -> Envelope {
        // Shape validation.
        if envelope.to.is_empty() || envelope.kind.is_empty() {
            return envelope.error_reply(ErrorKind::NoHandler, "envelope missing recipient or type");
        }

        // Size enforcement on the serialized payload.
        let payload_len = serde_json::to_vec(&envelope.payload)
            .map(|b| b.len())
            .unwrap_or(usize::MAX);
        if payload_len > self.config.max_message_bytes {
            warn!(
                envelope_id = %envelope.id,
                bytes = payload_len,
                limit = self.config.max_message_bytes,
                "rejecting oversized message"
            );
            return envelope.error_reply(
                ErrorKind::MessageTooLarge,
                format!(
                    "payload is {payload_len} bytes, limit {}",
                    self.config.max_message_bytes
                ),
            );
        }
        if payload_len > self.config.warn_message_bytes {
            warn!(
                envelope_id = %envelope.id,
                bytes = payload_len,
                "message exceeds warning threshold"
            );
        }

        // Middleware chain.
        for stage in &self.middleware {
            if let Err(e) = stage.on_dispatch(&envelope).await {
                warn!(stage = stage.name(), error = %e, "middleware rejected message");
                return envelope.error_reply(e.kind, e.message);
            }
        }

        // Recipient lookup.
        let Some(handler) = self.registry.resolve(&envelope.to).await else {
            return envelope.error_reply(
                ErrorKind::NoHandler,
                format!("no component registered as '{}'", envelope.to),
            );
        };

        // Invoke under the budget; elapsing drops the handler future,
        // cancelling it.
        let request = envelope.clone();
        match tokio::time::timeout(budget, handler.handle(request)).await {
            Ok(Ok(payload)) => envelope.reply(payload),
            Ok(Err(e)) => envelope.error_reply(e.kind, e.message),
            Err(_) => envelope.error_reply(
                ErrorKind::Timeout,
                format!("handler '{}' exceeded {}ms", envelope.to, budget.as_millis()),
            ),
        }
    }

    /// Broadcast an outbound event to all subscribers. Best-effort: with
    /// no subscribers the event is dropped.
    pub fn broadcast(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Subscribe to outbound events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}
