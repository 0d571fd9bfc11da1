//! Pluggable event listener hook: the crate's own diagnostic channel,
//! distinct from the internal `log` crate calls used for operator-facing
//! messages (see DESIGN.md).

use crate::config::{IndexId, TxnId};

/// A notable, structured occurrence a caller may want to react to (metrics,
/// tracing spans, audit logs) without the core depending on any particular
/// backend.
#[derive(Debug, Clone)]
pub enum Event {
    TransactionCommitted { txn_id: TxnId },
    TransactionRolledBack { txn_id: TxnId },
    IndexCreated { index_id: IndexId, name: Option<String> },
    IndexDropped { index_id: IndexId },
    CheckpointBegin,
    CheckpointComplete { pages_flushed: usize },
    DeadlockDetected { txn_id: TxnId },
    LockTimeout { txn_id: TxnId },
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// The default listener: drops every event.
pub struct NoopEventListener;

impl EventListener for NoopEventListener {
    fn on_event(&self, _event: &Event) {}
}

/// Forwards every event to the `log` crate at `debug` level, useful during
/// development without wiring up a real listener.
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &Event) {
        log::debug!("event: {:?}", event);
    }
}
