use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

use crate::error::SessionError;
use crate::events::SessionEvent;

/// Installs the global subscriber with millisecond local timestamps.
/// Later calls are no-ops.
pub fn init(enabled: bool) {
    if !enabled {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("movecall=debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_target(true)
        .try_init();
}

/// Publishes session events to the UI side of the channel.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Emitter whose receiver is returned alongside it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: SessionEvent) {
        debug!(?event, "emit");
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped, event discarded");
        }
    }

    pub fn emit_connected(&self) {
        info!("Connection established");
        self.emit(SessionEvent::Connected);
    }

    pub fn emit_disconnected(&self) {
        info!("Connection closed");
        self.emit(SessionEvent::Disconnected);
    }

    pub fn emit_connection_problem(&self) {
        warn!("Connection issues detected");
        self.emit(SessionEvent::ConnectionProblem);
    }

    pub fn emit_connection_recovering(&self, attempt: u32, max_attempts: u32) {
        info!(attempt, max_attempts, "Connection is recovering");
        self.emit(SessionEvent::Recovering {
            attempt,
            max_attempts,
        });
    }

    pub fn emit_connection_recovered(&self) {
        info!("Connection recovered");
        self.emit(SessionEvent::Recovered);
    }

    pub fn emit_connection_failed(&self, error: &SessionError) {
        warn!(reason = ?error.reason_code(), "Connection failed: {}", error);
        self.emit(SessionEvent::ConnectionFailed {
            reason: error.reason_code(),
            message: error.to_string(),
        });
    }

    /// Non-fatal problem; the call carries on.
    pub fn emit_warning(&self, error: &SessionError) {
        warn!(reason = ?error.reason_code(), "{}", error);
        self.emit(SessionEvent::Warning {
            reason: error.reason_code(),
            message: error.to_string(),
        });
    }
}
