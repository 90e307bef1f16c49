// =============================================================================
// Notifier — outbound event notifications (A4)
// =============================================================================
//
// Concrete delivery (Telegram, webhook, …) is out of scope: just a thin
// trait plus a no-op and a recording implementation for tests.
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

/// One outbound notification event.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyEvent {
    PositionOpened { user: String, symbol: String },
    PositionClosed { user: String, symbol: String, pnl_usdt: f64 },
    Averaged { user: String, symbol: String, step_index: usize },
    FallbackTriggered { user: String, symbol: String, kind: &'static str },
    ReconcileProblem { user: String, symbol: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent);
}

/// Logs the event and discards it. The production default.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, event: NotifyEvent) {
        info!(?event, "notify");
    }
}

/// Records every event in memory; used by tests to assert on what was sent.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: NotifyEvent) {
        self.events.lock().push(event);
    }
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().clone()
    }
}
