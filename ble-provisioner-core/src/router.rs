//! Turns the connection-event bus into connect resolutions and
//! unexpected-disconnect signals.
//!
//! Each connect attempt owns one bus receiver for its whole life. [`race`]
//! borrows it; on `Connected` the same receiver moves into the disconnect
//! monitor, so an event queued right behind `Connected` is still seen. On any
//! other outcome the caller drops it. Disarming the monitor aborts its task.

use crate::traits::{ConnectionEvent, ConnectionEventKind};
use std::future::Future;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Connected,
    /// Disconnected / ConnectFailed event, or the bus went away.
    Failed(Option<ConnectionEventKind>),
    TimedOut,
    /// The session was torn down while the connect was pending.
    Cancelled,
}

/// Waits for the first event for `device_name` that settles a pending connect.
pub(crate) async fn next_resolution(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    device_name: &str,
) -> Resolution {
    loop {
        match events.recv().await {
            Ok(event) if event.device_name != device_name => {
                tracing::debug!(
                    expected = %device_name,
                    actual = %event.device_name,
                    "ignoring connection event for another device"
                );
            }
            Ok(event) => {
                tracing::debug!(device = %device_name, kind = ?event.kind, "connection event");
                return match event.kind {
                    ConnectionEventKind::Connected => Resolution::Connected,
                    kind => Resolution::Failed(Some(kind)),
                };
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "connection event bus lagged");
            }
            Err(RecvError::Closed) => return Resolution::Failed(None),
        }
    }
}

/// Races the bus against `deadline` and a cancel signal. Events after the
/// winning one stay queued in `events`.
pub(crate) async fn race(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    device_name: &str,
    deadline: Instant,
    cancelled: oneshot::Receiver<()>,
) -> Resolution {
    tokio::select! {
        biased;
        _ = cancelled => Resolution::Cancelled,
        resolution = next_resolution(events, device_name) => resolution,
        _ = sleep_until(deadline) => Resolution::TimedOut,
    }
}

/// Resolves on a `Disconnected` for `device_name`. Returns `false` if the bus
/// closed first.
pub(crate) async fn wait_for_disconnect(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    device_name: &str,
) -> bool {
    loop {
        match events.recv().await {
            Ok(event)
                if event.device_name == device_name
                    && event.kind == ConnectionEventKind::Disconnected =>
            {
                return true;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "connection event bus lagged while monitoring");
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

/// Unexpected-disconnect subscription for one established session.
pub(crate) struct DisconnectMonitor {
    session_id: u64,
    task: JoinHandle<()>,
}

impl DisconnectMonitor {
    /// `on_disconnect` only runs if the device drops while the monitor is armed.
    pub(crate) fn arm<F>(
        session_id: u64,
        device_name: String,
        events: broadcast::Receiver<ConnectionEvent>,
        on_disconnect: F,
    ) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut events = events;
            if wait_for_disconnect(&mut events, &device_name).await {
                drop(events);
                tracing::info!(device = %device_name, "device disconnected unexpectedly");
                on_disconnect.await;
            } else {
                tracing::debug!(device = %device_name, "event bus closed, monitor stopped");
            }
        });
        Self { session_id, task }
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Stops monitoring. Events published afterwards are never seen.
    pub(crate) fn disarm(self) {
        self.task.abort();
    }
}
