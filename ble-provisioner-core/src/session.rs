use crate::traits::SecureChannel;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Lifecycle of one connection attempt.
///
/// ```text
/// Idle -> Connecting -> Connected -> SessionEstablished <-> (WifiScanning | Provisioning)
///             |             |                 |
///             +-> TimedOut  +-> Failed        +-> Disconnected
///             +-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Connecting,
    /// Link is up, secure session not initialised yet.
    Connected,
    SessionEstablished,
    WifiScanning,
    Provisioning,
    Disconnected,
    TimedOut,
    Failed,
}

impl SessionState {
    pub fn is_pending(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }

    /// States in which the device handle may be used.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::SessionEstablished | SessionState::WifiScanning | SessionState::Provisioning
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Disconnected | SessionState::TimedOut | SessionState::Failed
        )
    }
}

/// The single in-flight or established device connection.
pub(crate) struct ConnectionSession {
    id: u64,
    target: String,
    state: SessionState,
    deadline: Instant,
    // None until the transport hands back the link.
    channel: Option<Arc<dyn SecureChannel>>,
    // Dropped on the way to a terminal state, which wakes a pending connect.
    cancel: Option<oneshot::Sender<()>>,
}

impl ConnectionSession {
    pub(crate) fn new(id: u64, target: String, deadline: Instant, cancel: oneshot::Sender<()>) -> Self {
        Self {
            id,
            target,
            state: SessionState::Connecting,
            deadline,
            channel: None,
            cancel: Some(cancel),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn channel(&self) -> Option<&Arc<dyn SecureChannel>> {
        self.channel.as_ref()
    }

    pub(crate) fn attach(&mut self, channel: Arc<dyn SecureChannel>) {
        self.channel = Some(channel);
    }

    /// Terminal states are sticky; a finished session is never revived.
    pub(crate) fn transition(&mut self, next: SessionState) {
        if self.state.is_terminal() {
            tracing::warn!(
                device = %self.target,
                from = ?self.state,
                to = ?next,
                "ignoring transition out of a terminal session state"
            );
            return;
        }
        tracing::debug!(device = %self.target, from = ?self.state, to = ?next, "session state");
        self.state = next;
        if next.is_terminal() {
            self.cancel.take();
        }
    }

    /// Moves to `final_state` and hands back the link for the caller to
    /// release once the session lock is dropped. A finished session, or one
    /// whose link never came back from the transport, yields `None`.
    pub(crate) fn finish(&mut self, final_state: SessionState) -> Option<Arc<dyn SecureChannel>> {
        if self.state.is_terminal() {
            return None;
        }
        self.transition(final_state);
        self.channel.clone()
    }

    /// The handle, if the session is live and it really is `device_name`'s.
    pub(crate) fn live_channel(&self, device_name: &str) -> Option<Arc<dyn SecureChannel>> {
        if !self.state.is_live() || self.target != device_name {
            return None;
        }
        let channel = self.channel.as_ref()?;
        if channel.device_name() != device_name {
            tracing::debug!(
                expected = %device_name,
                actual = %channel.device_name(),
                "device mismatch"
            );
            return None;
        }
        Some(Arc::clone(channel))
    }

    /// Whether an explicit disconnect for `device_name` applies to this session.
    pub(crate) fn is_disconnectable(&self, device_name: &str) -> bool {
        !self.state.is_terminal()
            && (self.target == device_name
                || self.channel.as_ref().is_some_and(|c| c.device_name() == device_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{AccessPoint, ChannelError, ProvisionEvent};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct NamedChannel(&'static str);

    #[async_trait]
    impl SecureChannel for NamedChannel {
        fn device_name(&self) -> &str {
            self.0
        }

        async fn init_session(&self, _pop: &str) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn scan_networks(&self) -> Result<Vec<AccessPoint>, ChannelError> {
            Ok(Vec::new())
        }

        async fn send_credentials(&self, _ssid: &str, _pass: &str) -> mpsc::Receiver<ProvisionEvent> {
            mpsc::channel(1).1
        }

        async fn send_to_endpoint(&self, _path: &str, data: &[u8]) -> Result<Vec<u8>, ChannelError> {
            Ok(data.to_vec())
        }
    }

    fn session(target: &str, channel: &'static str) -> (ConnectionSession, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mut session = ConnectionSession::new(1, target.to_string(), Instant::now(), tx);
        session.attach(Arc::new(NamedChannel(channel)));
        (session, rx)
    }

    #[test]
    fn test_handle_only_exposed_when_live() {
        let (mut s, _rx) = session("A", "A");
        assert!(s.live_channel("A").is_none());

        s.transition(SessionState::Connected);
        assert!(s.live_channel("A").is_none());

        s.transition(SessionState::SessionEstablished);
        assert!(s.live_channel("A").is_some());
        assert!(s.live_channel("B").is_none());

        s.transition(SessionState::Provisioning);
        assert!(s.live_channel("A").is_some());
    }

    #[test]
    fn test_handle_identity_is_cross_checked() {
        let (mut s, _rx) = session("A", "stale");
        s.transition(SessionState::SessionEstablished);
        assert!(s.live_channel("A").is_none());
    }

    #[tokio::test]
    async fn test_terminal_state_cancels_and_sticks() {
        let (mut s, rx) = session("A", "A");
        s.transition(SessionState::Disconnected);
        assert!(rx.await.is_err());

        s.transition(SessionState::SessionEstablished);
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(!s.is_disconnectable("A"));
        assert!(s.finish(SessionState::Failed).is_none());
    }

    #[test]
    fn test_finish_hands_back_the_link_once() {
        let (tx, _rx) = oneshot::channel();
        let mut pending = ConnectionSession::new(2, "A".to_string(), Instant::now(), tx);
        assert!(pending.is_disconnectable("A"));
        // reserved but the transport has not returned yet
        assert!(pending.finish(SessionState::Disconnected).is_none());
        assert_eq!(pending.state(), SessionState::Disconnected);

        let (mut s, _rx) = session("A", "A");
        s.transition(SessionState::SessionEstablished);
        let link = s.finish(SessionState::Disconnected).unwrap();
        assert_eq!(link.device_name(), "A");
        assert!(s.finish(SessionState::Disconnected).is_none());
    }
}
