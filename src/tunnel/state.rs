//! Half-close state machine shared by both connection halves

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Connection state, derived from the two half-close flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Both directions open
    Open,
    /// Local output shut ("fin" sent), input still open
    OutputShut,
    /// Local input shut, output still open
    InputShut,
    /// Both directions shut, socket still held
    BothShut,
    /// Terminal, the socket has been released
    Closed,
}

impl ConnectionState {
    pub(crate) fn from_flags(input_open: bool, output_open: bool, closed: bool) -> Self {
        if closed {
            return ConnectionState::Closed;
        }

        match (input_open, output_open) {
            (true, true) => ConnectionState::Open,
            (true, false) => ConnectionState::OutputShut,
            (false, true) => ConnectionState::InputShut,
            (false, false) => ConnectionState::BothShut,
        }
    }
}

/// Operation rejected by the current state
///
/// These are expected during relaying: they are how one direction learns
/// that the other has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Connection closed")]
    Closed,

    #[error("Connection output already shut down")]
    OutputShut,

    #[error("Connection input already shut down")]
    InputShut,

    #[error("Reset requires the local output to be shut down first")]
    OutputStillOpen,

    #[error("Halves belong to different connections")]
    Mismatched,
}

/// Force-close signal observed by both halves of one connection
///
/// Either half may fire it; the other half's pending I/O is abandoned and
/// every further operation fails with [`StateError::Closed`].
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the connection closed
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has fired
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Check whether two handles belong to the same connection
    pub fn same_as(&self, other: &CloseSignal) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_from_flags() {
        assert_eq!(ConnectionState::from_flags(true, true, false), ConnectionState::Open);

        assert_eq!(ConnectionState::from_flags(true, false, false), ConnectionState::OutputShut);
        assert_eq!(ConnectionState::from_flags(false, true, false), ConnectionState::InputShut);

        assert_eq!(ConnectionState::from_flags(false, false, false), ConnectionState::BothShut);
        assert_eq!(ConnectionState::from_flags(true, true, true), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_signal_wakes_waiter() {
        let signal = CloseSignal::new();
        let other = signal.clone();
        assert!(signal.same_as(&other));
        assert!(!signal.same_as(&CloseSignal::new()));

        let waiter = tokio::spawn(async move { other.closed().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!signal.is_closed());
        signal.fire();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(signal.is_closed());

        // Already fired: resolves immediately
        signal.closed().await;
    }
}
