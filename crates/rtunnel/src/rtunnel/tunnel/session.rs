//! Control-session state machine and the single writer that owns a control channel.

use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::rtunnel::tunnel::msg::{self, Message, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting)
            | (Connecting, Authenticating)
            | (Authenticating, Active)
            | (Active, Draining) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("control channel closed")]
    ChannelClosed,
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    #[error("closed by relay: {0}")]
    ForcedClose(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Observable session state; every change is validated against [`SessionState::can_transition`].
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub fn new(initial: SessionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Moves to `next`, returning the previous state.
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionError> {
        let mut out = Err(SessionError::ChannelClosed);
        self.tx.send_if_modified(|cur| {
            if cur.can_transition(next) {
                out = Ok(*cur);
                *cur = next;
                true
            } else {
                out = Err(SessionError::InvalidTransition {
                    from: *cur,
                    to: next,
                });
                false
            }
        });
        out
    }
}

/// Cloneable handle to the one task that writes a control channel.
#[derive(Debug, Clone)]
pub struct ControlWriter {
    tx: mpsc::Sender<Message>,
}

impl ControlWriter {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, m: impl Into<Message>) -> Result<(), SessionError> {
        self.tx
            .send(m.into())
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }
}

/// Spawns the writer task; it exits when every [`ControlWriter`] is dropped or a write fails.
pub fn spawn_writer<W>(mut w: W) -> (ControlWriter, JoinHandle<Result<(), ProtocolError>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let task = tokio::spawn(async move {
        while let Some(m) = rx.recv().await {
            msg::write_msg(&mut w, &m).await?;
        }
        let _ = w.shutdown().await;
        Ok(())
    });
    (ControlWriter::new(tx), task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtunnel::tunnel::msg::{Ping, Pong};

    #[test]
    fn happy_path_transitions() {
        let s = StateCell::new(SessionState::Disconnected);
        for next in [
            SessionState::Connecting,
            SessionState::Authenticating,
            SessionState::Active,
            SessionState::Draining,
            SessionState::Closed,
        ] {
            s.transition(next).unwrap();
        }
        assert_eq!(s.get(), SessionState::Closed);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let s = StateCell::new(SessionState::Connecting);
        assert!(matches!(
            s.transition(SessionState::Active),
            Err(SessionError::InvalidTransition {
                from: SessionState::Connecting,
                to: SessionState::Active
            })
        ));
        assert_eq!(s.get(), SessionState::Connecting);

        s.transition(SessionState::Closed).unwrap();
        assert!(s.transition(SessionState::Closed).is_err());
        assert!(s.transition(SessionState::Connecting).is_err());
    }

    #[test]
    fn failed_login_closes_without_activating() {
        let s = StateCell::new(SessionState::Authenticating);
        s.transition(SessionState::Closed).unwrap();
        assert!(s.transition(SessionState::Active).is_err());
    }

    #[tokio::test]
    async fn writer_serializes_concurrent_senders() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let (w, task) = spawn_writer(a);

        let mut handles = Vec::new();
        for i in 0..16 {
            let w = w.clone();
            handles.push(tokio::spawn(async move {
                w.send(Ping {
                    timestamp: i,
                    ..Default::default()
                })
                .await
                .unwrap();
                w.send(Pong::default()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(w);
        task.await.unwrap().unwrap();

        let mut pings = 0;
        let mut pongs = 0;
        for _ in 0..32 {
            match msg::read_msg(&mut b).await.unwrap() {
                Message::Ping(_) => pings += 1,
                Message::Pong(_) => pongs += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!((pings, pongs), (16, 16));
    }
}
