//! Observers of one live session.
//!
//! Each session gets an [`ObserverGroup`] actor when its subject registers.
//! The actor owns the observer endpoints; handles are cheap to clone and talk
//! to it over a command queue. Once `close_all` has run the actor is gone and
//! any later `join` is rejected, closing the joining browser with
//! `NotFoundSession`.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::endpoint::{CloseCode, Endpoint};

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObserverError {
    #[error("session is no longer accepting observers")]
    Closed,
}

enum Command {
    Join {
        endpoint: Endpoint,
        reply: oneshot::Sender<()>,
    },
    Leave {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    CloseAll {
        code: CloseCode,
        reason: String,
        reply: oneshot::Sender<()>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct ObserverGroup {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for ObserverGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverGroup")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl ObserverGroup {
    /// Start the actor for `session_id`.
    pub fn spawn(session_id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(run(session_id.into(), rx));
        Self { tx }
    }

    /// Add an observer. On failure the endpoint has already been closed.
    pub async fn join(&self, endpoint: Endpoint) -> Result<(), ObserverError> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(Command::Join { endpoint, reply }).await {
            if let Command::Join { endpoint, .. } = cmd {
                reject(&endpoint).await;
            }
            return Err(ObserverError::Closed);
        }
        rx.await.map_err(|_| ObserverError::Closed)
    }

    /// Remove and close one observer. Returns whether it was a member.
    pub async fn leave(&self, observer_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Leave {
            id: observer_id.to_string(),
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Close every observer and stop accepting new ones.
    pub async fn close_all(&self, code: CloseCode, reason: &str) {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::CloseAll {
            code,
            reason: reason.to_string(),
            reply,
        };
        if self.tx.send(cmd).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Len { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn reject(endpoint: &Endpoint) {
    endpoint
        .close(CloseCode::NotFoundSession, "session not found")
        .await;
}

async fn run(session_id: String, mut rx: mpsc::Receiver<Command>) {
    let mut observers: HashMap<String, Endpoint> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Join { endpoint, reply } => {
                info!(session_id = %session_id, observer_id = %endpoint.id, "Observer joined");
                observers.insert(endpoint.id.clone(), endpoint);
                let _ = reply.send(());
            }
            Command::Leave { id, reply } => {
                let removed = observers.remove(&id);
                if let Some(endpoint) = &removed {
                    endpoint.close(CloseCode::Normal, "observer left").await;
                    info!(session_id = %session_id, observer_id = %id, "Observer left");
                }
                let _ = reply.send(removed.is_some());
            }
            Command::Len { reply } => {
                let _ = reply.send(observers.len());
            }
            Command::CloseAll {
                code,
                reason,
                reply,
            } => {
                for (_, endpoint) in observers.drain() {
                    endpoint.close(code, &reason).await;
                }
                debug!(session_id = %session_id, code = code.as_i32(), "Observers closed");
                let _ = reply.send(());
                break;
            }
        }
    }

    // Commands queued behind close_all still get an answer.
    rx.close();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Join { endpoint, .. } => reject(&endpoint).await,
            Command::Leave { reply, .. } => {
                let _ = reply.send(false);
            }
            Command::Len { reply } => {
                let _ = reply.send(0);
            }
            Command::CloseAll { reply, .. } => {
                let _ = reply.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::endpoint::{CloseRequest, Role, SocketCloser};
    use crate::tunnel::testing::duplex_tunnel;
    use crate::tunnel::TunnelState;
    use std::sync::Arc;
    use tokio::sync::watch;

    struct Probe {
        tunnel: Arc<crate::tunnel::Tunnel>,
        socket: watch::Receiver<Option<CloseRequest>>,
        _daemon: crate::tunnel::testing::Daemon<tokio::io::DuplexStream>,
    }

    impl Probe {
        fn close_code(&self) -> Option<CloseCode> {
            self.socket.borrow().as_ref().map(|r| r.code)
        }
    }

    async fn observer(id: &str) -> (Endpoint, Probe) {
        let (tunnel, daemon) = duplex_tunnel("$abc").await;
        let (closer, socket) = SocketCloser::channel();
        let endpoint = Endpoint::new(id, Role::Observer, tunnel.clone(), closer);
        (
            endpoint,
            Probe {
                tunnel,
                socket,
                _daemon: daemon,
            },
        )
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let group = ObserverGroup::spawn("s1");
        let (a, probe_a) = observer("a").await;
        let (b, probe_b) = observer("b").await;
        group.join(a).await.unwrap();
        group.join(b).await.unwrap();
        assert_eq!(group.len().await, 2);

        assert!(group.leave("a").await);
        assert!(!group.leave("a").await);
        assert_eq!(group.len().await, 1);
        assert_eq!(probe_a.tunnel.state(), TunnelState::Closed);
        assert_eq!(probe_a.close_code(), Some(CloseCode::Normal));
        // sibling untouched
        assert_eq!(probe_b.tunnel.state(), TunnelState::Ready);
        assert_eq!(probe_b.close_code(), None);
    }

    #[tokio::test]
    async fn test_close_all_closes_everyone() {
        let group = ObserverGroup::spawn("s1");
        let (a, probe_a) = observer("a").await;
        let (b, probe_b) = observer("b").await;
        group.join(a).await.unwrap();
        group.join(b).await.unwrap();

        group.close_all(CloseCode::ForcedDisconnect, "admin").await;
        for probe in [&probe_a, &probe_b] {
            assert_eq!(probe.tunnel.state(), TunnelState::Closed);
            assert_eq!(probe.close_code(), Some(CloseCode::ForcedDisconnect));
        }
        assert_eq!(group.len().await, 0);
    }

    #[tokio::test]
    async fn test_join_after_close_all_is_rejected() {
        let group = ObserverGroup::spawn("s1");
        group.close_all(CloseCode::Normal, "done").await;

        let (late, probe) = observer("late").await;
        assert_eq!(group.join(late).await, Err(ObserverError::Closed));
        assert_eq!(probe.tunnel.state(), TunnelState::Closed);
        assert_eq!(probe.close_code(), Some(CloseCode::NotFoundSession));
        assert!(!group.leave("late").await);
    }

    #[tokio::test]
    async fn test_close_all_twice() {
        let group = ObserverGroup::spawn("s1");
        group.close_all(CloseCode::Normal, "done").await;
        group.close_all(CloseCode::Normal, "again").await;
        assert!(group.is_closed() || group.len().await == 0);
    }
}
