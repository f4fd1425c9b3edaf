//! Live sessions and their teardown.
//!
//! [`SessionRegistry`] is the single authority over which sessions currently
//! have a browser attached. It runs as an actor: handles send commands over a
//! queue and the actor owns the map, so there is no lock to hold across an
//! await and no way for two callers to interleave on the same entry.
//!
//! ## Closing
//!
//! Every path that ends a session (the subject's browser leaving, guacd
//! hanging up, an operator's forced disconnect, server shutdown) goes through
//! [`SessionRegistry::close_session`]. It runs inside the actor, so calls for
//! the same session are serialized; the first one tears everything down and
//! later ones find nothing left to close. The descriptor is reconciled in a
//! single store write, so a session records at most one disconnect.
//!
//! Observers are tracked per session by an [`observer::ObserverGroup`], which
//! is closed together with the subject.

pub mod endpoint;
pub mod observer;

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::gateway::GatewayManager;
use crate::store::{Reconciled, SessionStore};
use endpoint::{CloseCode, Endpoint};
use observer::{ObserverError, ObserverGroup};

const COMMAND_QUEUE: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} is already live")]
    AlreadyExists(String),
    #[error("session {0} is not live")]
    NotFound(String),
    #[error(transparent)]
    Observer(#[from] ObserverError),
}

/// Snapshot of a live entry.
#[derive(Debug, Clone)]
pub struct LiveSessionInfo {
    pub session_id: String,
    pub subject_id: String,
    pub connection_id: String,
    pub has_ssh_client: bool,
}

/// Result of [`SessionRegistry::close_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    /// Whether a live entry was found and torn down.
    pub was_live: bool,
    pub descriptor: Reconciled,
}

struct Entry {
    subject: Endpoint,
    observers: ObserverGroup,
}

enum Command {
    Add {
        session_id: String,
        subject: Endpoint,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Get {
        session_id: String,
        reply: oneshot::Sender<Option<LiveSessionInfo>>,
    },
    Observers {
        session_id: String,
        reply: oneshot::Sender<Option<ObserverGroup>>,
    },
    Remove {
        session_id: String,
        reply: oneshot::Sender<bool>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
    Close {
        session_id: String,
        code: CloseCode,
        reason: String,
        reply: oneshot::Sender<CloseOutcome>,
    },
    CloseAll {
        code: CloseCode,
        reason: String,
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the registry actor.
#[derive(Clone)]
pub struct SessionRegistry {
    tx: mpsc::Sender<Command>,
}

impl SessionRegistry {
    /// Start the actor. It stops once every handle is dropped.
    pub fn spawn(store: SessionStore, gateways: GatewayManager) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let actor = Actor {
            sessions: HashMap::new(),
            store,
            gateways,
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Register the subject endpoint for `session_id` and start its observer
    /// group. Fails if the session already has a live subject, in which case
    /// the rejected endpoint is closed with `NewTunnelError`.
    pub async fn add(&self, session_id: &str, subject: Endpoint) -> Result<(), RegistryError> {
        let session_id = session_id.to_string();
        let id = session_id.clone();
        self.request(|reply| Command::Add {
            session_id,
            subject,
            reply,
        })
        .await
        .unwrap_or(Err(RegistryError::NotFound(id)))
    }

    pub async fn get(&self, session_id: &str) -> Option<LiveSessionInfo> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::Get { session_id, reply })
            .await
            .flatten()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.get(session_id).await.is_some()
    }

    async fn observers(&self, session_id: &str) -> Option<ObserverGroup> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::Observers { session_id, reply })
            .await
            .flatten()
    }

    /// Drop the live entry without closing anything. Returns whether it
    /// existed.
    pub async fn remove(&self, session_id: &str) -> bool {
        let session_id = session_id.to_string();
        self.request(|reply| Command::Remove { session_id, reply })
            .await
            .unwrap_or(false)
    }

    /// Attach an observer to a live session. On failure the observer has
    /// already been closed with `NotFoundSession`.
    pub async fn join(&self, session_id: &str, observer: Endpoint) -> Result<(), RegistryError> {
        let Some(group) = self.observers(session_id).await else {
            observer
                .close(CloseCode::NotFoundSession, "session not found")
                .await;
            return Err(RegistryError::NotFound(session_id.to_string()));
        };
        group.join(observer).await?;
        Ok(())
    }

    /// Detach and close one observer. Never affects the subject.
    pub async fn leave(&self, session_id: &str, observer_id: &str) -> bool {
        match self.observers(session_id).await {
            Some(group) => group.leave(observer_id).await,
            None => false,
        }
    }

    pub async fn observer_count(&self, session_id: &str) -> Option<usize> {
        let group = self.observers(session_id).await?;
        Some(group.len().await)
    }

    pub async fn len(&self) -> usize {
        self.request(|reply| Command::Len { reply })
            .await
            .unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close a session from anywhere. Idempotent.
    pub async fn close_session(&self, session_id: &str, code: CloseCode, reason: &str) -> CloseOutcome {
        let session_id = session_id.to_string();
        let reason = reason.to_string();
        self.request(|reply| Command::Close {
            session_id,
            code,
            reason,
            reply,
        })
        .await
        .unwrap_or(CloseOutcome {
            was_live: false,
            descriptor: Reconciled::Missing,
        })
    }

    /// Close every live session. Returns how many were closed.
    pub async fn close_all(&self, code: CloseCode, reason: &str) -> usize {
        let reason = reason.to_string();
        self.request(|reply| Command::CloseAll { code, reason, reply })
            .await
            .unwrap_or(0)
    }
}

struct Actor {
    sessions: HashMap<String, Entry>,
    store: SessionStore,
    gateways: GatewayManager,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Add {
                    session_id,
                    subject,
                    reply,
                } => {
                    let result = if self.sessions.contains_key(&session_id) {
                        subject
                            .close(CloseCode::NewTunnelError, "session already active")
                            .await;
                        Err(RegistryError::AlreadyExists(session_id))
                    } else {
                        info!(
                            session_id = %session_id,
                            connection_id = %subject.tunnel.uuid(),
                            "Session live"
                        );
                        let observers = ObserverGroup::spawn(session_id.clone());
                        self.sessions
                            .insert(session_id, Entry { subject, observers });
                        Ok(())
                    };
                    let _ = reply.send(result);
                }
                Command::Get { session_id, reply } => {
                    let info = self.sessions.get(&session_id).map(|e| LiveSessionInfo {
                        session_id: session_id.clone(),
                        subject_id: e.subject.id.clone(),
                        connection_id: e.subject.tunnel.uuid().to_string(),
                        has_ssh_client: e.subject.has_ssh_client(),
                    });
                    let _ = reply.send(info);
                }
                Command::Observers { session_id, reply } => {
                    let group = self.sessions.get(&session_id).map(|e| e.observers.clone());
                    let _ = reply.send(group);
                }
                Command::Remove { session_id, reply } => {
                    let _ = reply.send(self.sessions.remove(&session_id).is_some());
                }
                Command::Len { reply } => {
                    let _ = reply.send(self.sessions.len());
                }
                Command::Close {
                    session_id,
                    code,
                    reason,
                    reply,
                } => {
                    let outcome = self.close(&session_id, code, &reason).await;
                    let _ = reply.send(outcome);
                }
                Command::CloseAll {
                    code,
                    reason,
                    reply,
                } => {
                    let ids: Vec<String> = self.sessions.keys().cloned().collect();
                    for id in &ids {
                        self.close(id, code, &reason).await;
                    }
                    let _ = reply.send(ids.len());
                }
            }
        }
    }

    async fn close(&mut self, session_id: &str, code: CloseCode, reason: &str) -> CloseOutcome {
        let entry = self.sessions.remove(session_id);
        let was_live = entry.is_some();
        if let Some(entry) = entry {
            entry.subject.close_tunnel().await;
            entry.observers.close_all(code, reason).await;
            entry.subject.close_socket(code, reason).await;
            info!(session_id, code = code.as_i32(), reason, "Session closed");
        }

        self.gateways.close_tunnel(session_id).await;

        let descriptor = self.store.reconcile_closed(session_id, code, reason).await;
        if descriptor == Reconciled::Missing && was_live {
            warn!(session_id, "Closed a live session with no descriptor");
        }
        CloseOutcome {
            was_live,
            descriptor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::endpoint::{CloseRequest, Role, SocketCloser};
    use crate::store::{Asset, SessionStatus};
    use crate::tunnel::testing::{duplex_tunnel, Daemon};
    use crate::tunnel::{Tunnel, TunnelState};
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::sync::watch;

    struct Probe {
        tunnel: Arc<Tunnel>,
        socket: watch::Receiver<Option<CloseRequest>>,
        _daemon: Daemon<DuplexStream>,
    }

    impl Probe {
        fn close_code(&self) -> Option<CloseCode> {
            self.socket.borrow().as_ref().map(|r| r.code)
        }
    }

    async fn endpoint(id: &str, role: Role) -> (Endpoint, Probe) {
        let (tunnel, daemon) = duplex_tunnel("$abc").await;
        let (closer, socket) = SocketCloser::channel();
        (
            Endpoint::new(id, role, tunnel.clone(), closer),
            Probe {
                tunnel,
                socket,
                _daemon: daemon,
            },
        )
    }

    fn store() -> SessionStore {
        SessionStore::new(
            vec![Asset {
                id: "web".to_string(),
                ip: "10.0.0.5".to_string(),
                port: 22,
                protocol: "ssh".to_string(),
                active: true,
                ..Asset::default()
            }],
            vec![],
            HashMap::new(),
        )
    }

    async fn connected_session(store: &SessionStore) -> String {
        let s = store.create_session("web", "u1", "").await.unwrap();
        store.mark_connected(&s.id).await.unwrap();
        s.id
    }

    fn registry(store: &SessionStore) -> SessionRegistry {
        SessionRegistry::spawn(store.clone(), GatewayManager::new(vec![]))
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let store = store();
        let registry = registry(&store);
        let (subject, _probe) = endpoint("sub", Role::Subject).await;
        registry.add("s1", subject).await.unwrap();

        let info = registry.get("s1").await.unwrap();
        assert_eq!(info.subject_id, "sub");
        assert_eq!(info.connection_id, "$abc");
        assert!(!info.has_ssh_client);
        assert_eq!(registry.len().await, 1);

        let (dup, dup_probe) = endpoint("sub2", Role::Subject).await;
        assert_eq!(
            registry.add("s1", dup).await,
            Err(RegistryError::AlreadyExists("s1".to_string()))
        );
        assert_eq!(dup_probe.close_code(), Some(CloseCode::NewTunnelError));
        assert_eq!(registry.get("s1").await.unwrap().subject_id, "sub");

        assert!(registry.remove("s1").await);
        assert!(!registry.remove("s1").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_forced_disconnect_closes_everyone_once() {
        let store = store();
        let registry = registry(&store);
        let id = connected_session(&store).await;

        let (subject, subject_probe) = endpoint("sub", Role::Subject).await;
        registry.add(&id, subject).await.unwrap();
        let (a, probe_a) = endpoint("a", Role::Observer).await;
        let (b, probe_b) = endpoint("b", Role::Observer).await;
        registry.join(&id, a).await.unwrap();
        registry.join(&id, b).await.unwrap();
        assert_eq!(registry.observer_count(&id).await, Some(2));

        let outcome = registry
            .close_session(&id, CloseCode::ForcedDisconnect, "admin")
            .await;
        assert_eq!(
            outcome,
            CloseOutcome {
                was_live: true,
                descriptor: Reconciled::Disconnected
            }
        );
        for probe in [&subject_probe, &probe_a, &probe_b] {
            assert_eq!(probe.tunnel.state(), TunnelState::Closed);
            assert_eq!(probe.close_code(), Some(CloseCode::ForcedDisconnect));
        }
        assert!(registry.get(&id).await.is_none());

        let again = registry
            .close_session(&id, CloseCode::TunnelClosed, "late")
            .await;
        assert_eq!(again.descriptor, Reconciled::Unchanged);
        assert!(!again.was_live);
        let s = store.get_session(&id).await.unwrap();
        assert_eq!(s.status, SessionStatus::Disconnected);
        assert_eq!(s.code, Some(802));
    }

    #[tokio::test]
    async fn test_concurrent_closes_update_once() {
        let store = store();
        let registry = registry(&store);
        let id = connected_session(&store).await;
        let (subject, _probe) = endpoint("sub", Role::Subject).await;
        registry.add(&id, subject).await.unwrap();

        let mut tasks = Vec::new();
        for code in [
            CloseCode::Normal,
            CloseCode::TunnelClosed,
            CloseCode::ForcedDisconnect,
        ] {
            let registry = registry.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                registry.close_session(&id, code, "race").await
            }));
        }
        let mut outcomes = Vec::new();
        for t in tasks {
            outcomes.push(t.await.unwrap());
        }
        assert_eq!(outcomes.iter().filter(|o| o.was_live).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| o.descriptor == Reconciled::Disconnected)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_close_connecting_deletes_descriptor() {
        let store = store();
        let registry = registry(&store);
        let s = store.create_session("web", "u1", "").await.unwrap();
        store
            .update_session(&s.id, |s| s.status = SessionStatus::Connecting)
            .await;
        let outcome = registry
            .close_session(&s.id, CloseCode::Normal, "user exit")
            .await;
        assert_eq!(outcome.descriptor, Reconciled::Deleted);
        assert!(store.get_session(&s.id).await.is_none());
    }

    #[tokio::test]
    async fn test_join_absent_session() {
        let registry = registry(&store());
        let (observer, probe) = endpoint("o", Role::Observer).await;
        assert_eq!(
            registry.join("nope", observer).await,
            Err(RegistryError::NotFound("nope".to_string()))
        );
        assert_eq!(probe.close_code(), Some(CloseCode::NotFoundSession));
        assert_eq!(probe.tunnel.state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_observer_leave_keeps_subject() {
        let store = store();
        let registry = registry(&store);
        let id = connected_session(&store).await;
        let (subject, subject_probe) = endpoint("sub", Role::Subject).await;
        registry.add(&id, subject).await.unwrap();
        let (o, probe) = endpoint("o", Role::Observer).await;
        registry.join(&id, o).await.unwrap();

        assert!(registry.leave(&id, "o").await);
        assert_eq!(probe.close_code(), Some(CloseCode::Normal));
        assert_eq!(subject_probe.tunnel.state(), TunnelState::Ready);
        assert_eq!(subject_probe.close_code(), None);
        assert_eq!(registry.observer_count(&id).await, Some(0));
        assert!(!registry.leave("nope", "o").await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let store = store();
        let registry = registry(&store);
        let mut probes = Vec::new();
        for i in 0..3 {
            let id = connected_session(&store).await;
            let (subject, probe) = endpoint(&format!("sub{i}"), Role::Subject).await;
            registry.add(&id, subject).await.unwrap();
            probes.push(probe);
        }
        assert_eq!(
            registry
                .close_all(CloseCode::Normal, "server shutting down")
                .await,
            3
        );
        assert!(registry.is_empty().await);
        assert!(probes
            .iter()
            .all(|p| p.close_code() == Some(CloseCode::Normal)));
    }
}
