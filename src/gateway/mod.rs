//! Access gateways: reaching private assets through an SSH bastion.
//!
//! Every configured gateway has one pooled SSH connection ([`link`]), dialed
//! on first use and redialed on the next use after it dies. A session routed
//! through a gateway gets its own forwarding listener on `127.0.0.1:0`; guacd
//! is pointed at that address instead of the asset, and each connection it
//! makes is carried to the asset over a `direct-tcpip` channel.
//!
//! Links are shared between sessions. Forwards belong to exactly one session
//! and are torn down when it closes.

mod link;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::ssh::SshHandle;

pub use link::GatewayStatus;
use link::GatewayLink;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("access gateway not found: {0}")]
    NotFound(String),
    #[error("access gateway unavailable: {0}")]
    Unavailable(String),
    #[error("failed to create ssh tunnel: {0}")]
    CreateFailed(#[from] std::io::Error),
    #[error("session {0} already has an ssh tunnel")]
    InUse(String),
}

struct Forward {
    gateway_id: String,
    local: SocketAddr,
    task: JoinHandle<()>,
}

struct Inner {
    /// Fixed at startup; each link has its own lock so a slow dial only
    /// blocks users of that gateway.
    links: HashMap<String, Mutex<GatewayLink>>,
    forwards: Mutex<HashMap<String, Forward>>,
}

/// Cloneable; all clones share the same links and forwards.
#[derive(Clone)]
pub struct GatewayManager {
    inner: Arc<Inner>,
}

impl GatewayManager {
    pub fn new(gateways: Vec<GatewayConfig>) -> Self {
        let links = gateways
            .into_iter()
            .map(|g| (g.id.clone(), Mutex::new(GatewayLink::new(g))))
            .collect();
        Self {
            inner: Arc::new(Inner {
                links,
                forwards: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Status of every gateway, sorted by id. Does not dial.
    pub async fn list(&self) -> Vec<GatewayStatus> {
        let mut out = Vec::with_capacity(self.inner.links.len());
        for link in self.inner.links.values() {
            out.push(link.lock().await.status());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn link_status(&self, gateway_id: &str) -> Option<GatewayStatus> {
        let link = self.inner.links.get(gateway_id)?;
        Some(link.lock().await.status())
    }

    /// Drop and redial a gateway link, returning its new status.
    pub async fn reconnect(&self, gateway_id: &str) -> Result<GatewayStatus, GatewayError> {
        let link = self
            .inner
            .links
            .get(gateway_id)
            .ok_or_else(|| GatewayError::NotFound(gateway_id.to_string()))?;
        let mut link = link.lock().await;
        link.redial().await;
        Ok(link.status())
    }

    /// Open a forward for `session_id` to `target_host:target_port` through
    /// `gateway_id`, returning the local address guacd should dial. A session
    /// holds at most one forward; a second open fails with `InUse` and leaves
    /// the first one running.
    pub async fn open_tunnel(
        &self,
        gateway_id: &str,
        session_id: &str,
        target_host: &str,
        target_port: u16,
    ) -> Result<(String, u16), GatewayError> {
        if self.inner.forwards.lock().await.contains_key(session_id) {
            return Err(GatewayError::InUse(session_id.to_string()));
        }
        let link = self
            .inner
            .links
            .get(gateway_id)
            .ok_or_else(|| GatewayError::NotFound(gateway_id.to_string()))?;
        let handle = {
            let mut link = link.lock().await;
            match link.ensure().await {
                Some(handle) => handle,
                None => return Err(GatewayError::Unavailable(link.message().to_string())),
            }
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local = listener.local_addr()?;
        let task = tokio::spawn(forward_loop(
            listener,
            handle,
            session_id.to_string(),
            target_host.to_string(),
            target_port,
        ));

        // Re-checked under the lock: another open may have won while we dialed.
        match self.inner.forwards.lock().await.entry(session_id.to_string()) {
            Entry::Occupied(_) => {
                task.abort();
                return Err(GatewayError::InUse(session_id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(Forward {
                    gateway_id: gateway_id.to_string(),
                    local,
                    task,
                });
            }
        }
        info!(
            session_id,
            gateway_id,
            "SSH tunnel {local} -> {target_host}:{target_port} opened"
        );
        Ok((local.ip().to_string(), local.port()))
    }

    /// Tear down the forward for `session_id`, if any.
    pub async fn close_tunnel(&self, session_id: &str) {
        self.remove_forward(session_id, |_| true).await;
    }

    /// Tear down the forward for `session_id` only if it is the one listening
    /// on `local_port`, so a failed setup never closes a live session's
    /// forward.
    pub async fn release_tunnel(&self, session_id: &str, local_port: u16) {
        self.remove_forward(session_id, |f| f.local.port() == local_port)
            .await;
    }

    async fn remove_forward(&self, session_id: &str, owned: impl Fn(&Forward) -> bool) {
        let forward = {
            let mut forwards = self.inner.forwards.lock().await;
            match forwards.get(session_id) {
                Some(forward) if owned(forward) => forwards.remove(session_id),
                _ => None,
            }
        };
        if let Some(forward) = forward {
            forward.task.abort();
            debug!(
                session_id,
                gateway_id = %forward.gateway_id,
                "SSH tunnel on {} closed",
                forward.local
            );
        }
    }

    #[cfg(test)]
    pub(crate) async fn has_tunnel(&self, session_id: &str) -> bool {
        self.inner.forwards.lock().await.contains_key(session_id)
    }

    /// Close every forward and disconnect every link.
    pub async fn shutdown(&self) {
        let forwards: Vec<Forward> = self
            .inner
            .forwards
            .lock()
            .await
            .drain()
            .map(|(_, f)| f)
            .collect();
        for forward in forwards {
            forward.task.abort();
        }
        for link in self.inner.links.values() {
            link.lock().await.disconnect().await;
        }
    }
}

/// Accept local connections and carry each one over its own channel.
/// Dropping the task drops the `JoinSet`, which aborts every copy.
async fn forward_loop(
    listener: TcpListener,
    handle: Arc<SshHandle>,
    session_id: String,
    target_host: String,
    target_port: u16,
) {
    let mut copies = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(session_id = %session_id, "SSH tunnel accept failed: {e}");
                        continue;
                    }
                };
                let channel = match handle
                    .channel_open_direct_tcpip(
                        target_host.clone(),
                        u32::from(target_port),
                        peer.ip().to_string(),
                        u32::from(peer.port()),
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!(session_id = %session_id, "direct-tcpip to {target_host}:{target_port} failed: {e}");
                        if handle.is_closed() {
                            return;
                        }
                        continue;
                    }
                };
                let session_id = session_id.clone();
                copies.spawn(async move {
                    let mut remote = channel.into_stream();
                    match tokio::io::copy_bidirectional(&mut stream, &mut remote).await {
                        Ok((up, down)) => {
                            debug!(session_id = %session_id, "Forwarded connection closed ({up} up, {down} down)");
                        }
                        Err(e) => debug!(session_id = %session_id, "Forwarded connection ended: {e}"),
                    }
                });
            }
            Some(_) = copies.join_next() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn unreachable_gateway() -> GatewayConfig {
        // Reserve a port, then free it so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        GatewayConfig {
            id: "dmz".to_string(),
            name: "DMZ".to_string(),
            ip: "127.0.0.1".to_string(),
            port,
            username: "tunnel".to_string(),
            password: Some("pw".to_string()),
            private_key: None,
            passphrase: None,
            connect_timeout_secs: 2,
        }
    }

    #[tokio::test]
    async fn test_unknown_gateway() {
        let manager = GatewayManager::new(vec![]);
        let err = manager
            .open_tunnel("nope", "s1", "10.0.0.5", 22)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(id) if id == "nope"));
        assert!(manager.link_status("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_unavailable() {
        let manager = GatewayManager::new(vec![unreachable_gateway().await]);
        let err = manager
            .open_tunnel("dmz", "s1", "10.0.0.5", 22)
            .await
            .unwrap_err();
        match err {
            GatewayError::Unavailable(message) => assert!(!message.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
        let status = manager.link_status("dmz").await.unwrap();
        assert!(!status.connected);
        assert!(!status.message.is_empty());
        assert!(!manager.has_tunnel("s1").await);
    }

    #[tokio::test]
    async fn test_list_does_not_dial() {
        let manager = GatewayManager::new(vec![unreachable_gateway().await]);
        let list = manager.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "dmz");
        assert!(!list[0].connected);
        assert_eq!(list[0].message, "not connected yet");
    }

    #[tokio::test]
    async fn test_close_absent_tunnel_is_noop() {
        let manager = GatewayManager::new(vec![]);
        manager.close_tunnel("s1").await;
        manager.shutdown().await;
        assert!(!manager.has_tunnel("s1").await);
    }

    async fn with_forward(manager: &GatewayManager, session_id: &str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _listener = listener;
            std::future::pending::<()>().await;
        });
        manager.inner.forwards.lock().await.insert(
            session_id.to_string(),
            Forward {
                gateway_id: "dmz".to_string(),
                local,
                task,
            },
        );
        local
    }

    #[tokio::test]
    async fn test_second_open_keeps_existing_forward() {
        let manager = GatewayManager::new(vec![unreachable_gateway().await]);
        let local = with_forward(&manager, "s1").await;

        let err = manager
            .open_tunnel("dmz", "s1", "10.0.0.5", 22)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InUse(id) if id == "s1"));
        assert!(manager.has_tunnel("s1").await);
        // the refused open never dialed
        assert_eq!(
            manager.link_status("dmz").await.unwrap().message,
            "not connected yet"
        );

        let forwards = manager.inner.forwards.lock().await;
        let forward = forwards.get("s1").unwrap();
        assert_eq!(forward.local, local);
        assert!(!forward.task.is_finished());
    }

    #[tokio::test]
    async fn test_release_only_own_forward() {
        let manager = GatewayManager::new(vec![]);
        let local = with_forward(&manager, "s1").await;

        manager.release_tunnel("s1", local.port().wrapping_add(1)).await;
        assert!(manager.has_tunnel("s1").await);

        manager.release_tunnel("s1", local.port()).await;
        assert!(!manager.has_tunnel("s1").await);
        manager.release_tunnel("s1", local.port()).await;
    }

    #[tokio::test]
    async fn test_reconnect_unknown() {
        let manager = GatewayManager::new(vec![]);
        assert!(matches!(
            manager.reconnect("nope").await,
            Err(GatewayError::NotFound(_))
        ));
    }
}
