//! One browser connection attached to a session.
//!
//! An [`Endpoint`] pairs the guacd tunnel opened for a browser with the means
//! to close that browser's socket. The socket itself is owned by a writer
//! task (see `ws`); endpoints only hold a [`SocketCloser`], so closing never
//! waits behind queued frames.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::ssh::SshClient;
use crate::tunnel::Tunnel;

/// Control-frame payload limit minus the two-byte status code.
const MAX_CLOSE_REASON: usize = 123;

/// Why a browser socket was closed. Values are stable and shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    TunnelClosed,
    NotFoundSession,
    NewTunnelError,
    ForcedDisconnect,
    AccessGatewayUnavailable,
    AccessGatewayCreateError,
    AssetNotActive,
    NewSshClientError,
}

impl CloseCode {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::TunnelClosed => -1,
            Self::NotFoundSession => 800,
            Self::NewTunnelError => 801,
            Self::ForcedDisconnect => 802,
            Self::AccessGatewayUnavailable => 803,
            Self::AccessGatewayCreateError => 804,
            Self::AssetNotActive => 805,
            Self::NewSshClientError => 806,
        }
    }

    /// WebSocket close status: 1000 for a normal close, otherwise the
    /// private-use range `4000 + |code|`.
    pub fn ws_code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            other => 4000 + other.as_i32().unsigned_abs() as u16,
        }
    }

    /// Reason text carried in the close frame, `"<code>:<reason>"`.
    pub fn frame_reason(self, reason: &str) -> String {
        let mut text = format!("{}:{reason}", self.as_i32());
        if text.len() > MAX_CLOSE_REASON {
            let mut cut = MAX_CLOSE_REASON;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        text
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: CloseCode,
    pub reason: String,
}

/// Asks a socket writer task to send a close frame and stop.
#[derive(Debug)]
pub struct SocketCloser {
    tx: watch::Sender<Option<CloseRequest>>,
}

impl SocketCloser {
    pub fn channel() -> (Self, watch::Receiver<Option<CloseRequest>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    /// Request a close. Only the first request is delivered; returns whether
    /// this call was it.
    pub fn close(&self, code: CloseCode, reason: &str) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(CloseRequest {
                code,
                reason: reason.to_string(),
            });
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Subject,
    Observer,
}

/// A browser attached to a session, as seen by the registry.
#[derive(Debug)]
pub struct Endpoint {
    pub id: String,
    pub role: Role,
    pub tunnel: Arc<Tunnel>,
    socket: SocketCloser,
    ssh: Option<SshClient>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, role: Role, tunnel: Arc<Tunnel>, socket: SocketCloser) -> Self {
        Self {
            id: id.into(),
            role,
            tunnel,
            socket,
            ssh: None,
        }
    }

    /// Attach the auxiliary SSH client opened for this subject.
    #[must_use]
    pub fn with_ssh_client(mut self, client: SshClient) -> Self {
        self.ssh = Some(client);
        self
    }

    pub fn has_ssh_client(&self) -> bool {
        self.ssh.is_some()
    }

    /// Close the tunnel.
    pub async fn close_tunnel(&self) {
        self.tunnel.close().await;
    }

    /// Close the browser socket with `code` and drop the SSH client.
    pub async fn close_socket(&self, code: CloseCode, reason: &str) {
        if !self.socket.close(code, reason) {
            debug!(endpoint_id = %self.id, "Socket already closing");
        }
        if let Some(ssh) = &self.ssh {
            ssh.disconnect().await;
        }
    }

    /// Close both sides. Safe to call more than once.
    pub async fn close(&self, code: CloseCode, reason: &str) {
        self.close_tunnel().await;
        self.close_socket(code, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testing::duplex_tunnel;
    use crate::tunnel::TunnelState;

    #[test]
    fn test_codes_are_stable() {
        let codes = [
            (CloseCode::Normal, 0),
            (CloseCode::TunnelClosed, -1),
            (CloseCode::NotFoundSession, 800),
            (CloseCode::NewTunnelError, 801),
            (CloseCode::ForcedDisconnect, 802),
            (CloseCode::AccessGatewayUnavailable, 803),
            (CloseCode::AccessGatewayCreateError, 804),
            (CloseCode::AssetNotActive, 805),
            (CloseCode::NewSshClientError, 806),
        ];
        for (code, value) in codes {
            assert_eq!(code.as_i32(), value);
        }
    }

    #[test]
    fn test_ws_code_mapping() {
        assert_eq!(CloseCode::Normal.ws_code(), 1000);
        assert_eq!(CloseCode::TunnelClosed.ws_code(), 4001);
        assert_eq!(CloseCode::ForcedDisconnect.ws_code(), 4802);
        assert_eq!(CloseCode::NewSshClientError.ws_code(), 4806);
    }

    #[test]
    fn test_frame_reason_truncated_on_char_boundary() {
        assert_eq!(CloseCode::ForcedDisconnect.frame_reason("bye"), "802:bye");
        let long = "é".repeat(100);
        let text = CloseCode::Normal.frame_reason(&long);
        assert!(text.len() <= 123);
        assert!(text.starts_with("0:é"));
    }

    #[test]
    fn test_closer_first_request_wins() {
        let (closer, rx) = SocketCloser::channel();
        assert!(!closer.is_closed());
        assert!(closer.close(CloseCode::ForcedDisconnect, "admin"));
        assert!(!closer.close(CloseCode::Normal, "late"));
        let req = rx.borrow().clone().unwrap();
        assert_eq!(req.code, CloseCode::ForcedDisconnect);
        assert_eq!(req.reason, "admin");
    }

    #[tokio::test]
    async fn test_endpoint_close_twice() {
        let (tunnel, _d) = duplex_tunnel("$abc").await;
        let (closer, rx) = SocketCloser::channel();
        let endpoint = Endpoint::new("e1", Role::Subject, tunnel.clone(), closer);
        endpoint.close(CloseCode::TunnelClosed, "gone").await;
        endpoint.close(CloseCode::Normal, "again").await;
        assert_eq!(tunnel.state(), TunnelState::Closed);
        assert_eq!(rx.borrow().as_ref().unwrap().code, CloseCode::TunnelClosed);
    }
}
