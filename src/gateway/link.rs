//! One pooled SSH connection to an access gateway.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::ssh::{self, SshAuth, SshHandle};

/// Connection state reported by `GET /api/gateways`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GatewayStatus {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub connected: bool,
    /// Last dial error, empty while connected.
    pub message: String,
}

pub(super) struct GatewayLink {
    config: GatewayConfig,
    handle: Option<Arc<SshHandle>>,
    message: String,
}

impl GatewayLink {
    pub(super) fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            handle: None,
            message: "not connected yet".to_string(),
        }
    }

    pub(super) fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_closed())
    }

    pub(super) fn status(&self) -> GatewayStatus {
        GatewayStatus {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            ip: self.config.ip.clone(),
            port: self.config.port,
            connected: self.is_connected(),
            message: self.message.clone(),
        }
    }

    /// Live handle, dialing first if there is none or the old one died.
    /// `None` means the gateway is unavailable; see [`Self::message`].
    pub(super) async fn ensure(&mut self) -> Option<Arc<SshHandle>> {
        if !self.is_connected() {
            self.dial().await;
        }
        self.handle.clone()
    }

    pub(super) fn message(&self) -> &str {
        &self.message
    }

    /// Drop the current connection and dial again.
    pub(super) async fn redial(&mut self) {
        self.disconnect().await;
        self.dial().await;
    }

    async fn dial(&mut self) {
        let auth = SshAuth {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            private_key: self.config.private_key.clone(),
            passphrase: self.config.passphrase.clone(),
        };
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        match ssh::connect(&self.config.ip, self.config.port, &auth, timeout).await {
            Ok(handle) => {
                info!(gateway_id = %self.config.id, "Access gateway connected");
                self.handle = Some(Arc::new(handle));
                self.message.clear();
            }
            Err(e) => {
                warn!(gateway_id = %self.config.id, "Access gateway unavailable: {e}");
                self.handle = None;
                self.message = e.to_string();
            }
        }
    }

    pub(super) async fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                warn!(gateway_id = %self.config.id, "Gateway disconnect: {e}");
            }
            self.message = "disconnected".to_string();
        }
    }
}
