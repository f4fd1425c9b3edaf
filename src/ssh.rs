//! SSH client connections (russh).
//!
//! Used for access gateway links and for the auxiliary client opened next to
//! ssh sessions. Host keys are not verified: targets are managed assets whose
//! keys are not tracked anywhere.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("connection to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("invalid private key: {0}")]
    Key(#[from] russh::keys::Error),
    #[error("authentication rejected for user {0}")]
    AuthRejected(String),
}

/// Credentials for one SSH login.
#[derive(Clone, Default)]
pub struct SshAuth {
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

pub struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub type SshHandle = Handle<AcceptAnyHostKey>;

/// Connect to `host:port` and authenticate, preferring the private key when
/// one is configured.
pub async fn connect(
    host: &str,
    port: u16,
    auth: &SshAuth,
    timeout: Duration,
) -> Result<SshHandle, SshError> {
    let config = Arc::new(Config {
        nodelay: true,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Config::default()
    });
    let addr = format!("{host}:{port}");
    let mut handle = tokio::time::timeout(
        timeout,
        client::connect(config, (host, port), AcceptAnyHostKey),
    )
    .await
    .map_err(|_| SshError::Timeout {
        addr: addr.clone(),
        timeout,
    })??;

    let result = match auth.private_key.as_deref() {
        Some(pem) => {
            let key = decode_secret_key(pem, auth.passphrase.as_deref())?;
            let key = PrivateKeyWithHashAlg::new(
                Arc::new(key),
                handle.best_supported_rsa_hash().await?.flatten(),
            );
            handle.authenticate_publickey(&auth.username, key).await?
        }
        None => {
            handle
                .authenticate_password(&auth.username, auth.password.as_deref().unwrap_or(""))
                .await?
        }
    };

    match result {
        AuthResult::Success => {
            debug!("SSH authenticated to {addr} as {}", auth.username);
            Ok(handle)
        }
        AuthResult::Failure { .. } => Err(SshError::AuthRejected(auth.username.clone())),
    }
}

/// An authenticated SSH session kept open alongside a remote session.
pub struct SshClient {
    handle: SshHandle,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}

impl SshClient {
    pub async fn connect(
        host: &str,
        port: u16,
        auth: &SshAuth,
        timeout: Duration,
    ) -> Result<Self, SshError> {
        Ok(Self {
            handle: connect(host, port, auth, timeout).await?,
        })
    }

    pub async fn disconnect(&self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("SSH disconnect: {e}");
        }
    }
}
