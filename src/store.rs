//! In-memory records: sessions, assets, credentials and the property map.
//!
//! Assets, credentials and properties are seeded from the config file and do
//! not change at runtime. Session descriptors are created through the REST
//! API and updated as browsers connect and disconnect.
//!
//! Stored string values may hold `-` as an "empty" placeholder; consumers go
//! through [`crate::tunnel::params::stored_value`] before using them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::sessions::endpoint::CloseCode;
use crate::tunnel::params::stored_value;
use crate::util::now_ms;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("asset not found: {0}")]
    AssetNotFound(String),
    #[error("credential not found: {0}")]
    CredentialNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    NoConnect,
    Connecting,
    Connected,
    Disconnected,
}

impl std::str::FromStr for SessionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "no_connect" => Ok(Self::NoConnect),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            _ => Err(()),
        }
    }
}

/// One remote session, from creation until it is deleted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionDescriptor {
    pub id: String,
    pub protocol: String,
    pub ip: String,
    pub port: u16,
    pub connection_id: Option<String>,
    pub asset_id: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
    #[serde(skip_serializing)]
    pub passphrase: Option<String>,
    pub access_gateway_id: Option<String>,
    pub creator: String,
    pub client_ip: String,
    pub width: u32,
    pub height: u32,
    pub status: SessionStatus,
    pub recording: Option<String>,
    pub reviewed: bool,
    /// Epoch milliseconds.
    pub created_at: u64,
    pub connected_at: Option<u64>,
    pub disconnected_at: Option<u64>,
    pub code: Option<i32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    /// Username and password or key stored on the asset itself.
    #[default]
    Custom,
    /// Login taken from the referenced credential.
    Credential,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    #[serde(default)]
    pub account_type: AccountType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub access_gateway_id: Option<String>,
    /// Per-asset guacd parameter overrides.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub owner: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    /// Username and password.
    #[default]
    Custom,
    PrivateKey,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: CredentialKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
}

/// Filters for [`SessionStore::list_sessions`]. Pages start at 1.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub protocol: Option<String>,
    pub creator: Option<String>,
    pub client_ip: Option<String>,
    pub asset_id: Option<String>,
    pub page_index: usize,
    pub page_size: usize,
}

pub struct SessionPage {
    pub total: usize,
    pub items: Vec<SessionDescriptor>,
}

/// What closing a session did to its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// No descriptor with that id.
    Missing,
    /// Already disconnected, left untouched.
    Unchanged,
    /// Never got past connecting, removed.
    Deleted,
    /// Marked disconnected with the close code.
    Disconnected,
}

#[derive(Default)]
struct Records {
    sessions: HashMap<String, SessionDescriptor>,
    assets: HashMap<String, Asset>,
    credentials: HashMap<String, Credential>,
    properties: HashMap<String, String>,
}

/// Cloneable handle; all clones share the same records.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<Records>>,
}

impl SessionStore {
    pub fn new(
        assets: Vec<Asset>,
        credentials: Vec<Credential>,
        properties: HashMap<String, String>,
    ) -> Self {
        let records = Records {
            sessions: HashMap::new(),
            assets: assets.into_iter().map(|a| (a.id.clone(), a)).collect(),
            credentials: credentials.into_iter().map(|c| (c.id.clone(), c)).collect(),
            properties,
        };
        Self {
            inner: Arc::new(RwLock::new(records)),
        }
    }

    /// Create a `no_connect` session for `asset_id`, copying the login from
    /// the asset or from its credential.
    pub async fn create_session(
        &self,
        asset_id: &str,
        creator: &str,
        client_ip: &str,
    ) -> Result<SessionDescriptor, StoreError> {
        let mut records = self.inner.write().await;
        let asset = records
            .assets
            .get(asset_id)
            .ok_or_else(|| StoreError::AssetNotFound(asset_id.to_string()))?;

        let mut session = SessionDescriptor {
            id: Uuid::new_v4().to_string(),
            protocol: asset.protocol.clone(),
            ip: asset.ip.clone(),
            port: asset.port,
            asset_id: asset.id.clone(),
            username: asset.username.clone(),
            password: asset.password.clone(),
            private_key: asset.private_key.clone(),
            passphrase: asset.passphrase.clone(),
            access_gateway_id: stored_value(asset.access_gateway_id.as_deref()),
            creator: creator.to_string(),
            client_ip: client_ip.to_string(),
            status: SessionStatus::NoConnect,
            created_at: now_ms(),
            ..SessionDescriptor::default()
        };

        if asset.account_type == AccountType::Credential {
            let credential_id = asset.credential_id.clone().unwrap_or_default();
            let credential = records
                .credentials
                .get(&credential_id)
                .ok_or(StoreError::CredentialNotFound(credential_id))?;
            session.username = credential.username.clone();
            match credential.kind {
                CredentialKind::Custom => {
                    session.password = credential.password.clone();
                    session.private_key = None;
                    session.passphrase = None;
                }
                CredentialKind::PrivateKey => {
                    session.password = None;
                    session.private_key = credential.private_key.clone();
                    session.passphrase = credential.passphrase.clone();
                }
            }
        }

        records.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Option<SessionDescriptor> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    /// Matching sessions, most recently connected first.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> SessionPage {
        let records = self.inner.read().await;
        let mut items: Vec<SessionDescriptor> = records
            .sessions
            .values()
            .filter(|s| filter.status.is_none_or(|st| s.status == st))
            .filter(|s| filter.protocol.as_deref().is_none_or(|p| s.protocol == p))
            .filter(|s| filter.creator.as_deref().is_none_or(|c| s.creator == c))
            .filter(|s| filter.client_ip.as_deref().is_none_or(|ip| s.client_ip == ip))
            .filter(|s| filter.asset_id.as_deref().is_none_or(|a| s.asset_id == a))
            .cloned()
            .collect();
        drop(records);

        items.sort_by(|a, b| {
            b.connected_at
                .cmp(&a.connected_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        let total = items.len();
        let size = if filter.page_size == 0 { total.max(1) } else { filter.page_size };
        let page = filter.page_index.max(1) - 1;
        let items = items.into_iter().skip(page * size).take(size).collect();
        SessionPage { total, items }
    }

    /// Apply `f` to a session. Returns `false` if it does not exist.
    pub async fn update_session<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut SessionDescriptor),
    {
        match self.inner.write().await.sessions.get_mut(id) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    pub async fn delete_session(&self, id: &str) -> Option<SessionDescriptor> {
        self.inner.write().await.sessions.remove(id)
    }

    /// Move a session to `connected`. A disconnected session stays
    /// disconnected.
    pub async fn mark_connected(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.inner.write().await;
        let session = records
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        if session.status != SessionStatus::Disconnected {
            session.status = SessionStatus::Connected;
            session.connected_at = Some(now_ms());
        }
        Ok(())
    }

    /// Record that a session was closed with `code`. Runs as a single write so
    /// concurrent closes cannot both update the record.
    pub async fn reconcile_closed(&self, id: &str, code: CloseCode, reason: &str) -> Reconciled {
        let mut records = self.inner.write().await;
        let Some(session) = records.sessions.get_mut(id) else {
            return Reconciled::Missing;
        };
        match session.status {
            SessionStatus::Disconnected => Reconciled::Unchanged,
            SessionStatus::Connecting => {
                records.sessions.remove(id);
                Reconciled::Deleted
            }
            SessionStatus::NoConnect | SessionStatus::Connected => {
                session.status = SessionStatus::Disconnected;
                session.disconnected_at = Some(now_ms());
                session.code = Some(code.as_i32());
                session.message = Some(reason.to_string());
                Reconciled::Disconnected
            }
        }
    }

    pub async fn asset(&self, id: &str) -> Option<Asset> {
        self.inner.read().await.assets.get(id).cloned()
    }

    pub async fn assets(&self) -> Vec<Asset> {
        let mut assets: Vec<Asset> = self.inner.read().await.assets.values().cloned().collect();
        assets.sort_by(|a, b| a.id.cmp(&b.id));
        assets
    }

    /// Attribute overrides for an asset; empty when the asset is unknown.
    pub async fn asset_attributes(&self, asset_id: &str) -> HashMap<String, String> {
        self.inner
            .read()
            .await
            .assets
            .get(asset_id)
            .map(|a| a.attributes.clone())
            .unwrap_or_default()
    }

    pub async fn properties(&self) -> HashMap<String, String> {
        self.inner.read().await.properties.clone()
    }
}
