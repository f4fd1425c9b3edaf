//! Connection parameters sent to guacd during the handshake.
//!
//! [`Configuration`] holds either a protocol (new connection) or an existing
//! connection id (join), plus a map of named parameters. Parameter values are
//! optional: a parameter that is absent and one that is explicitly unset are
//! both sent as the empty string.
//!
//! Values read from the record store may still contain the `-` placeholder
//! that stands in for "empty" there. [`stored_value`] maps it to `None` at the
//! boundary so nothing downstream has to know about it.
//!
//! [`build`] assembles the full parameter set for a subject connection from
//! the session record, the property map and the asset's attribute overrides.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::store::SessionDescriptor;

pub const RECORDING_PATH: &str = "recording-path";
pub const CREATE_RECORDING_PATH: &str = "create-recording-path";
pub const ENABLE_RECORDING: &str = "enable-recording";
pub const FONT_NAME: &str = "font-name";
pub const FONT_SIZE: &str = "font-size";
pub const COLOR_SCHEME: &str = "color-scheme";
pub const BACKSPACE: &str = "backspace";
pub const TERMINAL_TYPE: &str = "terminal-type";
pub const ENABLE_DRIVE: &str = "enable-drive";
pub const DRIVE_NAME: &str = "drive-name";
pub const DRIVE_PATH: &str = "drive-path";
pub const ENABLE_WALLPAPER: &str = "enable-wallpaper";
pub const ENABLE_THEMING: &str = "enable-theming";
pub const ENABLE_FONT_SMOOTHING: &str = "enable-font-smoothing";
pub const ENABLE_FULL_WINDOW_DRAG: &str = "enable-full-window-drag";
pub const ENABLE_DESKTOP_COMPOSITION: &str = "enable-desktop-composition";
pub const ENABLE_MENU_ANIMATIONS: &str = "enable-menu-animations";
pub const DISABLE_BITMAP_CACHING: &str = "disable-bitmap-caching";
pub const DISABLE_OFFSCREEN_CACHING: &str = "disable-offscreen-caching";
pub const COLOR_DEPTH: &str = "color-depth";
pub const FORCE_LOSSLESS: &str = "force-lossless";
pub const PRE_CONNECTION_ID: &str = "preconnection-id";
pub const PRE_CONNECTION_BLOB: &str = "preconnection-blob";

/// Placeholder the record store uses for "no value".
const STORED_EMPTY: &str = "-";

/// Terminal rendering keys shared by ssh, telnet and kubernetes.
const TERMINAL_KEYS: [&str; 5] = [FONT_SIZE, FONT_NAME, COLOR_SCHEME, BACKSPACE, TERMINAL_TYPE];

/// RDP rendering and performance keys taken from the property map.
const RDP_KEYS: [&str; 12] = [
    ENABLE_WALLPAPER,
    ENABLE_THEMING,
    ENABLE_FONT_SMOOTHING,
    ENABLE_FULL_WINDOW_DRAG,
    ENABLE_DESKTOP_COMPOSITION,
    ENABLE_MENU_ANIMATIONS,
    DISABLE_BITMAP_CACHING,
    DISABLE_OFFSCREEN_CACHING,
    COLOR_DEPTH,
    FORCE_LOSSLESS,
    PRE_CONNECTION_ID,
    PRE_CONNECTION_BLOB,
];

/// Normalise a value read from the record store: the `-` placeholder and the
/// empty string both mean "no value".
pub fn stored_value(value: Option<&str>) -> Option<String> {
    match value {
        None | Some("" | STORED_EMPTY) => None,
        Some(v) => Some(v.to_string()),
    }
}

pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 768;
pub const DEFAULT_DPI: u32 = 96;

/// Handshake configuration for one guacd connection.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Connection id to join. When set, `protocol` is ignored.
    pub connection_id: Option<String>,
    /// Target protocol (`rdp`, `ssh`, `vnc`, `telnet`, `kubernetes`).
    pub protocol: String,
    /// Optimal display size reported in the `size` instruction.
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    parameters: HashMap<String, Option<String>>,
}

impl Configuration {
    /// Configuration for a new connection using `protocol`.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            connection_id: None,
            protocol: protocol.into(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            dpi: DEFAULT_DPI,
            parameters: HashMap::new(),
        }
    }

    /// Configuration that joins the existing connection `connection_id`.
    pub fn join(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            ..Self::new(String::new())
        }
    }

    /// Set the optimal display size, ignoring zero values.
    pub fn set_display(&mut self, width: u32, height: u32, dpi: u32) {
        if width > 0 {
            self.width = width;
        }
        if height > 0 {
            self.height = height;
        }
        if dpi > 0 {
            self.dpi = dpi;
        }
    }

    /// Value for the `select` instruction.
    pub fn selector(&self) -> &str {
        self.connection_id.as_deref().unwrap_or(&self.protocol)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Option<String>>) {
        self.parameters.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(|v| v.as_deref())
    }

    /// Copy a value from a stored map, normalising placeholders.
    fn set_stored(&mut self, name: &str, map: &HashMap<String, String>) {
        self.set(name, stored_value(map.get(name).map(String::as_str)));
    }

    /// Value sent for a parameter in the `connect` instruction.
    pub fn wire_value(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }
}

/// Paths and settings needed to build a subject configuration.
pub struct BuildContext<'a> {
    /// Directory under which per-session recordings are written.
    pub recording_dir: &'a str,
    /// Base directory for mapped drives.
    pub drive_dir: &'a str,
}

/// Build the subject configuration for `session`.
///
/// Precedence, lowest to highest: protocol defaults and the property map,
/// then the session's own host/credentials, then the asset attributes.
/// `hostname` and `port` are taken from the session as passed in, so callers
/// that route through an access gateway rewrite them first.
pub fn build(
    session: &SessionDescriptor,
    properties: &HashMap<String, String>,
    attributes: &HashMap<String, String>,
    ctx: &BuildContext<'_>,
) -> Configuration {
    let mut config = Configuration::new(session.protocol.clone());

    if properties.get(ENABLE_RECORDING).map(String::as_str) == Some("true") {
        let path = Path::new(ctx.recording_dir).join(&session.id);
        config.set(RECORDING_PATH, path.to_string_lossy().into_owned());
        config.set(CREATE_RECORDING_PATH, "true".to_string());
    } else {
        config.set(RECORDING_PATH, None);
    }

    let username = stored_value(session.username.as_deref());
    let password = stored_value(session.password.as_deref());
    match session.protocol.as_str() {
        "rdp" => {
            config.set("username", username);
            config.set("password", password);
            config.set("security", "any".to_string());
            config.set("ignore-cert", "true".to_string());
            config.set("create-drive-path", "true".to_string());
            config.set("resize-method", "reconnect".to_string());
            for key in RDP_KEYS {
                config.set_stored(key, properties);
            }
        }
        "ssh" => {
            config.set("username", username);
            match stored_value(session.private_key.as_deref()) {
                Some(key) => {
                    config.set("private-key", key);
                    config.set("passphrase", stored_value(session.passphrase.as_deref()));
                }
                None => config.set("password", password),
            }
            for key in TERMINAL_KEYS {
                config.set_stored(key, properties);
            }
        }
        "vnc" => {
            config.set("username", username);
            config.set("password", password);
        }
        "telnet" => {
            config.set("username", username);
            config.set("password", password);
            for key in TERMINAL_KEYS {
                config.set_stored(key, properties);
            }
        }
        "kubernetes" => {
            for key in TERMINAL_KEYS {
                config.set_stored(key, properties);
            }
        }
        _ => {}
    }

    config.set("hostname", session.ip.clone());
    config.set("port", session.port.to_string());

    apply_attributes(&mut config, session, attributes, ctx);
    config
}

/// Apply per-asset attribute overrides, resolving drive mapping.
fn apply_attributes(
    config: &mut Configuration,
    session: &SessionDescriptor,
    attributes: &HashMap<String, String>,
    ctx: &BuildContext<'_>,
) {
    for (key, value) in attributes {
        match key.as_str() {
            DRIVE_PATH => {}
            ENABLE_DRIVE if value == "true" => {
                let storage_id = stored_value(attributes.get(DRIVE_PATH).map(String::as_str))
                    .unwrap_or_else(|| session.creator.clone());
                let path = Path::new(ctx.drive_dir).join(storage_id);
                debug!(
                    session_id = %session.id,
                    "Mapping drive for {}:{} at {}",
                    session.ip,
                    session.port,
                    path.display()
                );
                config.set(ENABLE_DRIVE, "true".to_string());
                config.set(DRIVE_NAME, "Filesystem".to_string());
                config.set(DRIVE_PATH, path.to_string_lossy().into_owned());
            }
            _ => config.set(key.clone(), stored_value(Some(value))),
        }
    }
}
