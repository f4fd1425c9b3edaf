//! Pump one browser WebSocket through one guacd tunnel.
//!
//! Two loops run for the lifetime of an endpoint: tunnel→browser in a spawned
//! task, browser→tunnel inline. Whichever ends first decides the
//! [`RelayExit`]; the tunnel is then closed, which unblocks the other loop.
//! Nothing is retried here: callers map the exit to a close code and tear the
//! endpoint down.
//!
//! Frames from guacd are queued to the socket writer task as raw bytes.
//! Frames from the browser are forwarded verbatim, except that observers are
//! filtered through their [`InputPolicy`].

use std::sync::Arc;

use axum::extract::ws::Message;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::client::Tunnel;
use super::instruction;

/// Opcodes an observer sends when it tries to drive the remote session.
const INPUT_OPCODES: [&str; 11] = [
    "mouse",
    "key",
    "touch",
    "clipboard",
    "size",
    "file",
    "pipe",
    "blob",
    "end",
    "argv",
    "audio",
];

/// What browser input is forwarded to guacd.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputPolicy {
    /// Drop instructions that would interact with the remote session; keep
    /// protocol housekeeping (`sync`, `ack`, `nop`, `disconnect`, ...).
    #[default]
    ViewOnly,
    /// Forward everything.
    Interactive,
}

impl InputPolicy {
    /// Apply the policy to one browser message. `None` means nothing is left
    /// to forward.
    pub fn filter(self, data: Bytes) -> Option<Bytes> {
        if self == Self::Interactive {
            return Some(data);
        }
        let Ok(frames) = instruction::frames(&data) else {
            debug!("Dropping unparseable observer message ({} bytes)", data.len());
            return None;
        };
        let is_input = |frame: &[u8]| {
            instruction::opcode(frame).map_or(true, |op| INPUT_OPCODES.contains(&op))
        };
        if !frames.iter().any(|f| is_input(f)) {
            return (!data.is_empty()).then_some(data);
        }
        let mut kept = BytesMut::new();
        for frame in frames.into_iter().filter(|f| !is_input(f)) {
            kept.extend_from_slice(frame);
        }
        (!kept.is_empty()).then(|| kept.freeze())
    }
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The browser closed its socket.
    BrowserClosed,
    /// Reading from or writing to the browser socket failed.
    BrowserFailed,
    /// guacd closed the tunnel or tunnel I/O failed.
    TunnelClosed,
}

/// Run the relay until either side ends. Always closes `tunnel` before
/// returning. `on_first_frame` fires once the first guacd instruction has
/// been queued for the browser.
pub async fn run<S>(
    mut inbound: S,
    tunnel: Arc<Tunnel>,
    outbound: mpsc::Sender<Bytes>,
    policy: InputPolicy,
    on_first_frame: Option<oneshot::Sender<()>>,
) -> RelayExit
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut pump = tokio::spawn(pump_tunnel(tunnel.clone(), outbound, on_first_frame));

    let browser = async {
        while let Some(msg) = inbound.next().await {
            let data = match msg {
                Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) => return RelayExit::BrowserClosed,
                Ok(_) => continue,
                Err(e) => {
                    debug!(connection_id = %tunnel.uuid(), "Browser socket error: {e}");
                    return RelayExit::BrowserFailed;
                }
            };
            let Some(data) = policy.filter(data) else {
                continue;
            };
            if let Err(e) = tunnel.write_raw(data).await {
                debug!(connection_id = %tunnel.uuid(), "Tunnel write failed: {e}");
                return RelayExit::TunnelClosed;
            }
        }
        RelayExit::BrowserClosed
    };

    let exit = tokio::select! {
        exit = browser => exit,
        res = &mut pump => res.unwrap_or(RelayExit::TunnelClosed),
    };

    tunnel.close().await;
    pump.abort();
    exit
}

async fn pump_tunnel(
    tunnel: Arc<Tunnel>,
    outbound: mpsc::Sender<Bytes>,
    mut on_first_frame: Option<oneshot::Sender<()>>,
) -> RelayExit {
    loop {
        let frame = match tunnel.read().await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(connection_id = %tunnel.uuid(), "Tunnel read ended: {e}");
                return RelayExit::TunnelClosed;
            }
        };
        if outbound.send(frame).await.is_err() {
            return RelayExit::BrowserFailed;
        }
        if let Some(tx) = on_first_frame.take() {
            let _ = tx.send(());
        }
    }
}
