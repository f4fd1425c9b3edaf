//! WebSocket endpoints for remote sessions.
//!
//! ## Connection lifecycle
//!
//! 1. The browser connects to `GET /api/sessions/{id}/tunnel?token=<api_key>`
//!    (subject) or `/api/sessions/{id}/tunnel-monitor?token=<api_key>`
//!    (observer), negotiating the `guacamole` subprotocol. The token is
//!    checked before the upgrade completes.
//! 2. Setup runs after the upgrade. Any failure closes the socket with a
//!    [`CloseCode`] and nothing else is touched.
//! 3. Once set up, the relay pumps guacd instructions both ways until either
//!    side ends. Subjects then close the whole session through the registry;
//!    observers only remove themselves.
//!
//! ## Outgoing traffic
//!
//! The socket's sink is owned by a writer task. Frames from guacd reach it
//! over a bounded channel; close requests over a [`SocketCloser`], which the
//! writer checks first. Closing sends the guacd `error` instruction (for any
//! code other than `Normal`) and `disconnect` before the close frame, so the
//! browser client can show why the session ended.
//!
//! ## Query parameters
//!
//! | Name     | Endpoint | Description                          |
//! |----------|----------|--------------------------------------|
//! | `token`  | both     | API key                              |
//! | `width`  | subject  | display width in pixels              |
//! | `height` | subject  | display height in pixels             |
//! | `dpi`    | subject  | display resolution                   |


use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::gateway::GatewayError;
use crate::sessions::endpoint::{CloseCode, CloseRequest, Endpoint, Role, SocketCloser};
use crate::ssh::{SshAuth, SshClient};
use crate::store::SessionStatus;
use crate::tunnel::instruction::Instruction;
use crate::tunnel::params::{self, BuildContext, Configuration, DEFAULT_DPI};
use crate::tunnel::relay::{self, InputPolicy, RelayExit};
use crate::tunnel::{HandshakeOptions, Tunnel};
use crate::AppState;

/// Subprotocol spoken by the browser client.
pub const SUBPROTOCOL: &str = "guacamole";

/// Frames queued for one browser before the guacd pump waits.
const OUTBOUND_QUEUE: usize = 256;

/// Query parameters for both WebSocket endpoints.
#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
    /// API key passed as a query parameter (browsers can't set headers on a
    /// WebSocket upgrade).
    pub token: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub dpi: Option<u32>,
}

fn authorized(state: &AppState, query: &TunnelQuery) -> bool {
    crate::auth::constant_time_eq(state.config.auth.api_key.as_bytes(), query.token.as_bytes())
}

/// `GET /api/sessions/{id}/tunnel`: subject WebSocket.
pub async fn subject_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TunnelQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&state, &query) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    let span = info_span!("subject", session_id = %session_id);
    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| handle_subject(socket, state, session_id, query).instrument(span))
}

/// `GET /api/sessions/{id}/tunnel-monitor`: observer WebSocket.
pub async fn observer_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TunnelQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&state, &query) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    let observer_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!("observer", session_id = %session_id, observer_id = %observer_id);
    ws.protocols([SUBPROTOCOL]).on_upgrade(move |socket| {
        handle_observer(socket, state, session_id, observer_id).instrument(span)
    })
}

/// Split a socket: the sink goes to a writer task, the stream stays with the
/// caller along with the means to feed and close the writer.
fn attach(socket: WebSocket) -> (SplitStream<WebSocket>, mpsc::Sender<Bytes>, SocketCloser) {
    let (sink, stream) = socket.split();
    let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (closer, close_rx) = SocketCloser::channel();
    tokio::spawn(socket_writer(sink, frames_rx, close_rx).in_current_span());
    (stream, frames_tx, closer)
}

/// Own the socket sink. Close requests take priority over queued frames; once
/// the frame channel ends the writer keeps waiting for a close request, and
/// stops on its own when the closer is dropped.
async fn socket_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<Bytes>,
    mut close: watch::Receiver<Option<CloseRequest>>,
) {
    let mut frames_open = true;
    loop {
        tokio::select! {
            biased;
            changed = close.changed() => {
                if changed.is_err() {
                    break;
                }
                let request = close.borrow_and_update().clone();
                if let Some(request) = request {
                    send_close(&mut sink, &request).await;
                    return;
                }
            }
            frame = frames.recv(), if frames_open => match frame {
                Some(frame) => {
                    if sink.send(frame_message(frame)).await.is_err() {
                        debug!("Browser socket gone, writer stopping");
                        return;
                    }
                }
                None => frames_open = false,
            },
        }
    }
    let _ = sink.close().await;
}

/// guacd traffic is text; anything that isn't valid UTF-8 goes out as binary.
fn frame_message(frame: Bytes) -> Message {
    match std::str::from_utf8(&frame) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(frame),
    }
}

async fn send_close(sink: &mut SplitSink<WebSocket, Message>, request: &CloseRequest) {
    let mut frames = Vec::with_capacity(2);
    if request.code != CloseCode::Normal {
        frames.push(Instruction::new(
            "error",
            [request.reason.clone(), request.code.to_string()],
        ));
    }
    frames.push(Instruction::new("disconnect", Vec::<String>::new()));
    for instruction in frames {
        if sink
            .send(Message::Text(instruction.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }
    let frame = CloseFrame {
        code: request.code.ws_code(),
        reason: request.code.frame_reason(&request.reason).into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!("Close frame not delivered: {e}");
    }
}

fn handshake_options(state: &AppState) -> HandshakeOptions {
    HandshakeOptions {
        timeout: Duration::from_secs(state.config.guacd.handshake_timeout_secs),
        timezone: state.config.guacd.timezone.clone(),
    }
}

fn gateway_close_code(err: &GatewayError) -> CloseCode {
    match err {
        GatewayError::CreateFailed(_) => CloseCode::AccessGatewayCreateError,
        GatewayError::NotFound(_) | GatewayError::Unavailable(_) => {
            CloseCode::AccessGatewayUnavailable
        }
        GatewayError::InUse(_) => CloseCode::NewTunnelError,
    }
}

/// Drop the forward a failed setup opened, leaving any other one alone.
async fn release_forward(state: &AppState, session_id: &str, local_port: Option<u16>) {
    if let Some(port) = local_port {
        state.gateways.release_tunnel(session_id, port).await;
    }
}

fn subject_exit(exit: RelayExit) -> (CloseCode, &'static str) {
    match exit {
        RelayExit::BrowserClosed | RelayExit::BrowserFailed => (CloseCode::Normal, "user exit"),
        RelayExit::TunnelClosed => (CloseCode::TunnelClosed, "remote connection closed"),
    }
}

async fn handle_subject(socket: WebSocket, state: AppState, session_id: String, query: TunnelQuery) {
    let (inbound, frames, closer) = attach(socket);
    let fail = |code: CloseCode, reason: String| {
        warn!(code = code.as_i32(), "Session setup failed: {reason}");
        closer.close(code, &reason);
    };

    let Some(mut session) = state.store.get_session(&session_id).await else {
        fail(CloseCode::NotFoundSession, "session not found".to_string());
        return;
    };
    if state.registry.contains(&session_id).await {
        fail(CloseCode::NewTunnelError, "session already active".to_string());
        return;
    }
    if let Some(asset) = state.store.asset(&session.asset_id).await {
        if !asset.active {
            fail(CloseCode::AssetNotActive, "asset inactive".to_string());
            return;
        }
    }

    let mut forward_port = None;
    if let Some(gateway_id) = session.access_gateway_id.clone() {
        match state
            .gateways
            .open_tunnel(&gateway_id, &session_id, &session.ip, session.port)
            .await
        {
            Ok((ip, port)) => {
                session.ip = ip;
                session.port = port;
                forward_port = Some(port);
            }
            Err(e) => {
                fail(gateway_close_code(&e), e.to_string());
                return;
            }
        }
    }

    let attributes = state.store.asset_attributes(&session.asset_id).await;
    let properties = state.store.properties().await;
    let ctx = BuildContext {
        recording_dir: &state.config.guacd.recording_dir,
        drive_dir: &state.config.guacd.drive_dir,
    };
    let mut config = params::build(&session, &properties, &attributes, &ctx);
    config.set_display(
        query.width.unwrap_or(0),
        query.height.unwrap_or(0),
        query.dpi.unwrap_or(0),
    );
    let recording = config.get(params::RECORDING_PATH).map(str::to_string);

    let addr = state.config.guacd.addr();
    debug!(guacd = %addr, asset = %format!("{}:{}", session.ip, session.port), "Opening guacd tunnel");
    let tunnel = match Tunnel::open(&addr, &config, &handshake_options(&state)).await {
        Ok(tunnel) => std::sync::Arc::new(tunnel),
        Err(e) => {
            fail(CloseCode::NewTunnelError, e.to_string());
            release_forward(&state, &session_id, forward_port).await;
            return;
        }
    };

    let ssh = if session.protocol == "ssh" && state.config.guacd.ssh_file_client {
        let auth = SshAuth {
            username: params::stored_value(session.username.as_deref()).unwrap_or_default(),
            password: params::stored_value(session.password.as_deref()),
            private_key: params::stored_value(session.private_key.as_deref()),
            passphrase: params::stored_value(session.passphrase.as_deref()),
        };
        match SshClient::connect(&session.ip, session.port, &auth, handshake_options(&state).timeout)
            .await
        {
            Ok(client) => Some(client),
            Err(e) => {
                tunnel.close().await;
                fail(CloseCode::NewSshClientError, e.to_string());
                release_forward(&state, &session_id, forward_port).await;
                return;
            }
        }
    } else {
        None
    };

    let mut subject = Endpoint::new(session_id.clone(), Role::Subject, tunnel.clone(), closer);
    if let Some(ssh) = ssh {
        subject = subject.with_ssh_client(ssh);
    }
    if let Err(e) = state.registry.add(&session_id, subject).await {
        // The registry already closed the rejected endpoint.
        warn!("Session setup failed: {e}");
        release_forward(&state, &session_id, forward_port).await;
        return;
    }

    let connection_id = tunnel.uuid().to_string();
    state
        .store
        .update_session(&session_id, |s| {
            s.connection_id = Some(connection_id.clone());
            s.width = config.width;
            s.height = config.height;
            s.status = SessionStatus::Connecting;
            s.reviewed = recording.is_none();
            s.recording = recording;
        })
        .await;
    info!(connection_id = %connection_id, "Session connecting");

    let (first_tx, first_rx) = oneshot::channel();
    let store = state.store.clone();
    let id = session_id.clone();
    tokio::spawn(
        async move {
            if first_rx.await.is_ok() {
                if let Err(e) = store.mark_connected(&id).await {
                    debug!("Not marking connected: {e}");
                }
            }
        }
        .in_current_span(),
    );

    let exit = relay::run(inbound, tunnel, frames, InputPolicy::Interactive, Some(first_tx)).await;
    let (code, reason) = subject_exit(exit);
    debug!(?exit, "Subject relay ended");
    state.registry.close_session(&session_id, code, reason).await;
}

async fn handle_observer(socket: WebSocket, state: AppState, session_id: String, observer_id: String) {
    let (inbound, frames, closer) = attach(socket);
    let fail = |code: CloseCode, reason: &str| {
        warn!(code = code.as_i32(), "Observer setup failed: {reason}");
        closer.close(code, reason);
    };

    let session = state.store.get_session(&session_id).await;
    let Some(session) = session.filter(|s| s.status == SessionStatus::Connected) else {
        fail(CloseCode::AssetNotActive, "session offline");
        return;
    };
    let Some(connection_id) = session.connection_id.clone() else {
        fail(CloseCode::AssetNotActive, "session offline");
        return;
    };
    if !state.registry.contains(&session_id).await {
        fail(CloseCode::NotFoundSession, "session not found");
        return;
    }

    let mut config = Configuration::join(connection_id);
    config.set_display(session.width, session.height, DEFAULT_DPI);
    let tunnel = match Tunnel::open(&state.config.guacd.addr(), &config, &handshake_options(&state)).await {
        Ok(tunnel) => std::sync::Arc::new(tunnel),
        Err(e) => {
            fail(CloseCode::NewTunnelError, &e.to_string());
            return;
        }
    };

    let observer = Endpoint::new(observer_id.clone(), Role::Observer, tunnel.clone(), closer);
    if let Err(e) = state.registry.join(&session_id, observer).await {
        debug!("Observer rejected: {e}");
        return;
    }
    debug!(connection_id = %tunnel.uuid(), "Observer relay starting");

    let exit = relay::run(
        inbound,
        tunnel,
        frames,
        state.config.observer.input,
        None,
    )
    .await;
    debug!(?exit, "Observer relay ended");
    state.registry.leave(&session_id, &observer_id).await;
}
