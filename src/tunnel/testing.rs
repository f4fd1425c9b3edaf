//! Fake guacd used by tests across the crate.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::client::{HandshakeOptions, Tunnel};
use super::instruction::{Instruction, InstructionCodec};
use super::params::Configuration;

pub struct Daemon<S> {
    pub rx: FramedRead<ReadHalf<S>, InstructionCodec>,
    pub tx: FramedWrite<WriteHalf<S>, InstructionCodec>,
}

impl<S: AsyncRead + AsyncWrite> Daemon<S> {
    pub fn new(stream: S) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            rx: FramedRead::new(r, InstructionCodec),
            tx: FramedWrite::new(w, InstructionCodec),
        }
    }

    pub async fn recv(&mut self) -> Option<Instruction> {
        let frame = self.rx.next().await?.ok()?;
        Instruction::parse(&frame).ok()
    }

    pub async fn send(&mut self, instruction: Instruction) {
        self.tx.send(instruction).await.unwrap();
    }

    pub async fn send_raw(&mut self, data: &'static [u8]) {
        self.tx.send(Bytes::from_static(data)).await.unwrap();
    }

    /// Play the guacd side of a handshake, answering `ready` with `ready`
    /// as its arguments. Returns everything the client sent up to `connect`.
    pub async fn serve_handshake(&mut self, ready: &[&str]) -> Vec<Instruction> {
        let mut seen = Vec::new();
        let Some(select) = self.recv().await else {
            return seen;
        };
        seen.push(select);
        self.send(Instruction::new(
            "args",
            ["VERSION_1_3_0", "hostname", "port", "password"],
        ))
        .await;
        while let Some(ins) = self.recv().await {
            let done = ins.opcode == "connect";
            seen.push(ins);
            if done {
                break;
            }
        }
        self.send(Instruction::new("ready", ready.iter().copied()))
            .await;
        seen
    }
}

pub fn options() -> HandshakeOptions {
    HandshakeOptions {
        timeout: std::time::Duration::from_secs(5),
        timezone: Some("Europe/Paris".to_string()),
    }
}

/// A tunnel over an in-memory pipe, already past the handshake.
pub async fn duplex_tunnel(connection_id: &'static str) -> (Arc<Tunnel>, Daemon<DuplexStream>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let daemon = tokio::spawn(async move {
        let mut d = Daemon::new(server);
        d.serve_handshake(&[connection_id]).await;
        d
    });
    let tunnel = Tunnel::handshake(client, &Configuration::new("ssh"), &options())
        .await
        .unwrap();
    (Arc::new(tunnel), daemon.await.unwrap())
}

/// Frame received by [`spawn_guacd`] from a client after the handshake.
#[derive(Debug)]
pub struct Received {
    pub selector: String,
    pub frame: Bytes,
}

/// Listen on a local port and handshake every connection. New connections
/// get ids `$1`, `$2`, ...; joins keep the id they selected. After `ready`
/// the daemon sends one `sync` and reports every frame it receives.
pub async fn spawn_guacd() -> (SocketAddr, mpsc::UnboundedReceiver<Received>) {
    let (addr, rx, _) = spawn_counted_guacd().await;
    (addr, rx)
}

/// [`spawn_guacd`], also counting the connections it accepted.
pub async fn spawn_counted_guacd() -> (
    SocketAddr,
    mpsc::UnboundedReceiver<Received>,
    Arc<AtomicUsize>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let counter = Arc::new(AtomicUsize::new(0));
    let accepts = Arc::new(AtomicUsize::new(0));
    let accepted = accepts.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut d = Daemon::new(stream);
                let Some(select) = d.rx.next().await.and_then(Result::ok) else {
                    return;
                };
                let Ok(select) = Instruction::parse(&select) else {
                    return;
                };
                let selector = select.args.first().cloned().unwrap_or_default();
                let id = if selector.starts_with('$') {
                    selector.clone()
                } else {
                    format!("${}", counter.fetch_add(1, Ordering::SeqCst) + 1)
                };
                d.send(Instruction::new("args", ["VERSION_1_3_0", "hostname"]))
                    .await;
                while let Some(ins) = d.recv().await {
                    if ins.opcode == "connect" {
                        break;
                    }
                }
                d.send(Instruction::new("ready", [id.as_str()])).await;
                d.send_raw(b"4.sync,1.1;").await;
                while let Some(Ok(frame)) = d.rx.next().await {
                    let _ = tx.send(Received {
                        selector: selector.clone(),
                        frame,
                    });
                }
            });
        }
    });
    (addr, rx, accepts)
}
