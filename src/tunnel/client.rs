//! guacd tunnel client.
//!
//! A [`Tunnel`] is one connection to guacd. [`Tunnel::open`] dials and runs
//! the handshake; after that the tunnel is a plain instruction pipe: `read`
//! yields raw frames exactly as guacd sent them and `write_raw` forwards
//! browser frames untouched.
//!
//! The read and write halves are locked independently so a relay can pump
//! both directions at once. `close` may be called from any task, any number
//! of times; it wakes up pending reads and writes, which then fail with
//! [`TunnelError::Closed`].

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::instruction::{Instruction, InstructionCodec, InstructionError};
use super::params::Configuration;

/// Protocol version announced for `VERSION_*` arguments.
pub const PROTOCOL_VERSION: &str = "VERSION_1_3_0";

const AUDIO_MIMETYPES: [&str; 2] = ["audio/L8", "audio/L16"];
const IMAGE_MIMETYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to connect to guacd at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("guacd handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("expected '{expected}' instruction, got '{got}'")]
    UnexpectedInstruction { expected: &'static str, got: String },
    #[error("guacd did not assign a connection id")]
    MissingConnectionId,
    #[error("tunnel closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] InstructionError),
}

/// Tunnel lifecycle. A [`Tunnel`] value only exists once the handshake has
/// finished, so it starts out `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Ready,
    Closed,
}

/// Options that apply to every handshake, independent of the connection.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub timeout: Duration,
    pub timezone: Option<String>,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            timezone: None,
        }
    }
}

pub struct Tunnel {
    uuid: String,
    reader: Mutex<Option<FramedRead<BoxReader, InstructionCodec>>>,
    writer: Mutex<Option<FramedWrite<BoxWriter, InstructionCodec>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Dial guacd at `addr` and run the handshake.
    pub async fn open(
        addr: &str,
        config: &Configuration,
        options: &HandshakeOptions,
    ) -> Result<Self, TunnelError> {
        let stream = tokio::time::timeout(options.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TunnelError::HandshakeTimeout(options.timeout))?
            .map_err(|source| TunnelError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on guacd stream: {e}");
        }
        Self::handshake(stream, config, options).await
    }

    /// Run the handshake over an already connected stream.
    pub async fn handshake<S>(
        stream: S,
        config: &Configuration,
        options: &HandshakeOptions,
    ) -> Result<Self, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(Box::new(read_half) as BoxReader, InstructionCodec);
        let mut writer = FramedWrite::new(Box::new(write_half) as BoxWriter, InstructionCodec);

        let mut negotiation = Negotiation {
            reader: &mut reader,
            writer: &mut writer,
        };
        let uuid = tokio::time::timeout(options.timeout, negotiation.run(config, options))
            .await
            .map_err(|_| TunnelError::HandshakeTimeout(options.timeout))??;
        debug!(connection_id = %uuid, "guacd handshake complete");

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            uuid,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            shutdown,
        })
    }

    /// Connection id assigned by guacd in the `ready` instruction.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn state(&self) -> TunnelState {
        if *self.shutdown.borrow() {
            TunnelState::Closed
        } else {
            TunnelState::Ready
        }
    }

    /// Read one complete instruction, waiting until one arrives.
    pub async fn read(&self) -> Result<Bytes, TunnelError> {
        let mut closed = self.shutdown.subscribe();
        if *closed.borrow_and_update() {
            return Err(TunnelError::Closed);
        }
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TunnelError::Closed)?;
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(e)) => Err(e.into()),
                None => Err(TunnelError::Closed),
            },
            () = wait_closed(&mut closed) => Err(TunnelError::Closed),
        }
    }

    /// Forward bytes that already hold complete instructions.
    pub async fn write_raw(&self, data: Bytes) -> Result<(), TunnelError> {
        let mut closed = self.shutdown.subscribe();
        if *closed.borrow_and_update() {
            return Err(TunnelError::Closed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TunnelError::Closed)?;
        tokio::select! {
            res = writer.send(data) => res.map_err(Into::into),
            () = wait_closed(&mut closed) => Err(TunnelError::Closed),
        }
    }

    pub async fn write(&self, instruction: &Instruction) -> Result<(), TunnelError> {
        self.write_raw(instruction.encode()).await
    }

    /// Close the connection. Pending reads and writes fail with `Closed`.
    pub async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.get_mut().shutdown().await {
                debug!(connection_id = %self.uuid, "guacd stream shutdown: {e}");
            }
        }
        self.reader.lock().await.take();
        debug!(connection_id = %self.uuid, "Tunnel closed");
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|closed| *closed).await.is_err() {
        // Sender gone means the tunnel itself was dropped.
        std::future::pending::<()>().await;
    }
}

/// Handshake state machine, borrowed over the framed halves.
struct Negotiation<'a> {
    reader: &'a mut FramedRead<BoxReader, InstructionCodec>,
    writer: &'a mut FramedWrite<BoxWriter, InstructionCodec>,
}

impl Negotiation<'_> {
    async fn run(
        &mut self,
        config: &Configuration,
        options: &HandshakeOptions,
    ) -> Result<String, TunnelError> {
        let result = self.exchange(config, options).await;
        if let Err(e) = &result {
            warn!(selector = config.selector(), "guacd handshake failed: {e}");
        }
        result
    }

    async fn exchange(
        &mut self,
        config: &Configuration,
        options: &HandshakeOptions,
    ) -> Result<String, TunnelError> {
        self.writer
            .send(Instruction::new("select", [config.selector()]))
            .await?;

        let args = self.expect("args").await?;

        let size = [config.width, config.height, config.dpi].map(|v| v.to_string());
        self.writer.feed(Instruction::new("size", size)).await?;
        self.writer
            .feed(Instruction::new("audio", AUDIO_MIMETYPES))
            .await?;
        self.writer
            .feed(Instruction::new("video", Vec::<String>::new()))
            .await?;
        self.writer
            .feed(Instruction::new("image", IMAGE_MIMETYPES))
            .await?;
        if let Some(tz) = &options.timezone {
            self.writer
                .feed(Instruction::new("timezone", [tz.as_str()]))
                .await?;
        }

        let values: Vec<&str> = args
            .args
            .iter()
            .map(|name| {
                if name.contains("VERSION") {
                    PROTOCOL_VERSION
                } else {
                    config.wire_value(name)
                }
            })
            .collect();
        self.writer.send(Instruction::new("connect", values)).await?;

        let ready = self.expect("ready").await?;
        ready
            .args
            .into_iter()
            .next()
            .filter(|id| !id.is_empty())
            .ok_or(TunnelError::MissingConnectionId)
    }

    async fn expect(&mut self, opcode: &'static str) -> Result<Instruction, TunnelError> {
        let frame = self.reader.next().await.ok_or(TunnelError::Closed)??;
        let instruction = Instruction::parse(&frame)?;
        if instruction.opcode != opcode {
            return Err(TunnelError::UnexpectedInstruction {
                expected: opcode,
                got: instruction.to_string(),
            });
        }
        Ok(instruction)
    }
}
