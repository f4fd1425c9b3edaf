//! Connections to guacd.
//!
//! - [`instruction`]: wire framing and the stream codec.
//! - [`params`]: what gets sent in the handshake.
//! - [`client`]: the handshake and the resulting instruction pipe.
//! - [`relay`]: pumping one browser socket through one tunnel.

pub mod client;
pub mod instruction;
pub mod params;
pub mod relay;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{HandshakeOptions, Tunnel, TunnelError, TunnelState};
pub use params::Configuration;
