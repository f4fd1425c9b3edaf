#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! gatekeep library: the building blocks behind the `gatekeep` binary.
//!
//! - `tunnel`: guacd wire codec, handshake client, parameter builder, relay
//! - `sessions`: live session registry, observer groups, close codes
//! - `gateway`: SSH access gateways and per-session port forwards
//! - `store`: in-memory session, asset and credential records
//! - `ws`: subject and observer WebSocket endpoints
//! - `routes`: REST handlers and the application router
//! - `auth`, `config`, `state`, `ssh`, `util`: supporting pieces

pub mod auth;
pub mod config;
pub mod gateway;
pub mod routes;
pub mod sessions;
pub mod ssh;
pub mod state;
pub mod store;
pub mod tunnel;
pub mod util;
pub mod ws;

pub use auth::ApiKey;
pub use config::Config;
pub use sessions::SessionRegistry;
pub use state::AppState;
