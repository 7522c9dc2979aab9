//! WebSocket rendezvous relay for peer-to-peer call setup.
//!
//! Clients open a socket with a short-lived token, are registered under the
//! identity the token names, and exchange `call-request` / `offer` /
//! `answer` / `candidate` / `call-accepted` messages addressed by
//! `recipientId`. The relay stamps every message with the sender's verified
//! identity and forwards it if the recipient is online; otherwise it is
//! dropped.

pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod telemetry;

pub use auth::{JwtVerifier, TokenVerifier};
pub use config::Config;
pub use protocol::{Identity, SignalKind};
pub use registry::{ChannelHandle, Registry};
pub use router::{HangupNotice, SignalRouter};
pub use server::{AppState, ChannelSettings, app};
