#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Multi-server IPMI v2.0 Serial-over-LAN console aggregator.
//!
//! The crate maintains persistent RMCP+ authenticated UDP sessions to many
//! BMCs, captures their serial consoles, detects boot lifecycle events,
//! broadcasts output to live subscribers, and persists cleaned logs.
//!
//! Core pieces:
//! - [`transport::SolTransport`]: one UDP socket per BMC, the RAKP-HMAC-SHA1
//!   bring-up, SOL payload activation, and the read/write/keepalive pumps.
//! - [`supervisor::Supervisor`]: per-server lifecycle - connect, backoff
//!   reconnect, credential changes, health restarts - and the fan-out of
//!   received bytes to subscribers, screen buffers, logs, and analytics.
//! - [`logs::LogWriter`]: append-only cleaned logs with incremental ANSI
//!   stripping, dedup, rotation, and retention.
//! - [`analytics::Analytics`]: a regex-driven boot state machine persisted
//!   across restarts.
//! - [`inventory`]: the external server-inventory adapter with a cold-start
//!   cache.
//!
//! Protocol and crypto details are kept internal.

/// Regex-driven boot lifecycle analytics.
pub mod analytics;
/// YAML daemon configuration.
pub mod config;
mod crypto;
mod debug;
/// Error taxonomy shared across the crate.
pub mod error;
/// Per-server fan-out of console bytes to subscribers.
pub mod hub;
/// Server inventory: source abstraction, registry, cache, and sync actor.
pub mod inventory;
/// Cleaned, rotating, deduplicated console logs.
pub mod logs;
mod protocol;
/// Best-effort Redfish session sweep.
pub mod redfish;
/// Rolling raw-byte screen buffers for subscriber catchup.
pub mod screen;
mod session;
/// Session supervision: lifecycle, reconnect, health.
pub mod supervisor;
/// The SOL transport: socket ownership and the background pumps.
pub mod transport;
mod types;

pub use crate::analytics::Analytics;
pub use crate::config::Config;
pub use crate::error::{Error, HandshakeStep, Result};
pub use crate::hub::{BroadcastHub, Subscription};
pub use crate::logs::LogWriter;
pub use crate::screen::ScreenBuffer;
pub use crate::supervisor::{ConsoleSink, Credentials, SessionStatus, Supervisor};
pub use crate::transport::{SolHandle, SolTransport, TransportConfig};
pub use crate::types::{PrivilegeLevel, RawResponse};
