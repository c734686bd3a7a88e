//! Lyrebird proxy - the MITM runtime around the inventory.
//!
//! Two interchangeable flow handlers plug into the hudsucker proxy:
//!
//! - [`RecordingHandler`] lets traffic through untouched while the
//!   [`Recorder`] captures every transaction; the inventory is flushed on
//!   graceful shutdown.
//! - [`PlaybackHandler`] answers matching requests from the [`Replayer`]
//!   with recorded status, headers, body and timing; misses are forwarded
//!   by the [`UpstreamClient`].
//!
//! TLS interception uses a self-signed root CA ([`CaManager`]) generated on
//! first run. The optional [`watcher`] reloads the replayer when the
//! inventory changes on disk.

mod ca;
mod error;
mod flow;
mod recorder;
mod replayer;
mod server;
mod upstream;
mod watcher;

pub use ca::{CaManager, CaManagerError};
pub use error::{ProxyError, Result};
pub use recorder::{Recorder, RecordingHandler};
pub use replayer::{PlaybackHandler, Replayer};
pub use server::{ProxyHandle, ProxyServer};
pub use upstream::UpstreamClient;
pub use watcher::watch_inventory;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Marker header added to every replayed response.
pub const PLAYBACK_HEADER: &str = "x-playback-proxy";
