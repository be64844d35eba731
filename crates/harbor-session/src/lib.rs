#![forbid(unsafe_code)]

//! Session supervisor: the durable wrapper around the BitTorrent engine.
//!
//! The supervisor owns the engine, the live torrent map, per-torrent client
//! data, periodic timers, and the one-shot callback registry. It runs as a
//! single worker task that serializes every mutation: lifecycle commands
//! arrive over a channel, engine alerts are drained in arrival order, and
//! domain events are published to the shared bus.
//!
//! Layout: `supervisor.rs` (worker loop, alert handlers, shutdown protocol),
//! `mediainfo.rs` (head-piece prefetch state machine), `client_data.rs`
//! (client-owned per-torrent state), `params_file.rs` (DHT state
//! persistence).

pub mod client_data;
pub mod mediainfo;
pub mod options;
pub mod params_file;
mod supervisor;

pub use client_data::TorrentClientData;
pub use mediainfo::{ExternalMediaInfoParser, MediaInfoOptions, MediaInfoParser};
pub use options::SessionOptions;
pub use supervisor::Session;
