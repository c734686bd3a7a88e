//! Lyrebird core - data model and content pipeline for the playback proxy.
//!
//! This crate holds everything that is independent of the proxy runtime:
//!
//! - The inventory data model ([`types`]): resources, domains, the manifest
//!   shape and the chunked playback representation.
//! - The URL <-> file path codec ([`resource_path`]) that makes the on-disk
//!   store browsable and round-trippable.
//! - The content-encoding codec ([`coding`]) for the six wire compression
//!   formats.
//! - Charset detection and conversion ([`charset`]) so bodies are stored as
//!   UTF-8 and restored to their original bytes on playback.
//! - The minify/beautify optimizer ([`optimize`]).

pub mod charset;
pub mod coding;
pub mod error;
pub mod optimize;
pub mod resource_path;
pub mod types;

pub use error::{Error, Result};
