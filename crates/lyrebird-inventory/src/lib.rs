//! Lyrebird inventory - the on-disk store and its playback-side loader.
//!
//! The inventory is a two-part layout under a base directory:
//!
//! ```text
//! <base>/inventory.json          # indented manifest, one Resource per key
//! <base>/contents/<path>         # decoded bodies, path-codec addressed
//! ```
//!
//! [`persistence`] writes it from recorded transactions (decode, charset
//! normalization, beautify, dedup by key), [`playback`] reads it back into
//! replayable transactions (re-encode, charset restore, timed chunks), and
//! [`chunking`] turns a body plus a recorded transfer rate into emission
//! deadlines.

pub mod chunking;
pub mod persistence;
pub mod playback;

pub use persistence::PersistenceManager;
pub use playback::PlaybackManager;
