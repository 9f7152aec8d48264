//! Playlist handling
//!
//! Manifests written by the encoder reference their media files by bare
//! name. Before a manifest is served those references are rewritten into
//! URLs that re-enter the playback endpoint with a `file` selector.

pub mod rewrite;

pub use rewrite::{base_url, rewrite_manifest};
