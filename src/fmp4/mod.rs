//! Fragmented MP4 container support
//!
//! - `boxes`: generic box reading and writing
//! - `init`: container header (`ftyp` + `moov`)
//! - `part`: media fragments (`moof` + `mdat`)

pub mod boxes;
pub mod init;
pub mod part;

pub use init::{Init, InitTrack};
pub use part::{FragmentTrack, Part, PartSample, PartTrack, SampleRef};
