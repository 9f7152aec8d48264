//! Integration tests
//!
//! - `fixtures`: synthetic recordings, a recording muxer and a fake encoder
//! - `e2e`: requests driven through the full router

pub mod fixtures;

mod e2e;
