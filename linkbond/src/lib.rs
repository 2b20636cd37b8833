//! Demo overlay endpoints for the linkbond engine.
//!
//! - `proto`: sealed wire frames (header + ChaCha20-Poly1305)
//! - `config`: TOML demo configuration
//! - `runtime`: UDP endpoints wiring sockets, frames, and the engine

pub mod config;
pub mod proto;
pub mod runtime;
