//! stackd library
//!
//! Store operation orchestrator: installs, redeploys and uninstalls
//! compose-based apps with live progress and update detection.

pub mod app;
pub mod cache;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod templates;
pub mod utils;
