//! HTTP API models for the stackd store agent

pub mod models;

pub use models::*;
