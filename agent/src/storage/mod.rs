//! Durable storage

pub mod action_log;
pub mod layout;
pub mod operations;
pub mod settings;
pub mod stacks;
