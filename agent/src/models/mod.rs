//! Data models

pub mod operation;
pub mod stack;
pub mod template;
