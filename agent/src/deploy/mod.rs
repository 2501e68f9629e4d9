//! Store operation workflows and the container engine they drive

pub mod compose;
pub mod digest;
pub mod engine;
pub mod fsm;
pub mod orchestrator;
pub mod pull;
pub mod runner;
