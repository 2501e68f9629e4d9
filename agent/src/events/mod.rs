//! Operation event fan-out

pub mod bus;
