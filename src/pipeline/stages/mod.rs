//! The seven pipeline stages.

pub mod boundary;
pub mod enrich;
pub mod normalise;
pub mod package;
pub mod parse;
pub mod repair;
pub mod threshold_sweep;
