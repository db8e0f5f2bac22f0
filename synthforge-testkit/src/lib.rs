//! Test doubles and fixtures for synthforge.

mod fixtures;
mod runner;

pub use fixtures::*;
pub use runner::*;
