//! Shared test utilities for drivefs-fuse integration tests.

pub mod harness;

#[allow(unused_imports)]
pub use harness::*;
