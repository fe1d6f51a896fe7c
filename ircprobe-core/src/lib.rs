#![allow(clippy::cargo_common_metadata)]

pub mod config;
pub mod error;
pub mod harness;
pub mod process;
pub mod readiness;
pub mod supervisor;
pub mod verify;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use config::Config;
pub use error::{CleanupFailed, HarnessError, Result};
pub use harness::{Harness, Outcome, RunReport, Stage};
