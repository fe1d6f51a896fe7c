use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Service at {address} unavailable after {attempts} attempts")]
    ServiceUnavailable { address: String, attempts: u32 },

    #[error("Receiver never printed {marker:?} after {attempts} attempts")]
    ReceiverNotReady { marker: String, attempts: u32 },

    #[error("Process {name} failed with {}", describe_code(.code))]
    ProcessFailed { name: String, code: Option<i32> },

    #[error("Process {name} did not exit within {timeout:?}")]
    ProcessTimedOut { name: String, timeout: Duration },

    #[error("Missing expected content: {}", quote_all(.missing))]
    MissingExpectedContent { missing: Vec<String>, content: String },

    #[error("Provisioning error: {0}")]
    Provision(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Interrupted by shutdown signal")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Process exit code the CLI reports for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            HarnessError::Io(_) => 1,
            HarnessError::Config(_) => 2,
            HarnessError::ServiceUnavailable { .. } => 3,
            HarnessError::ProcessFailed { .. } => 4,
            HarnessError::ProcessTimedOut { .. } => 5,
            HarnessError::MissingExpectedContent { .. } => 6,
            HarnessError::Provision(_) => 7,
            HarnessError::ReceiverNotReady { .. } => 8,
            HarnessError::Interrupted => 130,
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "termination by signal".to_owned(),
    }
}

fn quote_all(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("{item:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A teardown step that did not complete.
///
/// Kept apart from [`HarnessError`]: by the time cleanup runs the verdict is
/// already fixed, so these are only ever reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cleanup step {step} failed: {reason}")]
pub struct CleanupFailed {
    pub step: &'static str,
    pub reason: String,
}

pub type Result<T> = std::result::Result<T, HarnessError>;
