//! Shared test utilities for the ircprobe workspace
//!
//! Provides a provisioner that fakes the server with a local listener and
//! shell-script stand-ins for the receiver and sender. Only available when
//! the "test-utils" feature is enabled.

use std::net::TcpListener;
use std::path::Path;
use std::sync::Mutex;

use crate::config::Config;
use crate::error::{HarnessError, Result};
use crate::supervisor::{ServerProvisioner, ServerSpec};

/// One call made against a [`FakeProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionCall {
    EnsureClean(String),
    Start(String),
    Stop(String),
}

/// Stands in for docker: `start` binds the resolved host port so the
/// readiness probe has something to connect to.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    calls: Mutex<Vec<ProvisionCall>>,
    listener: Mutex<Option<TcpListener>>,
    never_listen: bool,
    fail_ensure_clean: bool,
    fail_start: bool,
    fail_stop: bool,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start succeeds without ever opening the port.
    pub fn never_listen(mut self) -> Self {
        self.never_listen = true;
        self
    }

    pub fn fail_ensure_clean(mut self) -> Self {
        self.fail_ensure_clean = true;
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn fail_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn calls(&self) -> Vec<ProvisionCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn stop_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ProvisionCall::Stop(_)))
            .count()
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .map(|listener| listener.is_some())
            .unwrap_or(false)
    }

    fn record(&self, call: ProvisionCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl ServerProvisioner for FakeProvisioner {
    async fn ensure_clean(&self, name: &str) -> Result<()> {
        self.record(ProvisionCall::EnsureClean(name.to_owned()));
        if self.fail_ensure_clean {
            return Err(HarnessError::Provision("ensure_clean refused".to_owned()));
        }
        Ok(())
    }

    async fn start(&self, spec: &ServerSpec) -> Result<()> {
        self.record(ProvisionCall::Start(spec.name.clone()));
        if self.fail_start {
            return Err(HarnessError::Provision("port already allocated".to_owned()));
        }
        if !self.never_listen {
            let listener = TcpListener::bind((spec.host.as_str(), spec.host_port))?;
            if let Ok(mut slot) = self.listener.lock() {
                *slot = Some(listener);
            }
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.record(ProvisionCall::Stop(name.to_owned()));
        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }
        if self.fail_stop {
            return Err(HarnessError::Provision("daemon not responding".to_owned()));
        }
        Ok(())
    }
}

/// Receiver script: announces the join, then prints whatever the sender
/// drops into `$SPOOL`.
pub const RECEIVER_SCRIPT: &str = r#"echo "joined #test"
while :; do
  if [ -f "$SPOOL" ]; then cat "$SPOOL"; rm -f "$SPOOL"; fi
  sleep 0.05
done"#;

/// Sender script: publishes both messages in one atomic rename.
pub const SENDER_SCRIPT: &str = r#"printf 'Hello World\nGoodbye world\n' > "$SPOOL.tmp" && mv "$SPOOL.tmp" "$SPOOL""#;

/// Configuration for a fast local run against [`FakeProvisioner`].
///
/// Both clients are `sh -c` scripts sharing `spool` as their "server".
pub fn local_config(spool: &Path) -> Config {
    let spool = spool.to_string_lossy().into_owned();
    let mut config = Config::default();

    config.server.port = 0;
    config.readiness.max_attempts = 3;
    config.readiness.attempt_timeout_ms = 200;
    config.readiness.retry_delay_ms = 20;
    config.readiness.settle_ms = 0;

    config.receiver.program = "sh".to_owned();
    config.receiver.args = vec!["-c".to_owned(), RECEIVER_SCRIPT.to_owned()];
    config.receiver.env = vec![("SPOOL".to_owned(), spool.clone())];
    config.receiver.ready_attempts = 50;
    config.receiver.ready_delay_ms = 20;
    config.receiver.settle_ms = 0;

    config.sender.program = "sh".to_owned();
    config.sender.args = vec!["-c".to_owned(), SENDER_SCRIPT.to_owned()];
    config.sender.env = vec![("SPOOL".to_owned(), spool)];
    config.sender.timeout_secs = 10;

    config.verify.settle_ms = 300;
    config
}

/// Replace a client's script, keeping the rest of its settings.
pub fn with_script(args: &mut Vec<String>, script: &str) {
    *args = vec!["-c".to_owned(), script.to_owned()];
}
