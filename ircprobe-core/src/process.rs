//! Launching the client processes
//!
//! Both clients are started in their own process group so that a kill also
//! reaches anything they spawn themselves (`cargo run` forks the real
//! binary, for example).

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::process::{Child, Command};
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{ReceiverConfig, SenderConfig};
use crate::error::{HarnessError, Result};

/// What to run for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<Utf8PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn workdir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn receiver(config: &ReceiverConfig) -> Self {
        Self {
            name: "receiver".to_owned(),
            program: config.program.clone(),
            args: config.args.clone(),
            workdir: config.workdir.clone(),
            env: config.env.clone(),
        }
    }

    pub fn sender(config: &SenderConfig) -> Self {
        Self {
            name: "sender".to_owned(),
            program: config.program.clone(),
            args: config.args.clone(),
            workdir: config.workdir.clone(),
            env: config.env.clone(),
        }
    }
}

/// Handle to a client left running in the background.
#[derive(Debug)]
pub struct BackgroundProcess {
    pub name: String,
    pub pid: u32,
    pub started: Instant,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    child: Child,
}

impl BackgroundProcess {
    /// Exit status if the process has already ended, without blocking.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }
}

/// Spawns client processes with the server address in their environment.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    address_env: String,
    address: String,
}

impl ProcessRunner {
    pub fn new(address_env: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            address_env: address_env.into(),
            address: address.into(),
        }
    }

    fn command(&self, spec: &ProcessSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null()).kill_on_drop(true);

        if let Some(dir) = &spec.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        // Set last so a stray entry in `env` can't point the client elsewhere.
        cmd.env(&self.address_env, &self.address);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    fn spawn(&self, mut cmd: Command, spec: &ProcessSpec) -> Result<(Child, u32)> {
        let child = cmd.spawn().inspect_err(|e| {
            error!(name = %spec.name, program = %spec.program, error = %e, "failed to spawn");
        })?;
        let pid = child.id().ok_or_else(|| {
            HarnessError::Io(std::io::Error::other(format!(
                "{} exited before its pid could be read",
                spec.name
            )))
        })?;
        Ok((child, pid))
    }

    /// Run `spec` to completion and return its exit code.
    ///
    /// A non-zero exit, or death by signal, is `ProcessFailed`. With a
    /// `limit`, a process still running when it elapses is killed and
    /// `ProcessTimedOut` is returned.
    pub async fn run_foreground(&self, spec: &ProcessSpec, limit: Option<Duration>) -> Result<i32> {
        let mut cmd = self.command(spec);
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());

        let (mut child, pid) = self.spawn(cmd, spec)?;
        let mut guard = GroupGuard::new(&spec.name, pid);
        info!(name = %spec.name, pid, "started foreground process");

        let status = match limit {
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(name = %spec.name, pid, ?limit, "process timed out, killing");
                    if let Err(e) = kill_group(&mut child, pid) {
                        warn!(name = %spec.name, error = %e, "failed to kill timed out process");
                    }
                    if let Err(e) = child.wait().await {
                        warn!(name = %spec.name, error = %e, "failed to reap timed out process");
                    }
                    guard.disarm();
                    return Err(HarnessError::ProcessTimedOut {
                        name: spec.name.clone(),
                        timeout: limit,
                    });
                }
            },
            None => child.wait().await?,
        };
        guard.disarm();

        debug!(name = %spec.name, %status, "foreground process exited");
        match status.code() {
            Some(0) => Ok(0),
            code => Err(HarnessError::ProcessFailed {
                name: spec.name.clone(),
                code,
            }),
        }
    }

    /// Start `spec` without waiting for it, capturing its output to files.
    pub fn run_background(
        &self,
        spec: &ProcessSpec,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<BackgroundProcess> {
        let stdout = std::fs::File::create(stdout_path)?;
        let stderr = std::fs::File::create(stderr_path)?;

        let mut cmd = self.command(spec);
        cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));

        let (child, pid) = self.spawn(cmd, spec)?;
        info!(
            name = %spec.name,
            pid,
            stdout = %stdout_path.display(),
            "started background process"
        );

        Ok(BackgroundProcess {
            name: spec.name.clone(),
            pid,
            started: Instant::now(),
            stdout_path: stdout_path.to_path_buf(),
            stderr_path: stderr_path.to_path_buf(),
            child,
        })
    }

    /// Kill a background process outright and reap it.
    pub async fn terminate(&self, mut handle: BackgroundProcess) -> Result<ExitStatus> {
        // Once reaped, the pgid may belong to someone else.
        if let Some(status) = handle.child.try_wait()? {
            info!(name = %handle.name, %status, "background process had already exited");
            return Ok(status);
        }

        kill_group(&mut handle.child, handle.pid)?;
        let status = handle.child.wait().await?;
        info!(
            name = %handle.name,
            pid = handle.pid,
            uptime = ?handle.started.elapsed(),
            "terminated background process"
        );
        Ok(status)
    }
}

/// Kills a foreground client's group if its future is dropped mid-run,
/// e.g. when the harness is interrupted.
struct GroupGuard<'a> {
    name: &'a str,
    pid: Option<u32>,
}

impl<'a> GroupGuard<'a> {
    fn new(name: &'a str, pid: u32) -> Self {
        Self {
            name,
            pid: Some(pid),
        }
    }

    /// The leader has been reaped; never signal its pgid again.
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            warn!(name = %self.name, pid, "abandoning running process, killing its group");
            if let Err(e) = kill_pgid(pid) {
                warn!(name = %self.name, pid, error = %e, "failed to kill abandoned process group");
            }
        }
    }
}

#[cfg(unix)]
fn kill_pgid(pid: u32) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(std::io::Error::other)?;
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// kill_on_drop takes care of the direct child here.
#[cfg(not(unix))]
fn kill_pgid(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn kill_group(_child: &mut Child, pid: u32) -> std::io::Result<()> {
    kill_pgid(pid)
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child, _pid: u32) -> std::io::Result<()> {
    child.start_kill()
}
