//! The fixed end-to-end scenario
//!
//! A run walks the [`Stage`]s in order and stops at the first failure.
//! Cleanup is not part of that chain: it always runs, exactly once, and its
//! problems land in [`RunReport::cleanup`] without touching the verdict.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{CleanupFailed, HarnessError, Result};
use crate::process::{BackgroundProcess, ProcessRunner, ProcessSpec};
use crate::readiness::{ReadinessPoller, RetryBudget};
use crate::supervisor::{DockerCli, ServerProvisioner, ServerSpec, ServerSupervisor};
use crate::verify::OutputVerifier;

const ARTIFACT_PREFIX: &str = "ircprobe-";
const RECEIVER_STDOUT: &str = "receiver.stdout";
const RECEIVER_STDERR: &str = "receiver.stderr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    CleanPriorState,
    StartServer,
    AwaitReadiness,
    SettleServer,
    StartReceiver,
    SettleReceiver,
    RunSender,
    VerifyOutputs,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CleanPriorState => "clean-prior-state",
            Stage::StartServer => "start-server",
            Stage::AwaitReadiness => "await-readiness",
            Stage::SettleServer => "settle-server",
            Stage::StartReceiver => "start-receiver",
            Stage::SettleReceiver => "settle-receiver",
            Stage::RunSender => "run-sender",
            Stage::VerifyOutputs => "verify-outputs",
            Stage::Cleanup => "cleanup",
        }
    }

    fn next(self) -> Stage {
        match self {
            Stage::CleanPriorState => Stage::StartServer,
            Stage::StartServer => Stage::AwaitReadiness,
            Stage::AwaitReadiness => Stage::SettleServer,
            Stage::SettleServer => Stage::StartReceiver,
            Stage::StartReceiver => Stage::SettleReceiver,
            Stage::SettleReceiver => Stage::RunSender,
            Stage::RunSender => Stage::VerifyOutputs,
            Stage::VerifyOutputs | Stage::Cleanup => Stage::Cleanup,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum Outcome {
    Success,
    Failure { stage: Stage, error: HarnessError },
}

/// Everything a finished run has to say about itself.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub server_name: String,
    pub address: String,
    /// Stages that completed, in order. `Cleanup` is always last.
    pub completed: Vec<Stage>,
    pub outcome: Outcome,
    pub cleanup: Vec<CleanupFailed>,
    /// Set when the artifact directory was kept on disk.
    pub artifact_dir: Option<PathBuf>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    pub fn exit_code(&self) -> u8 {
        match &self.outcome {
            Outcome::Success => 0,
            Outcome::Failure { error, .. } => error.exit_code(),
        }
    }

    pub fn error(&self) -> Option<&HarnessError> {
        match &self.outcome {
            Outcome::Success => None,
            Outcome::Failure { error, .. } => Some(error),
        }
    }
}

#[derive(Default)]
struct RunState {
    completed: Vec<Stage>,
    receiver: Option<BackgroundProcess>,
}

impl RunState {
    fn finish(&mut self, stage: Stage) {
        debug!(%stage, "stage complete");
        self.completed.push(stage);
    }

    /// The stage in flight, i.e. the one after the last completed.
    fn current(&self) -> Stage {
        self.completed
            .last()
            .map_or(Stage::CleanPriorState, |stage| stage.next())
    }
}

type StageResult = std::result::Result<(), (Stage, HarnessError)>;

fn at(stage: Stage) -> impl FnOnce(HarnessError) -> (Stage, HarnessError) {
    move |error| (stage, error)
}

pub struct Harness<P> {
    config: Config,
    supervisor: ServerSupervisor<P>,
    runner: ProcessRunner,
    artifacts: TempDir,
    run_id: String,
}

impl Harness<DockerCli> {
    pub fn with_docker(config: Config) -> Result<Self> {
        let docker = DockerCli::new(config.server.docker_binary.clone());
        Self::new(config, docker)
    }
}

impl<P: ServerProvisioner> Harness<P> {
    /// Prepare a run: validates `config`, creates the artifact directory and
    /// resolves the per-run server name and port.
    pub fn new(config: Config, provisioner: P) -> Result<Self> {
        config.validate()?;

        let artifacts = tempfile::Builder::new()
            .prefix(ARTIFACT_PREFIX)
            .tempdir()?;
        let run_id = run_id_for(artifacts.path());

        let spec = ServerSpec::from_config(&config.server, &run_id)?;
        let runner = ProcessRunner::new(config.harness.address_env.clone(), spec.address());

        Ok(Self {
            config,
            supervisor: ServerSupervisor::new(provisioner, spec),
            runner,
            artifacts,
            run_id,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn server(&self) -> &ServerSpec {
        self.supervisor.spec()
    }

    pub fn provisioner(&self) -> &P {
        self.supervisor.provisioner()
    }

    pub fn artifact_dir(&self) -> &Path {
        self.artifacts.path()
    }

    pub fn receiver_output(&self) -> PathBuf {
        self.artifacts.path().join(RECEIVER_STDOUT)
    }

    /// Execute the scenario and clean up after it.
    pub async fn run(self) -> RunReport {
        self.run_until(std::future::pending()).await
    }

    /// Like [`run`](Self::run), but abandons the scenario when `shutdown`
    /// completes. The stage in flight fails with `Interrupted` and cleanup
    /// still runs.
    pub async fn run_until<F>(self, shutdown: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        info!(
            run_id = %self.run_id,
            server = %self.server().name,
            address = %self.server().address(),
            artifacts = %self.artifacts.path().display(),
            "starting run"
        );

        let mut state = RunState::default();
        let raced = tokio::select! {
            result = self.advance(&mut state) => Some(result),
            () = shutdown => None,
        };
        let outcome = match raced {
            Some(Ok(())) => {
                info!("run succeeded");
                Outcome::Success
            }
            Some(Err((stage, error))) => {
                error!(%stage, %error, "run failed");
                Outcome::Failure { stage, error }
            }
            None => {
                let stage = state.current();
                warn!(%stage, "interrupted, cleaning up");
                Outcome::Failure {
                    stage,
                    error: HarnessError::Interrupted,
                }
            }
        };

        let mut cleanup = self.cleanup(&mut state).await;
        state.finish(Stage::Cleanup);

        let failed = !matches!(outcome, Outcome::Success);
        let Harness {
            config,
            supervisor,
            artifacts,
            run_id,
            ..
        } = self;

        let artifact_dir = if config.artifacts.keep || (failed && config.artifacts.keep_on_failure) {
            let path = artifacts.keep();
            info!(path = %path.display(), "keeping artifacts");
            Some(path)
        } else {
            if let Err(e) = artifacts.close() {
                warn!(error = %e, "failed to remove artifacts");
                cleanup.push(CleanupFailed {
                    step: "remove-artifacts",
                    reason: e.to_string(),
                });
            }
            None
        };

        for failure in &cleanup {
            warn!(%failure, "cleanup incomplete");
        }

        let spec = supervisor.spec();
        RunReport {
            run_id,
            server_name: spec.name.clone(),
            address: spec.address(),
            completed: state.completed,
            outcome,
            cleanup,
            artifact_dir,
        }
    }

    async fn advance(&self, state: &mut RunState) -> StageResult {
        self.supervisor
            .ensure_clean()
            .await
            .map_err(at(Stage::CleanPriorState))?;
        state.finish(Stage::CleanPriorState);

        self.supervisor
            .start()
            .await
            .map_err(at(Stage::StartServer))?;
        state.finish(Stage::StartServer);

        let poller = ReadinessPoller::new(RetryBudget::from(&self.config.readiness));
        poller
            .wait_until_reachable(&self.server().address())
            .await
            .map_err(at(Stage::AwaitReadiness))?;
        state.finish(Stage::AwaitReadiness);

        sleep(self.config.readiness.settle()).await;
        state.finish(Stage::SettleServer);

        let receiver = self
            .runner
            .run_background(
                &ProcessSpec::receiver(&self.config.receiver),
                &self.receiver_output(),
                &self.artifacts.path().join(RECEIVER_STDERR),
            )
            .map_err(at(Stage::StartReceiver))?;
        state.receiver = Some(receiver);
        state.finish(Stage::StartReceiver);

        self.settle_receiver(state)
            .await
            .map_err(at(Stage::SettleReceiver))?;
        state.finish(Stage::SettleReceiver);

        self.runner
            .run_foreground(
                &ProcessSpec::sender(&self.config.sender),
                self.config.sender.timeout(),
            )
            .await
            .map_err(at(Stage::RunSender))?;
        state.finish(Stage::RunSender);

        sleep(self.config.verify.settle()).await;
        OutputVerifier::verify_all(&self.receiver_output(), &self.config.verify.markers)
            .map_err(at(Stage::VerifyOutputs))?;
        state.finish(Stage::VerifyOutputs);

        Ok(())
    }

    async fn settle_receiver(&self, state: &mut RunState) -> Result<()> {
        let marker = self.config.receiver.ready_marker.as_str();
        if !marker.is_empty() {
            let poller = ReadinessPoller::new(RetryBudget::from(&self.config.receiver));
            if let Err(err) = poller.wait_for_marker(&self.receiver_output(), marker).await {
                // A receiver that died is a better explanation than a missing line.
                if let Some(handle) = state.receiver.as_mut() {
                    if let Some(status) = handle.try_status()? {
                        return Err(HarnessError::ProcessFailed {
                            name: handle.name.clone(),
                            code: status.code(),
                        });
                    }
                }
                return Err(err);
            }
        }

        sleep(self.config.receiver.settle()).await;
        Ok(())
    }

    async fn cleanup(&self, state: &mut RunState) -> Vec<CleanupFailed> {
        let mut failures = Vec::new();

        if let Some(receiver) = state.receiver.take() {
            if let Err(e) = self.runner.terminate(receiver).await {
                failures.push(CleanupFailed {
                    step: "terminate-receiver",
                    reason: e.to_string(),
                });
            }
        }

        if self.config.server.keep {
            info!(name = %self.server().name, "leaving server running");
        } else if let Err(e) = self.supervisor.stop().await {
            failures.push(CleanupFailed {
                step: "stop-server",
                reason: e.to_string(),
            });
        }

        failures
    }
}

/// The random suffix tempfile gave the artifact directory.
fn run_id_for(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().trim_start_matches(ARTIFACT_PREFIX).to_owned())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| std::process::id().to_string())
}
