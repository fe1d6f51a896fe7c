//! Server instance lifecycle
//!
//! The harness talks to a [`ServerSupervisor`], which owns the resolved
//! [`ServerSpec`] and forwards to a [`ServerProvisioner`]. [`DockerCli`] is the
//! provisioner used outside of tests.

use std::process::Output;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{HarnessError, Result};

/// Fully resolved description of one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub image: String,
    pub host: String,
    pub host_port: u16,
    pub container_port: u16,
    pub extra_args: Vec<String>,
}

impl ServerSpec {
    /// Resolve the per-run instance name and host port.
    ///
    /// A configured port of 0 is replaced by a port the OS reports as free.
    pub fn from_config(config: &ServerConfig, run_id: &str) -> Result<Self> {
        let name = if config.unique_name {
            format!("{}-{}", config.name, run_id)
        } else {
            config.name.clone()
        };

        let host_port = match config.port {
            0 => free_port(&config.host)?,
            port => port,
        };

        Ok(Self {
            name,
            image: config.image.clone(),
            host: config.host.clone(),
            host_port,
            container_port: config.container_port,
            extra_args: config.extra_args.clone(),
        })
    }

    /// `host:port` the clients connect to
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.host_port)
    }

    fn publish_arg(&self) -> String {
        format!("{}:{}:{}", self.host, self.host_port, self.container_port)
    }
}

fn free_port(host: &str) -> Result<u16> {
    let listener = std::net::TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Platform facility that can create and remove named server instances.
#[allow(async_fn_in_trait)]
pub trait ServerProvisioner {
    /// Remove `name` if it exists. Absent instances are not an error.
    async fn ensure_clean(&self, name: &str) -> Result<()>;

    /// Create and detach a fresh instance.
    async fn start(&self, spec: &ServerSpec) -> Result<()>;

    /// Forcibly remove `name`.
    async fn stop(&self, name: &str) -> Result<()>;
}

impl<P: ServerProvisioner + ?Sized> ServerProvisioner for &P {
    async fn ensure_clean(&self, name: &str) -> Result<()> {
        (**self).ensure_clean(name).await
    }

    async fn start(&self, spec: &ServerSpec) -> Result<()> {
        (**self).start(spec).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        (**self).stop(name).await
    }
}

/// Drives the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<Output> {
        debug!(binary = %self.binary, ?args, "invoking docker");
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HarnessError::Provision(format!("Failed to run {}: {}", self.binary, e)))
    }

    async fn force_remove(&self, name: &str) -> Result<()> {
        let output = self.docker(&["rm", "-f", name]).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            debug!(name, "no container to remove");
            return Ok(());
        }

        Err(HarnessError::Provision(format!(
            "docker rm -f {} exited with {}: {}",
            name,
            output.status,
            stderr.trim()
        )))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ServerProvisioner for DockerCli {
    async fn ensure_clean(&self, name: &str) -> Result<()> {
        self.force_remove(name).await
    }

    async fn start(&self, spec: &ServerSpec) -> Result<()> {
        let publish = spec.publish_arg();
        let mut args = vec![
            "run",
            "-d",
            "--rm",
            "--name",
            spec.name.as_str(),
            "-p",
            publish.as_str(),
        ];
        args.extend(spec.extra_args.iter().map(String::as_str));
        args.push(spec.image.as_str());

        let output = self.docker(&args).await?;
        if !output.status.success() {
            return Err(HarnessError::Provision(format!(
                "docker run {} exited with {}: {}",
                spec.image,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout);
        debug!(name = %spec.name, container_id = %container_id.trim(), "container created");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.force_remove(name).await
    }
}

pub struct ServerSupervisor<P> {
    provisioner: P,
    spec: ServerSpec,
}

impl<P: ServerProvisioner> ServerSupervisor<P> {
    pub fn new(provisioner: P, spec: ServerSpec) -> Self {
        Self { provisioner, spec }
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    pub async fn ensure_clean(&self) -> Result<()> {
        debug!(name = %self.spec.name, "removing stale server instance");
        self.provisioner.ensure_clean(&self.spec.name).await
    }

    pub async fn start(&self) -> Result<()> {
        info!(
            name = %self.spec.name,
            image = %self.spec.image,
            address = %self.spec.address(),
            "starting server"
        );
        self.provisioner.start(&self.spec).await
    }

    pub async fn stop(&self) -> Result<()> {
        info!(name = %self.spec.name, "stopping server");
        self.provisioner
            .stop(&self.spec.name)
            .await
            .inspect_err(|e| warn!(name = %self.spec.name, error = %e, "failed to stop server"))
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }
}
