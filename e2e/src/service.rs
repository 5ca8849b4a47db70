// Copyright 2024 Oxide Computer Company
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use e2e_common::{E2eError, Result};
use serde::{Deserialize, Serialize};
use slog::{info, o, warn, Logger};

use crate::flags::Flags;
use crate::probe::{
    poll_until, wait_metric, Attempt, MetricCondition, Readiness, WaitOptions,
};
use crate::substrate::{LaunchContext, Running, Substrate};

/// Which component a service plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Ingester,
    Distributor,
    Querier,
    TableManager,
    /// Coordination (ring, locks) store.
    Coordination,
    /// Key-value / wide column storage.
    Storage,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Ingester => "ingester",
            Role::Distributor => "distributor",
            Role::Querier => "querier",
            Role::TableManager => "table-manager",
            Role::Coordination => "coordination",
            Role::Storage => "storage",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one service.
#[derive(Debug, Copy, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

/// Everything needed to run one versioned component.
#[derive(Clone, Debug)]
pub struct ServiceSpec {
    pub name: String,
    pub role: Role,
    /// The artifact used when no version is requested.
    pub image: String,
    /// Version tag; empty means the current build (`image`).
    pub version: String,
    /// Arguments ahead of the flags.
    pub command: Vec<String>,
    pub flags: Flags,
    /// Ports the service listens on.
    pub ports: Vec<u16>,
    pub readiness: Readiness,
    /// Port serving `/metrics`, if the service exposes telemetry.
    pub metrics_port: Option<u16>,
}

impl ServiceSpec {
    pub fn new(name: &str, role: Role, image: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            role,
            image: image.to_string(),
            version: String::new(),
            command: Vec::new(),
            flags: Flags::new(),
            ports: Vec::new(),
            readiness: Readiness::None,
            metrics_port: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_ports(mut self, ports: &[u16]) -> Self {
        self.ports = ports.to_vec();
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }

    /// The image or binary to run: the version tag when one is given,
    /// otherwise the current one.
    pub fn artifact(&self) -> &str {
        if self.version.is_empty() {
            &self.image
        } else {
            &self.version
        }
    }

    /// Command followed by the rendered flags.
    pub fn args(&self) -> Vec<String> {
        let mut args = self.command.clone();
        args.extend(self.flags.to_args());
        args
    }
}

/// Handle on one service for the lifetime of a scenario.
#[derive(Debug)]
pub struct Service {
    spec: ServiceSpec,
    state: ServiceState,
    running: Option<Box<dyn Running>>,
    http: reqwest::Client,
    log: Logger,
}

impl Service {
    pub fn new(spec: ServiceSpec, log: &Logger) -> Service {
        let log = log.new(o!(
            "service" => spec.name.clone(),
            "role" => spec.role.to_string(),
        ));
        Service {
            spec,
            state: ServiceState::NotStarted,
            running: None,
            http: reqwest::Client::new(),
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn role(&self) -> Role {
        self.spec.role
    }

    pub fn version(&self) -> &str {
        &self.spec.version
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Still holding a process that has not been stopped.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub async fn start(
        &mut self,
        substrate: &dyn Substrate,
        ctx: &LaunchContext,
    ) -> Result<()> {
        if self.running.is_some() {
            return Err(E2eError::Configuration(format!(
                "service {} is already running",
                self.spec.name
            )));
        }

        info!(
            self.log,
            "starting {} version {:?}",
            self.spec.artifact(),
            self.spec.version
        );
        self.state = ServiceState::Starting;
        match substrate.launch(&self.spec, ctx).await {
            Ok(running) => {
                info!(self.log, "launched as {}", running.id());
                self.running = Some(running);
                Ok(())
            }
            Err(e) => {
                self.state = ServiceState::Failed;
                Err(match e {
                    e @ E2eError::Startup { .. } => e,
                    e => E2eError::Startup {
                        service: self.spec.name.clone(),
                        reason: e.to_string(),
                    },
                })
            }
        }
    }

    /// Stop the service and wait for it to exit.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        info!(self.log, "stopping {}", running.id());
        self.state = ServiceState::Stopping;
        match running.stop(grace).await {
            Ok(()) => {
                self.state = ServiceState::Stopped;
                info!(self.log, "stopped");
                Ok(())
            }
            Err(e) => {
                // Whatever is left of it must not outlive the handle.
                running.kill();
                self.state = ServiceState::Failed;
                Err(match e {
                    e @ E2eError::Shutdown { .. } => e,
                    e => E2eError::Shutdown {
                        service: self.spec.name.clone(),
                        reason: e.to_string(),
                    },
                })
            }
        }
    }

    /// Kill without waiting. Only for cleanup paths that can not await.
    pub fn kill(&mut self) {
        if let Some(mut running) = self.running.take() {
            warn!(self.log, "killing {}", running.id());
            running.kill();
            self.state = ServiceState::Stopped;
        }
    }

    /// Host reachable address of `port`.
    pub fn endpoint(&self, port: u16) -> Result<SocketAddr> {
        let running = self.running.as_ref().ok_or_else(|| {
            E2eError::Configuration(format!(
                "service {} is not running",
                self.spec.name
            ))
        })?;
        running.endpoint(port).ok_or_else(|| {
            E2eError::Configuration(format!(
                "service {} does not expose port {}",
                self.spec.name, port
            ))
        })
    }

    /// Address of `port` as seen by other services on the network.
    pub fn network_endpoint(&self, port: u16) -> String {
        format!("{}:{}", self.spec.name, port)
    }

    /// Poll the readiness check until it passes.
    ///
    /// Fails early if the process exits while we wait.
    pub async fn wait_ready(&mut self, opts: WaitOptions) -> Result<()> {
        if self.running.is_none() {
            return Err(E2eError::Configuration(format!(
                "service {} is not running",
                self.spec.name
            )));
        }
        if self.state == ServiceState::Ready {
            return Ok(());
        }

        let name = self.spec.name.clone();
        let readiness = self.spec.readiness.clone();
        let http = self.http.clone();
        let log = self.log.clone();
        let running = &mut self.running;

        let res = poll_until(&log, opts, &name, "ready", || {
            let exited = match running.as_mut().map(|r| r.try_exit_status()) {
                Some(Ok(Some(status))) => Some(format!("exited: {}", status)),
                Some(Err(e)) => Some(e.to_string()),
                Some(Ok(None)) => None,
                None => Some("not running".to_string()),
            };
            let addr = readiness
                .port()
                .and_then(|p| running.as_ref().and_then(|r| r.endpoint(p)));
            let readiness = readiness.clone();
            let http = http.clone();
            let name = name.clone();
            async move {
                if let Some(reason) = exited {
                    return Attempt::Fatal(E2eError::Startup {
                        service: name,
                        reason,
                    });
                }
                match readiness.check(&http, addr).await {
                    Ok(()) => Attempt::Done(()),
                    Err(seen) => Attempt::Pending(seen),
                }
            }
        })
        .await;

        match res {
            Ok(()) => {
                self.state = ServiceState::Ready;
                Ok(())
            }
            Err(e) => {
                if matches!(e, E2eError::Startup { .. }) {
                    self.state = ServiceState::Failed;
                }
                Err(e)
            }
        }
    }

    /// Wait for a metric exposed by this service to meet `condition`.
    pub async fn wait_metric_with(
        &self,
        metric: &str,
        condition: MetricCondition,
        opts: WaitOptions,
    ) -> Result<f64> {
        let port = self.spec.metrics_port.ok_or_else(|| {
            E2eError::Configuration(format!(
                "service {} exposes no metrics",
                self.spec.name
            ))
        })?;
        let url = format!("http://{}/metrics", self.endpoint(port)?);
        wait_metric(
            &self.log,
            &self.http,
            &self.spec.name,
            &url,
            metric,
            condition,
            opts,
        )
        .await
    }

    /// Wait until `metric` is at least `threshold`.
    pub async fn wait_metric(
        &self,
        metric: &str,
        threshold: f64,
        opts: WaitOptions,
    ) -> Result<f64> {
        self.wait_metric_with(metric, MetricCondition::AtLeast(threshold), opts)
            .await
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.kill();
    }
}
