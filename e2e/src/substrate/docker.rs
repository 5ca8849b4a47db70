// Copyright 2024 Oxide Computer Company
use std::collections::HashMap;
use std::fs::{self, File};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use e2e_common::{E2eError, Result};
use slog::{info, warn, Logger};
use tokio::process::{Child, Command};

use super::{expand_args, LaunchContext, Running, Substrate};
use crate::probe::{poll_until, Attempt, WaitOptions};
use crate::service::ServiceSpec;

/// Where the shared directory is mounted inside every container.
pub const CONTAINER_SHARED_DIR: &str = "/shared";

/// Extra time allowed for the `docker run` client to exit after the
/// container has been stopped.
const CLIENT_EXIT_SLACK: Duration = Duration::from_secs(10);

/// Runs every service as a container on a per scenario bridge network.
#[derive(Clone, Debug)]
pub struct Docker {
    bin: String,
}

impl Default for Docker {
    fn default() -> Self {
        Docker::new("docker")
    }
}

impl Docker {
    pub fn new(bin: &str) -> Docker {
        Docker {
            bin: bin.to_string(),
        }
    }

    pub fn container_name(network: &str, service: &str) -> String {
        format!("{}-{}", network, service)
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        Ok(Command::new(&self.bin).args(args).output().await?)
    }

    async fn resolve_ports(
        &self,
        log: &Logger,
        container: &str,
        ports: &[u16],
        child: &mut Child,
        deadline: Duration,
    ) -> Result<HashMap<u16, SocketAddr>> {
        let mut endpoints = HashMap::new();
        let opts = WaitOptions::new(Duration::from_millis(250), deadline);

        for port in ports {
            let port_arg = port.to_string();
            let addr = poll_until(
                log,
                opts,
                container,
                &format!("port {} published", port),
                || {
                    let exited = child.try_wait();
                    let port_arg = port_arg.clone();
                    async move {
                        match exited {
                            Ok(Some(status)) => {
                                return Attempt::Fatal(E2eError::Startup {
                                    service: container.to_string(),
                                    reason: format!("exited: {}", status),
                                })
                            }
                            Err(e) => return Attempt::Fatal(e.into()),
                            Ok(None) => {}
                        }
                        match self.docker(&["port", container, &port_arg]).await
                        {
                            Ok(out) if out.status.success() => {
                                let text = String::from_utf8_lossy(&out.stdout);
                                match parse_port_mapping(&text) {
                                    Some(addr) => Attempt::Done(addr),
                                    None => Attempt::Pending(text.to_string()),
                                }
                            }
                            Ok(out) => Attempt::Pending(
                                String::from_utf8_lossy(&out.stderr)
                                    .trim()
                                    .to_string(),
                            ),
                            Err(e) => Attempt::Pending(e.to_string()),
                        }
                    }
                },
            )
            .await?;
            endpoints.insert(*port, addr);
        }

        Ok(endpoints)
    }
}

#[async_trait]
impl Substrate for Docker {
    async fn setup(&self, ctx: &LaunchContext) -> Result<()> {
        let out = self.docker(&["network", "create", &ctx.network]).await?;
        if !out.status.success() {
            let err = String::from_utf8_lossy(&out.stderr);
            if !err.contains("already exists") {
                return Err(E2eError::Configuration(format!(
                    "docker network create {}: {}",
                    ctx.network,
                    err.trim()
                )));
            }
            warn!(ctx.log, "reusing existing network {}", ctx.network);
        }
        Ok(())
    }

    async fn launch(
        &self,
        spec: &ServiceSpec,
        ctx: &LaunchContext,
    ) -> Result<Box<dyn Running>> {
        let container = Docker::container_name(&ctx.network, &spec.name);
        let output_file = ctx.output_file(&spec.name);
        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let outputs = File::create(&output_file)?;
        let errors = outputs.try_clone()?;

        let mount = format!(
            "{}:{}:z",
            ctx.shared_dir.to_string_lossy(),
            CONTAINER_SHARED_DIR
        );
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            container.clone(),
            "--hostname".into(),
            spec.name.clone(),
            "--network".into(),
            ctx.network.clone(),
            "--network-alias".into(),
            spec.name.clone(),
            "--volume".into(),
            mount,
        ];
        for port in spec.ports.iter() {
            args.push("--publish".into());
            args.push(port.to_string());
        }
        args.push(spec.artifact().to_string());
        args.extend(expand_args(
            &spec.args(),
            std::path::Path::new(CONTAINER_SHARED_DIR),
        ));

        info!(ctx.log, "docker {}", args.join(" "));
        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdout(Stdio::from(outputs))
            .stderr(Stdio::from(errors))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| E2eError::Startup {
                service: spec.name.clone(),
                reason: format!("docker run: {}", e),
            })?;

        let endpoints = match self
            .resolve_ports(
                &ctx.log,
                &container,
                &spec.ports,
                &mut child,
                ctx.launch_deadline,
            )
            .await
        {
            Ok(endpoints) => endpoints,
            Err(e) => {
                let _ = self.docker(&["kill", &container]).await;
                let _ = child.kill().await;
                return Err(E2eError::Startup {
                    service: spec.name.clone(),
                    reason: format!(
                        "{} (output in {:?})",
                        e,
                        output_file.display()
                    ),
                });
            }
        };

        Ok(Box::new(Container {
            bin: self.bin.clone(),
            name: container,
            child,
            endpoints,
            log: ctx.log.clone(),
        }))
    }

    async fn teardown(&self, ctx: &LaunchContext) -> Result<()> {
        let out = self.docker(&["network", "rm", &ctx.network]).await?;
        if !out.status.success() {
            return Err(E2eError::Configuration(format!(
                "docker network rm {}: {}",
                ctx.network,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Container {
    bin: String,
    name: String,
    /// The `docker run` client; it exits once the container is gone.
    child: Child,
    endpoints: HashMap<u16, SocketAddr>,
    log: Logger,
}

#[async_trait]
impl Running for Container {
    fn id(&self) -> String {
        self.name.clone()
    }

    fn endpoint(&self, port: u16) -> Option<SocketAddr> {
        self.endpoints.get(&port).copied()
    }

    fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    async fn stop(&mut self, grace: Duration) -> Result<()> {
        let secs = format!("--time={}", grace.as_secs().max(1));
        let out = Command::new(&self.bin)
            .args(["stop", &secs, &self.name])
            .output()
            .await?;
        if !out.status.success() {
            return Err(E2eError::Shutdown {
                service: self.name.clone(),
                reason: format!(
                    "docker stop: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            });
        }

        match tokio::time::timeout(grace + CLIENT_EXIT_SLACK, self.child.wait())
            .await
        {
            Ok(Ok(status)) => {
                info!(self.log, "{} exited with {}", self.name, status);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(E2eError::Shutdown {
                service: self.name.clone(),
                reason: "docker run did not exit after docker stop"
                    .to_string(),
            }),
        }
    }

    fn kill(&mut self) {
        let _ = std::process::Command::new(&self.bin)
            .args(["kill", &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        let _ = self.child.start_kill();
    }
}

/// Parse the output of `docker port <container> <port>`.
///
/// Docker prints one mapping per address family; the first one wins and
/// an unspecified host address becomes loopback.
pub fn parse_port_mapping(out: &str) -> Option<SocketAddr> {
    let line = out.lines().map(str::trim).find(|l| !l.is_empty())?;
    let addr: SocketAddr = line.parse().ok()?;
    if addr.ip().is_unspecified() {
        Some(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            addr.port(),
        ))
    } else {
        Some(addr)
    }
}
