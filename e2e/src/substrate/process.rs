// Copyright 2024 Oxide Computer Company
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use e2e_common::{E2eError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use slog::{info, Logger};
use tokio::process::{Child, Command};

use super::{expand_args, LaunchContext, Running, Substrate};
use crate::service::ServiceSpec;

/// Runs services as child processes of the harness.
///
/// Each artifact (the current build, or a version tag) maps to a binary.
/// Services listen on loopback at the ports they declare, so those must be
/// unique across the scenario.
#[derive(Clone, Debug, Default)]
pub struct LocalProcess {
    binaries: BTreeMap<String, PathBuf>,
}

impl LocalProcess {
    pub fn new() -> LocalProcess {
        LocalProcess::default()
    }

    /// Run `binary` whenever a service asks for `artifact`.
    pub fn with_binary(
        mut self,
        artifact: &str,
        binary: impl Into<PathBuf>,
    ) -> Self {
        self.binaries.insert(artifact.to_string(), binary.into());
        self
    }

    fn binary_for(&self, artifact: &str) -> PathBuf {
        self.binaries
            .get(artifact)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(artifact))
    }
}

#[async_trait]
impl Substrate for LocalProcess {
    async fn launch(
        &self,
        spec: &ServiceSpec,
        ctx: &LaunchContext,
    ) -> Result<Box<dyn Running>> {
        let binary = self.binary_for(spec.artifact());

        let output_file = ctx.output_file(&spec.name);
        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let outputs = File::create(&output_file)?;
        let errors = outputs.try_clone()?;

        let args = expand_args(&spec.args(), &ctx.shared_dir);
        let child = Command::new(&binary)
            .args(&args)
            .current_dir(&ctx.shared_dir)
            .stdout(Stdio::from(outputs))
            .stderr(Stdio::from(errors))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| E2eError::Startup {
                service: spec.name.clone(),
                reason: format!("spawn {:?}: {}", binary, e),
            })?;

        let pid = child.id().ok_or_else(|| E2eError::Startup {
            service: spec.name.clone(),
            reason: "exited immediately".to_string(),
        })?;
        info!(ctx.log, "{} {:?} PID:{}", spec.name, binary, pid);

        let endpoints = spec
            .ports
            .iter()
            .map(|p| (*p, SocketAddr::from((Ipv4Addr::LOCALHOST, *p))))
            .collect();

        Ok(Box::new(ChildProcess {
            name: spec.name.clone(),
            pid,
            child,
            endpoints,
            log: ctx.log.clone(),
        }))
    }
}

#[derive(Debug)]
struct ChildProcess {
    name: String,
    pid: u32,
    child: Child,
    endpoints: HashMap<u16, SocketAddr>,
    log: Logger,
}

impl ChildProcess {
    fn check_exit(&self, status: ExitStatus) -> Result<()> {
        // Exiting on the SIGTERM we sent counts as a clean stop.
        if status.success() || status.signal() == Some(Signal::SIGTERM as i32)
        {
            Ok(())
        } else {
            Err(E2eError::Shutdown {
                service: self.name.clone(),
                reason: format!("exited with {}", status),
            })
        }
    }
}

#[async_trait]
impl Running for ChildProcess {
    fn id(&self) -> String {
        format!("pid {}", self.pid)
    }

    fn endpoint(&self, port: u16) -> Option<SocketAddr> {
        self.endpoints.get(&port).copied()
    }

    fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    async fn stop(&mut self, grace: Duration) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            return self.check_exit(status);
        }

        kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM).map_err(
            |e| E2eError::Shutdown {
                service: self.name.clone(),
                reason: format!("SIGTERM: {}", e),
            },
        )?;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(self.log, "{} exited with {}", self.name, status);
                self.check_exit(status)
            }
            Err(_) => {
                self.child.kill().await?;
                Err(E2eError::Shutdown {
                    service: self.name.clone(),
                    reason: format!("still running after {:?}; killed", grace),
                })
            }
        }
    }

    fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::service::Role;
    use e2e_common::discard_logger;
    use tempfile::tempdir;

    fn ctx(dir: &std::path::Path) -> LaunchContext {
        LaunchContext {
            network: "test".to_string(),
            shared_dir: dir.to_path_buf(),
            launch_deadline: Duration::from_secs(5),
            log: discard_logger(),
        }
    }

    #[tokio::test]
    async fn stop_waits_for_exit() {
        let dir = tempdir().unwrap();
        let substrate = LocalProcess::new().with_binary("current", "sleep");
        let spec = ServiceSpec::new("sleeper", Role::Storage, "current")
            .with_command(["30"])
            .with_ports(&[18080]);

        let ctx = ctx(dir.path());
        let mut running = substrate.launch(&spec, &ctx).await.unwrap();
        assert_eq!(
            running.endpoint(18080),
            Some("127.0.0.1:18080".parse().unwrap())
        );
        assert_eq!(running.endpoint(9095), None);
        assert!(running.try_exit_status().unwrap().is_none());

        running.stop(Duration::from_secs(5)).await.unwrap();
        assert!(running.try_exit_status().unwrap().is_some());
        assert!(dir.path().join("logs").join("sleeper.txt").exists());
    }

    #[tokio::test]
    async fn version_picks_binary() {
        let dir = tempdir().unwrap();
        let substrate = LocalProcess::new()
            .with_binary("current", "/nonexistent/cortex")
            .with_binary("v0.6.0", "true");
        let spec = ServiceSpec::new("querier", Role::Querier, "current")
            .with_version("v0.6.0");

        let ctx = ctx(dir.path());
        let mut running = substrate.launch(&spec, &ctx).await.unwrap();
        // `true` exits cleanly on its own, which is still a clean stop.
        running.stop(Duration::from_secs(5)).await.unwrap();

        let current = ServiceSpec::new("querier", Role::Querier, "current");
        let res = substrate.launch(&current, &ctx).await;
        assert!(matches!(res, Err(E2eError::Startup { .. })));
    }

    #[tokio::test]
    async fn failed_exit_is_a_shutdown_error() {
        let dir = tempdir().unwrap();
        let substrate = LocalProcess::new();
        let spec = ServiceSpec::new("broken", Role::Ingester, "false");

        let ctx = ctx(dir.path());
        let mut running = substrate.launch(&spec, &ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let res = running.stop(Duration::from_secs(5)).await;
        assert!(matches!(res, Err(E2eError::Shutdown { .. })));
    }
}
