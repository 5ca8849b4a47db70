// Copyright 2024 Oxide Computer Company
//! A scenario owns every service started for one test and guarantees they
//! are all gone when it ends.
//!
//! ```text
//!   Scenario::new ──► start_service ──► wait_ready ──► ... ──► close
//!        │                                                       │
//!   substrate.setup                                     stop in reverse
//!   shared dir created                                  start order,
//!                                                       substrate.teardown,
//!                                                       shared dir removed
//! ```
//!
//! If `close` is never reached (a panic, an early return that drops the
//! scenario) `Drop` kills whatever is still running.

use std::fs;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use e2e_common::{write_once, E2eError, Result};
use futures::future::try_join_all;
use slog::{info, o, warn, Logger};
use uuid::Uuid;

use crate::probe::WaitOptions;
use crate::service::{Service, ServiceSpec};
use crate::substrate::{LaunchContext, Substrate};

/// Knobs shared by every service in a scenario.
#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    /// Network name prefix. Each scenario appends its id, so scenarios
    /// sharing a config never share a network or container names.
    pub network: String,
    /// The shared directory is created below this path.
    pub shared_parent: PathBuf,
    /// Polling for `wait_ready`.
    pub ready: WaitOptions,
    /// Time a service gets to exit after being asked to stop.
    pub stop_grace: Duration,
    /// Time a substrate gets to accept a launch.
    pub launch_deadline: Duration,
    /// Leave the shared directory behind on close, for debugging.
    pub keep_shared_dir: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            network: "e2e-cortex-test".to_string(),
            shared_parent: std::env::temp_dir(),
            ready: WaitOptions::default(),
            stop_grace: Duration::from_secs(30),
            launch_deadline: Duration::from_secs(30),
            keep_shared_dir: false,
        }
    }
}

pub struct Scenario {
    id: Uuid,
    config: ScenarioConfig,
    substrate: Arc<dyn Substrate>,
    ctx: LaunchContext,
    /// Registered services, in start order.
    services: Vec<Service>,
    closed: bool,
    log: Logger,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("id", &self.id)
            .field("network", &self.ctx.network)
            .field("shared_dir", &self.ctx.shared_dir)
            .field(
                "services",
                &self.services.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("closed", &self.closed)
            .finish()
    }
}

impl Scenario {
    pub async fn new(
        substrate: Arc<dyn Substrate>,
        config: ScenarioConfig,
        log: &Logger,
    ) -> Result<Scenario> {
        let id = Uuid::new_v4();
        let log = log.new(o!("scenario" => id.to_string()));

        let shared_dir = config
            .shared_parent
            .join(format!("e2e_integration_test-{}", id.simple()));
        if shared_dir.exists() {
            return Err(E2eError::Configuration(format!(
                "shared directory {:?} already exists",
                shared_dir
            )));
        }
        fs::create_dir_all(&shared_dir)?;
        info!(log, "shared directory at {:?}", shared_dir);

        let ctx = LaunchContext {
            network: format!("{}-{}", config.network, id.simple()),
            shared_dir,
            launch_deadline: config.launch_deadline,
            log: log.clone(),
        };

        if let Err(e) = substrate.setup(&ctx).await {
            let _ = fs::remove_dir_all(&ctx.shared_dir);
            return Err(e);
        }

        Ok(Scenario {
            id,
            config,
            substrate,
            ctx,
            services: Vec::new(),
            closed: false,
            log,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn shared_dir(&self) -> &Path {
        &self.ctx.shared_dir
    }

    /// The network this scenario's services join.
    pub fn network(&self) -> &str {
        &self.ctx.network
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Write a config artifact into the shared directory.
    ///
    /// Each file can be written once; it must be written before any
    /// service that reads it is started.
    pub fn write_shared_file(
        &self,
        name: &str,
        contents: &[u8],
    ) -> Result<PathBuf> {
        let rel = Path::new(name);
        if name.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(E2eError::Configuration(format!(
                "{:?} is not a relative path inside the shared directory",
                name
            )));
        }
        let path = self.ctx.shared_dir.join(rel);
        write_once(&path, contents)?;
        info!(self.log, "wrote {:?}", path);
        Ok(path)
    }

    /// Register and start a service. Names must be unique among the
    /// services currently registered.
    pub async fn start_service(&mut self, spec: ServiceSpec) -> Result<()> {
        if self.closed {
            return Err(E2eError::Configuration(
                "scenario is closed".to_string(),
            ));
        }
        if self.services.iter().any(|s| s.name() == spec.name) {
            return Err(E2eError::Configuration(format!(
                "service {} already exists",
                spec.name
            )));
        }

        let mut service = Service::new(spec, &self.log);
        service.start(self.substrate.as_ref(), &self.ctx).await?;
        self.services.push(service);
        Ok(())
    }

    /// Stop a service, waiting until it has exited, and unregister it.
    pub async fn stop_service(&mut self, name: &str) -> Result<()> {
        let idx = self.index_of(name)?;
        let mut service = self.services.remove(idx);
        service.stop(self.config.stop_grace).await
    }

    /// Wait until every named service passes its readiness check.
    ///
    /// The checks run concurrently; the first failure is returned and the
    /// remaining checks are abandoned.
    pub async fn wait_ready(&mut self, names: &[&str]) -> Result<()> {
        for name in names {
            self.index_of(name)?;
        }

        let opts = self.config.ready;
        let waits = self
            .services
            .iter_mut()
            .filter(|s| names.contains(&s.name()))
            .map(|s| s.wait_ready(opts));
        try_join_all(waits).await?;

        info!(self.log, "ready: {}", names.join(", "));
        Ok(())
    }

    pub fn service(&self, name: &str) -> Result<&Service> {
        let idx = self.index_of(name)?;
        Ok(&self.services[idx])
    }

    /// Host reachable address of `port` on service `name`.
    pub fn endpoint(&self, name: &str, port: u16) -> Result<SocketAddr> {
        self.service(name)?.endpoint(port)
    }

    /// Names of the registered services, in start order.
    pub fn services(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.services
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| {
                E2eError::Configuration(format!("unknown service {}", name))
            })
    }

    /// Stop everything, newest first, then release the substrate and the
    /// shared directory.
    ///
    /// Keeps going past failures; every one of them is returned together.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        let mut errors = Vec::new();

        while let Some(mut service) = self.services.pop() {
            if let Err(e) = service.stop(self.config.stop_grace).await {
                warn!(self.log, "{}", e);
                errors.push(e);
            }
        }

        if let Err(e) = self.substrate.teardown(&self.ctx).await {
            warn!(self.log, "teardown: {}", e);
            errors.push(e);
        }

        if !self.config.keep_shared_dir {
            if let Err(e) = fs::remove_dir_all(&self.ctx.shared_dir) {
                warn!(self.log, "removing {:?}: {}", self.ctx.shared_dir, e);
                errors.push(e.into());
            }
        }

        if errors.is_empty() {
            info!(self.log, "scenario closed");
            Ok(())
        } else {
            Err(E2eError::Teardown(errors))
        }
    }
}

impl Drop for Scenario {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(self.log, "scenario dropped without close; killing services");
        while let Some(mut service) = self.services.pop() {
            service.kill();
        }
    }
}
