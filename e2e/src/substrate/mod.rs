// Copyright 2024 Oxide Computer Company
//! Where service processes actually run.
//!
//! The scenario and the service handles only see the [`Substrate`] and
//! [`Running`] traits; whether a service is a container or a local child
//! process is decided by whoever builds the scenario.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use e2e_common::Result;
use slog::Logger;

use crate::service::ServiceSpec;

mod docker;
mod process;

pub use docker::Docker;
pub use process::LocalProcess;

/// Placeholder in service arguments for the shared directory, as the
/// service itself sees it.
pub const SHARED_DIR_PLACEHOLDER: &str = "{shared}";

/// Per scenario state handed to a substrate.
#[derive(Clone, Debug)]
pub struct LaunchContext {
    /// Name of the network services join, also used to namespace them.
    pub network: String,
    /// Host side path of the shared directory.
    pub shared_dir: PathBuf,
    /// How long `launch` may spend before the service is accepted.
    pub launch_deadline: Duration,
    pub log: Logger,
}

impl LaunchContext {
    /// Where service output is written.
    pub fn output_file(&self, service: &str) -> PathBuf {
        self.shared_dir.join("logs").join(format!("{}.txt", service))
    }
}

/// An execution substrate: something that can run a [`ServiceSpec`].
#[async_trait]
pub trait Substrate: Send + Sync + Debug {
    /// Prepare shared resources (networks) before the first launch.
    async fn setup(&self, _ctx: &LaunchContext) -> Result<()> {
        Ok(())
    }

    /// Start the service. Returns once the substrate has accepted it, which
    /// is not the same thing as the service being ready.
    async fn launch(
        &self,
        spec: &ServiceSpec,
        ctx: &LaunchContext,
    ) -> Result<Box<dyn Running>>;

    /// Release whatever `setup` created.
    async fn teardown(&self, _ctx: &LaunchContext) -> Result<()> {
        Ok(())
    }
}

/// A launched service.
#[async_trait]
pub trait Running: Send + Sync + Debug {
    /// Identifier for logs: a pid or a container name.
    fn id(&self) -> String;

    /// Host reachable address of a service port.
    fn endpoint(&self, port: u16) -> Option<SocketAddr>;

    /// `Some` once the service has exited.
    fn try_exit_status(&mut self) -> Result<Option<ExitStatus>>;

    /// Ask the service to shut down and wait until it has fully exited.
    ///
    /// Must not return before the process is gone: callers use the return
    /// as proof that anything the service does on shutdown has finished.
    async fn stop(&mut self, grace: Duration) -> Result<()>;

    /// Best effort, synchronous kill. Used from `Drop`.
    fn kill(&mut self);
}

/// Replace the shared directory placeholder in `args`.
pub fn expand_args(args: &[String], shared: &Path) -> Vec<String> {
    let shared = shared.to_string_lossy();
    args.iter()
        .map(|a| a.replace(SHARED_DIR_PLACEHOLDER, &shared))
        .collect()
}
