// Copyright 2024 Oxide Computer Company
//! Multi process integration scenarios.
//!
//! A [`Scenario`] starts versioned services on a [`Substrate`], waits for
//! them to become ready or for their metrics to reach a value, and tears
//! everything down again, whatever happened in between.

pub mod flags;
pub mod metrics;
pub mod probe;
pub mod scenario;
pub mod service;
pub mod substrate;

pub use flags::{merge_flags, Flags};
pub use metrics::{MetricSample, Snapshot};
pub use probe::{MetricCondition, Readiness, WaitOptions};
pub use scenario::{Scenario, ScenarioConfig};
pub use service::{Role, Service, ServiceSpec, ServiceState};
pub use substrate::{
    Docker, LaunchContext, LocalProcess, Running, Substrate,
    SHARED_DIR_PLACEHOLDER,
};
