// Copyright 2024 Oxide Computer Company
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use e2e::{ScenarioConfig, WaitOptions};
use serde::{Deserialize, Serialize};

/// The release the current build must stay compatible with.
pub const PREVIOUS_VERSION_IMAGE: &str = "quay.io/cortexproject/cortex:v0.6.0";

/// Ingesters holding tokens at any ring check: ingester-1 before the
/// handoff, ingester-2 after it.
pub const RING_INGESTERS: u32 = 1;

/// Settings for a compatibility run. Every field has a default, so an
/// empty file is a valid configuration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CompatConfig {
    /// Image of the previous release.
    pub previous_image: String,
    /// Image of the current build; empty uses `CORTEX_IMAGE` or latest.
    pub current_image: String,
    pub tenant: String,
    /// Tenant that must never see the data pushed for `tenant`.
    pub isolation_tenant: String,
    pub check_tenant_isolation: bool,
    /// How long the new ingester waits before joining the ring.
    #[serde(with = "humantime_serde")]
    pub join_delay: Duration,
    pub tokens_per_ingester: u32,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub ready_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub ring_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub client_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Container engine binary.
    pub docker: String,
    /// Network name prefix; each run appends its scenario id.
    pub network: String,
    /// Parent of the per run shared directory.
    pub shared_parent: PathBuf,
    pub keep_shared_dir: bool,
}

impl Default for CompatConfig {
    fn default() -> Self {
        CompatConfig {
            previous_image: PREVIOUS_VERSION_IMAGE.to_string(),
            current_image: String::new(),
            tenant: "user-1".to_string(),
            isolation_tenant: "user-2".to_string(),
            check_tenant_isolation: true,
            join_delay: Duration::from_secs(10),
            tokens_per_ingester: 512,
            poll_interval: Duration::from_secs(1),
            ready_deadline: Duration::from_secs(60),
            ring_deadline: Duration::from_secs(60),
            client_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(30),
            docker: "docker".to_string(),
            network: "e2e-cortex-test".to_string(),
            shared_parent: std::env::temp_dir(),
            keep_shared_dir: false,
        }
    }
}

impl CompatConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<CompatConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {:?}", path))?;
        CompatConfig::from_toml(&text)
            .with_context(|| format!("parsing {:?}", path))
    }

    pub fn from_toml(text: &str) -> Result<CompatConfig> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Total tokens a converged ring reports.
    pub fn expected_ring_tokens(&self) -> f64 {
        f64::from(self.tokens_per_ingester * RING_INGESTERS)
    }

    pub fn ready_wait(&self) -> WaitOptions {
        WaitOptions::new(self.poll_interval, self.ready_deadline)
    }

    pub fn ring_wait(&self) -> WaitOptions {
        WaitOptions::new(self.poll_interval, self.ring_deadline)
    }

    pub fn scenario_config(&self) -> ScenarioConfig {
        ScenarioConfig {
            network: self.network.clone(),
            shared_parent: self.shared_parent.clone(),
            ready: self.ready_wait(),
            stop_grace: self.stop_grace,
            keep_shared_dir: self.keep_shared_dir,
            ..Default::default()
        }
    }
}

/// Durations as human strings: `"10s"`, `"1m 30s"`.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        let cfg = CompatConfig::from_toml("").unwrap();
        assert_eq!(cfg, CompatConfig::default());
        assert_eq!(cfg.previous_image, PREVIOUS_VERSION_IMAGE);
        assert_eq!(cfg.expected_ring_tokens(), 512.0);
    }

    #[test]
    fn durations_are_human() {
        let cfg = CompatConfig::from_toml(
            "join_delay = \"15s\"\nring_deadline = \"2m\"\n",
        )
        .unwrap();
        assert_eq!(cfg.join_delay, Duration::from_secs(15));
        assert_eq!(cfg.ring_wait().deadline, Duration::from_secs(120));
        assert_eq!(cfg.ring_wait().interval, Duration::from_secs(1));
    }

    #[test]
    fn unknown_keys_and_bad_durations_are_rejected() {
        assert!(CompatConfig::from_toml("joinn_delay = \"15s\"").is_err());
        assert!(CompatConfig::from_toml("join_delay = \"soon\"").is_err());
        assert!(CompatConfig::from_toml("join_delay = 15").is_err());
    }

    #[test]
    fn toml_round_trips() {
        let cfg = CompatConfig {
            tenant: "tenant-a".to_string(),
            tokens_per_ingester: 128,
            join_delay: Duration::from_millis(1500),
            ..Default::default()
        };
        let text = cfg.to_toml().unwrap();
        assert!(text.contains("join_delay = \"1s 500ms\""));
        assert_eq!(CompatConfig::from_toml(&text).unwrap(), cfg);
        assert_eq!(cfg.expected_ring_tokens(), 128.0);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compat.toml");
        std::fs::write(&path, "tenant = \"user-9\"\n").unwrap();
        assert_eq!(CompatConfig::load(&path).unwrap().tenant, "user-9");
        assert!(CompatConfig::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn scenario_settings_follow() {
        let cfg = CompatConfig {
            network: "compat-net".to_string(),
            ready_deadline: Duration::from_secs(5),
            ..Default::default()
        };
        let sc = cfg.scenario_config();
        assert_eq!(sc.network, "compat-net");
        assert_eq!(sc.ready.deadline, Duration::from_secs(5));
        assert_eq!(sc.stop_grace, Duration::from_secs(30));
    }
}
