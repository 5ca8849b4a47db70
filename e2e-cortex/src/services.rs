// Copyright 2024 Oxide Computer Company
//! Cortex components.
//!
//! Each constructor takes the flags that select a storage setup (see
//! [`chunks_storage_flags`]) and an image. An empty image means the
//! current build, [`default_image`].

use e2e::{Flags, Readiness, Role, ServiceSpec, SHARED_DIR_PLACEHOLDER};

use crate::db::{CONSUL_HTTP_PORT, CONSUL_NAME, DYNAMODB_NAME, DYNAMODB_PORT};
use crate::schema::SCHEMA_CONFIG_FILE;

/// Environment variable naming the image of the current build.
pub const IMAGE_ENV: &str = "CORTEX_IMAGE";
pub const DEFAULT_IMAGE: &str = "quay.io/cortexproject/cortex:latest";

pub const HTTP_PORT: u16 = 80;
pub const GRPC_PORT: u16 = 9095;

pub const DEFAULT_TOKENS_PER_INGESTER: u32 = 512;

/// The image under test.
pub fn default_image() -> String {
    match std::env::var(IMAGE_ENV) {
        Ok(image) if !image.is_empty() => image,
        _ => DEFAULT_IMAGE.to_string(),
    }
}

/// Chunks storage on the local DynamoDB, with the schema read from the
/// shared directory.
pub fn chunks_storage_flags() -> Flags {
    Flags::new()
        .with(
            "-dynamodb.url",
            format!("dynamodb://u:p@{}.:{}", DYNAMODB_NAME, DYNAMODB_PORT),
        )
        .with("-dynamodb.poll-interval", "1m")
        .with(
            "-config-yaml",
            format!("{}/{}", SHARED_DIR_PLACEHOLDER, SCHEMA_CONFIG_FILE),
        )
        .with("-table-manager.retention-period", "168h")
}

fn ring_flags() -> Flags {
    Flags::new()
        .with("-ring.store", "consul")
        .with(
            "-consul.hostname",
            format!("{}:{}", CONSUL_NAME, CONSUL_HTTP_PORT),
        )
}

fn cortex_service(
    name: &str,
    role: Role,
    defaults: Flags,
    flags: &Flags,
    image: &str,
) -> ServiceSpec {
    let defaults = defaults
        .with("-target", role.to_string())
        .with("-log.level", "warn");

    ServiceSpec::new(name, role, &default_image())
        .with_version(image)
        .with_flags(defaults.merge(flags))
        .with_ports(&[HTTP_PORT, GRPC_PORT])
        .with_readiness(Readiness::http(HTTP_PORT, "/ready"))
        .with_metrics_port(HTTP_PORT)
}

pub fn new_ingester(name: &str, flags: &Flags, image: &str) -> ServiceSpec {
    let defaults = ring_flags()
        .with("-ingester.final-sleep", "0s")
        .with("-ingester.join-after", "0s")
        .with("-ingester.min-ready-duration", "0s")
        .with("-ingester.concurrent-flushes", "10")
        .with("-ingester.max-transfer-retries", "10")
        .with("-ingester.num-tokens", DEFAULT_TOKENS_PER_INGESTER.to_string());
    cortex_service(name, Role::Ingester, defaults, flags, image)
}

pub fn new_distributor(name: &str, flags: &Flags, image: &str) -> ServiceSpec {
    let defaults = ring_flags()
        .with("-distributor.remote-timeout", "2s")
        .with("-distributor.replication-factor", "1");
    cortex_service(name, Role::Distributor, defaults, flags, image)
}

pub fn new_querier(name: &str, flags: &Flags, image: &str) -> ServiceSpec {
    let defaults = ring_flags().with("-distributor.replication-factor", "1");
    cortex_service(name, Role::Querier, defaults, flags, image)
}

pub fn new_table_manager(
    name: &str,
    flags: &Flags,
    image: &str,
) -> ServiceSpec {
    cortex_service(name, Role::TableManager, Flags::new(), flags, image)
}

#[cfg(test)]
mod test {
    use super::*;
    use e2e::merge_flags;

    #[test]
    fn ingester_defaults_and_overrides() {
        let flags = merge_flags(
            &chunks_storage_flags(),
            &Flags::new().with("-ingester.join-after", "10s"),
        );
        let spec = new_ingester("ingester-2", &flags, "");

        assert_eq!(spec.role, Role::Ingester);
        assert_eq!(spec.flags.get("-target"), Some("ingester"));
        assert_eq!(spec.flags.get("-ingester.join-after"), Some("10s"));
        assert_eq!(spec.flags.get("-ingester.num-tokens"), Some("512"));
        assert_eq!(spec.flags.get("-ring.store"), Some("consul"));
        assert_eq!(spec.flags.get("-consul.hostname"), Some("consul:8500"));
        assert_eq!(
            spec.flags.get("-config-yaml"),
            Some("{shared}/chunks-storage-schema-dynamodb.yaml")
        );
        assert!(spec
            .args()
            .contains(&"-ingester.join-after=10s".to_string()));
    }

    #[test]
    fn version_selects_image() {
        let spec = new_querier(
            "querier",
            &chunks_storage_flags(),
            "quay.io/cortexproject/cortex:v0.6.0",
        );
        assert_eq!(spec.artifact(), "quay.io/cortexproject/cortex:v0.6.0");

        let spec = new_querier("querier", &chunks_storage_flags(), "");
        assert_eq!(spec.version, "");
        assert_eq!(spec.artifact(), spec.image);
    }

    #[test]
    fn every_component_is_probed_and_scraped_on_http() {
        let flags = chunks_storage_flags();
        for spec in [
            new_ingester("ingester-1", &flags, ""),
            new_distributor("distributor", &flags, ""),
            new_querier("querier", &flags, ""),
            new_table_manager("table-manager", &flags, ""),
        ] {
            assert_eq!(spec.ports, vec![HTTP_PORT, GRPC_PORT]);
            assert_eq!(spec.metrics_port, Some(HTTP_PORT));
            assert_eq!(spec.readiness, Readiness::http(HTTP_PORT, "/ready"));
            assert_eq!(
                spec.flags.get("-target"),
                Some(spec.role.to_string().as_str())
            );
        }
    }

    #[test]
    fn table_manager_has_no_ring() {
        let spec =
            new_table_manager("table-manager", &chunks_storage_flags(), "");
        assert_eq!(spec.flags.get("-ring.store"), None);
        assert_eq!(
            spec.flags.get("-table-manager.retention-period"),
            Some("168h")
        );
    }
}
