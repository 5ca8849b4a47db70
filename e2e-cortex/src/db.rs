// Copyright 2024 Oxide Computer Company
//! Backend dependencies: the ring store and the index/chunk store.

use e2e::{Readiness, Role, ServiceSpec};

pub const CONSUL_IMAGE: &str = "consul:0.9";
pub const CONSUL_NAME: &str = "consul";
pub const CONSUL_HTTP_PORT: u16 = 8500;

pub const DYNAMODB_IMAGE: &str = "amazon/dynamodb-local:1.11.477";
pub const DYNAMODB_NAME: &str = "dynamodb";
pub const DYNAMODB_PORT: u16 = 8000;

/// A single node consul in dev mode, used as the ring backend.
pub fn new_consul() -> ServiceSpec {
    ServiceSpec::new(CONSUL_NAME, Role::Coordination, CONSUL_IMAGE)
        .with_command([
            "agent",
            "-server",
            "-client=0.0.0.0",
            "-dev",
            "-log-level=err",
        ])
        .with_ports(&[CONSUL_HTTP_PORT])
        .with_readiness(Readiness::http_status(
            CONSUL_HTTP_PORT,
            "/v1/operator/autopilot/health",
            200..=200,
        ))
}

/// In memory DynamoDB. It answers 400 to an unsigned `GET /` once it is
/// serving.
pub fn new_dynamodb() -> ServiceSpec {
    ServiceSpec::new(DYNAMODB_NAME, Role::Storage, DYNAMODB_IMAGE)
        .with_command(["-jar", "DynamoDBLocal.jar", "-inMemory", "-sharedDb"])
        .with_ports(&[DYNAMODB_PORT])
        .with_readiness(Readiness::http_status(DYNAMODB_PORT, "/", 400..=400))
}
