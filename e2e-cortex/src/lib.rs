// Copyright 2024 Oxide Computer Company
//! Cortex on top of the `e2e` harness: component definitions, the backend
//! dependencies they need, and a client for the write and query paths.

pub mod client;
pub mod db;
pub mod prompb;
pub mod query;
pub mod schema;
pub mod series;
pub mod services;

pub use client::{Client, PushResponse};
pub use db::{new_consul, new_dynamodb};
pub use query::{QueryResult, VectorSample};
pub use schema::{SCHEMA_CONFIG_FILE, SCHEMA_CONFIG_YAML};
pub use series::generate_series;
pub use services::{
    chunks_storage_flags, default_image, new_distributor, new_ingester,
    new_querier, new_table_manager,
};
