// Copyright 2024 Oxide Computer Company
//! Checks that a rolling upgrade from the previous release keeps data
//! queryable: an old ingester hands its in-memory chunks to a new one, and
//! both the old and the new querier read them back.

pub mod config;
pub mod driver;

pub use config::CompatConfig;
pub use driver::{run, Querier, Stage};
