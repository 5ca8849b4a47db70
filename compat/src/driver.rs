// Copyright 2024 Oxide Computer Company
//! The rolling upgrade check.
//!
//! ```text
//! DepsStarting ─► DepsReady ─► OldIngesterReady ─► DataPushed
//!                                                      │
//!   Done ◄─ Validating(new) ◄─ Validating(old) ◄─ TransferConfirmed
//!                                                      ▲
//!                                           NewIngesterJoining
//! ```
//!
//! Each stage starts only once the one before it has been confirmed; there
//! is no retry. Whatever happens, the scenario is closed before returning.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use e2e::{Flags, MetricCondition, Scenario, Substrate};
use e2e_cortex::services::HTTP_PORT;
use e2e_cortex::{
    chunks_storage_flags, generate_series, new_consul, new_distributor,
    new_dynamodb, new_ingester, new_querier, new_table_manager, Client,
    QueryResult, VectorSample, SCHEMA_CONFIG_FILE, SCHEMA_CONFIG_YAML,
};
use reqwest::StatusCode;
use slog::{info, o, warn, Logger};

use crate::config::CompatConfig;

pub const RING_TOKENS_METRIC: &str = "cortex_ring_tokens_total";
/// Count of completed table syncs.
pub const TABLE_SYNC_METRIC: &str = "cortex_dynamo_sync_tables_seconds_count";
pub const SERIES_NAME: &str = "series_1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Querier {
    Old,
    New,
}

impl fmt::Display for Querier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Querier::Old => f.write_str("old-querier"),
            Querier::New => f.write_str("new-querier"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    DepsStarting,
    DepsReady,
    OldIngesterReady,
    DataPushed,
    NewIngesterJoining,
    TransferConfirmed,
    Validating(Querier),
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Validating(q) => write!(f, "Validating({})", q),
            s => write!(f, "{:?}", s),
        }
    }
}

/// Render a duration the way the services parse flags.
pub fn flag_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// The query must return exactly the pushed vector.
pub fn check_vector(got: &QueryResult, want: &[VectorSample]) -> Result<()> {
    let Some(v) = got.as_vector() else {
        bail!("expected a vector, got {}", got);
    };
    if v != want {
        bail!(
            "vector mismatch: got {}, want {}",
            got,
            QueryResult::Vector(want.to_vec())
        );
    }
    Ok(())
}

struct Driver<'a> {
    config: &'a CompatConfig,
    /// The stage being worked towards.
    stage: Stage,
    root: Logger,
    log: Logger,
}

impl<'a> Driver<'a> {
    fn toward(&mut self, stage: Stage) {
        info!(self.log, "{} confirmed", self.stage);
        self.stage = stage;
        self.log = self.root.new(o!("stage" => stage.to_string()));
    }

    fn storage_flags(&self) -> Flags {
        chunks_storage_flags().with(
            "-ingester.num-tokens",
            self.config.tokens_per_ingester.to_string(),
        )
    }

    async fn script(&mut self, s: &mut Scenario) -> Result<()> {
        let cfg = self.config;
        let current = cfg.current_image.as_str();
        let previous = cfg.previous_image.as_str();
        let tokens = MetricCondition::Equals(cfg.expected_ring_tokens());

        s.start_service(new_dynamodb()).await?;
        s.start_service(new_consul()).await?;

        self.toward(Stage::DepsReady);
        s.wait_ready(&["consul", "dynamodb"]).await?;

        self.toward(Stage::OldIngesterReady);
        s.write_shared_file(SCHEMA_CONFIG_FILE, SCHEMA_CONFIG_YAML.as_bytes())?;
        let flags = self.storage_flags();
        s.start_service(new_table_manager("table-manager", &flags, current))
            .await?;
        s.start_service(new_ingester("ingester-1", &flags, previous))
            .await?;
        s.start_service(new_distributor("distributor", &flags, current))
            .await?;
        s.wait_ready(&["distributor", "ingester-1", "table-manager"])
            .await?;

        // Tables exist once the first sync is done.
        s.service("table-manager")?
            .wait_metric(TABLE_SYNC_METRIC, 1.0, cfg.ready_wait())
            .await?;
        s.service("distributor")?
            .wait_metric_with(RING_TOKENS_METRIC, tokens, cfg.ring_wait())
            .await?;

        self.toward(Stage::DataPushed);
        let now = SystemTime::now();
        let (series, expected) = generate_series(SERIES_NAME, now);
        let distributor = s.endpoint("distributor", HTTP_PORT)?;
        let c = Client::with_timeout(
            Some(distributor),
            None,
            &cfg.tenant,
            cfg.client_timeout,
        )?;
        let res = c.push(&series).await?;
        if res.status != StatusCode::OK {
            bail!("push answered {}: {}", res.status, res.body.trim());
        }

        self.toward(Stage::NewIngesterJoining);
        let join = flags.merge(
            &Flags::new()
                .with("-ingester.join-after", flag_duration(cfg.join_delay)),
        );
        s.start_service(new_ingester("ingester-2", &join, current))
            .await?;

        // Stop only returns once ingester-1 has exited, and it only exits
        // after handing its chunks to ingester-2.
        self.toward(Stage::TransferConfirmed);
        s.stop_service("ingester-1").await?;

        let queriers = [(Querier::Old, previous), (Querier::New, current)];
        for (querier, image) in queriers {
            self.toward(Stage::Validating(querier));
            s.start_service(new_querier("querier", &flags, image))
                .await?;
            s.wait_ready(&["querier"]).await?;
            s.service("querier")?
                .wait_metric_with(RING_TOKENS_METRIC, tokens, cfg.ring_wait())
                .await?;

            let endpoint = s.endpoint("querier", HTTP_PORT)?;
            let c = Client::with_timeout(
                Some(distributor),
                Some(endpoint),
                &cfg.tenant,
                cfg.client_timeout,
            )?;
            let result = c.query(SERIES_NAME, now).await?;
            check_vector(&result, &expected)?;
            info!(self.log, "{} returned {}", querier, result);

            if cfg.check_tenant_isolation {
                let other = Client::with_timeout(
                    Some(distributor),
                    Some(endpoint),
                    &cfg.isolation_tenant,
                    cfg.client_timeout,
                )?;
                let result = other.query(SERIES_NAME, now).await?;
                check_vector(&result, &[]).with_context(|| {
                    format!("tenant {} sees data", cfg.isolation_tenant)
                })?;
            }

            s.stop_service("querier").await?;
        }

        self.toward(Stage::Done);
        Ok(())
    }
}

/// Run the whole check on `substrate`.
pub async fn run(
    config: &CompatConfig,
    substrate: Arc<dyn Substrate>,
    log: &Logger,
) -> Result<()> {
    let mut scenario = Scenario::new(substrate, config.scenario_config(), log)
        .await
        .context("creating scenario")?;

    let stage = Stage::DepsStarting;
    let mut driver = Driver {
        config,
        stage,
        root: log.clone(),
        log: log.new(o!("stage" => stage.to_string())),
    };

    let res = driver.script(&mut scenario).await;
    let closed = scenario.close().await;

    match (res, closed) {
        (Ok(()), Ok(())) => {
            info!(log, "backward compatibility confirmed");
            Ok(())
        }
        (Ok(()), Err(e)) => Err(e).context("closing scenario"),
        (Err(e), closed) => {
            if let Err(c) = closed {
                warn!(log, "closing scenario after failure: {}", c);
            }
            Err(e.context(format!("stage {} failed", driver.stage)))
        }
    }
}
