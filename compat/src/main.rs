// Copyright 2024 Oxide Computer Company
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use compat::CompatConfig;
use e2e::Docker;
use e2e_common::build_logger_with_level;
use slog::Level;

/// compat: rolling upgrade compatibility check
#[derive(Debug, Parser)]
#[clap(name = "compat", term_width = 80)]
#[clap(about = "Checks compatibility across versions", long_about = None)]
struct Args {
    /// TOML configuration file. Missing keys take their defaults.
    #[clap(long, global = true, action)]
    config: Option<PathBuf>,

    /// Image of the previous release
    #[clap(long, global = true, action)]
    previous_image: Option<String>,

    /// Image of the current build
    #[clap(long, global = true, action)]
    current_image: Option<String>,

    /// Tenant to push and query as
    #[clap(long, global = true, action)]
    tenant: Option<String>,

    /// Log every poll
    #[clap(long, global = true, action)]
    debug: bool,

    #[clap(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Run the scenario with docker.
    Run,
    /// Print the effective configuration as TOML.
    ShowConfig,
}

fn effective_config(args: &Args) -> Result<CompatConfig> {
    let mut config = match &args.config {
        Some(path) => CompatConfig::load(path)?,
        None => CompatConfig::default(),
    };
    if let Some(image) = &args.previous_image {
        config.previous_image = image.clone();
    }
    if let Some(image) = &args.current_image {
        config.current_image = image.clone();
    }
    if let Some(tenant) = &args.tenant {
        config.tenant = tenant.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = effective_config(&args)?;

    match args.action {
        Action::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Action::Run => {
            let level = if args.debug { Level::Debug } else { Level::Info };
            let log = build_logger_with_level(level);
            let substrate = Arc::new(Docker::new(&config.docker));
            compat::run(&config, substrate, &log).await
        }
    }
}
