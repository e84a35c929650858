//! Configuration loading for the member process
//!
//! Sources, lowest precedence first: `conf/application.yml`, `QUINCE__*`
//! environment variables, then command line arguments.

use anyhow::Context;
use clap::Parser;
use config::{Config, Environment};
use quince_core::Configuration;
use quince_core::model::{
    BIND_ADDRESS_PROPERTY, LOCATORS_PROPERTY, LOCK_TIMEOUT_PROPERTY, MEMBER_NAME_PROPERTY,
    SEARCH_TIMEOUT_PROPERTY,
};

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

/// Command line arguments for the member process
#[derive(Debug, Default, Parser)]
#[command(name = "quince-server", version, about)]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", env = "QUINCE_CONFIG_FILE")]
    pub config_file: Option<String>,
    /// Member name to join the cluster with
    #[arg(short = 'n', long = "name")]
    pub member_name: Option<String>,
    /// Locators, e.g. `host1[10334],host2[10335]`
    #[arg(short = 'l', long = "locators")]
    pub locators: Option<String>,
    #[arg(short = 'b', long = "bind-address")]
    pub bind_address: Option<String>,
    /// Lock timeout in seconds
    #[arg(long = "lock-timeout")]
    pub lock_timeout: Option<u64>,
    /// Search timeout in seconds
    #[arg(long = "search-timeout")]
    pub search_timeout: Option<u64>,
}

/// Parse the process arguments and load the configuration
pub fn load() -> anyhow::Result<Configuration> {
    build(Cli::parse())
}

/// Build the configuration for already parsed arguments
pub fn build(args: Cli) -> anyhow::Result<Configuration> {
    let file = args
        .config_file
        .clone()
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

    let mut builder = Config::builder()
        .add_source(config::File::with_name(&file).required(false))
        .add_source(
            Environment::with_prefix("QUINCE")
                .keep_prefix(true)
                .separator("__")
                .try_parsing(true),
        );

    if let Some(v) = args.member_name {
        builder = builder.set_override(MEMBER_NAME_PROPERTY, v)?;
    }
    if let Some(v) = args.locators {
        builder = builder.set_override(LOCATORS_PROPERTY, v)?;
    }
    if let Some(v) = args.bind_address {
        builder = builder.set_override(BIND_ADDRESS_PROPERTY, v)?;
    }
    if let Some(v) = args.lock_timeout {
        builder = builder.set_override(LOCK_TIMEOUT_PROPERTY, v)?;
    }
    if let Some(v) = args.search_timeout {
        builder = builder.set_override(SEARCH_TIMEOUT_PROPERTY, v)?;
    }

    let config = builder
        .build()
        .with_context(|| format!("failed to build configuration from {}", file))?;
    Ok(Configuration::from_config(config))
}
