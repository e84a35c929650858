//! File-based logging for the member process.
//!
//! Besides the root `quince.log`, each subsystem writes to its own file with
//! daily rotation:
//!
//! | Log File       | Component                         | Target Prefixes                                  |
//! |----------------|-----------------------------------|--------------------------------------------------|
//! | quince.log     | Root logger (all components)      | (all)                                            |
//! | lock.log       | Distributed lock service          | quince_consistency::lock                         |
//! | membership.log | Views, departures, scope records  | quince_core::cluster, quince_consistency::scope  |
//! | region.log     | Region operations                 | quince_core::region, quince_core::cache          |
//! | search.log     | Net search, loaders, messaging    | quince_core::service                             |
//!
//! Log files are stored in `~/quince/logs` by default. Override with
//! `QUINCE_LOG_DIR` or the `quince.logs.path` config key.

use std::path::PathBuf;

use quince_core::Configuration;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub const LOG_PATH_PROPERTY: &str = "quince.logs.path";
pub const LOG_CONSOLE_PROPERTY: &str = "quince.logs.console";
pub const LOG_FILE_PROPERTY: &str = "quince.logs.file";
pub const LOG_LEVEL_PROPERTY: &str = "quince.logs.level";

struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
}

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "lock.log",
        targets: &["quince_consistency::lock"],
    },
    ComponentLogDef {
        file_name: "membership.log",
        targets: &[
            "quince_core::cluster",
            "quince_core::service::member_event",
            "quince_consistency::scope",
        ],
    },
    ComponentLogDef {
        file_name: "region.log",
        targets: &["quince_core::region", "quince_core::cache"],
    },
    ComponentLogDef {
        file_name: "search.log",
        targets: &[
            "quince_core::service::net_search",
            "quince_core::service::loader",
            "quince_core::service::messenger",
        ],
    },
];

/// Log rotation policy
#[derive(Debug, Clone, Copy)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration for the process
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub console_level: Level,
    pub file_logging: bool,
    pub file_level: Level,
    pub rotation: LogRotation,
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/quince/logs", home))
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            console_level: Level::INFO,
            file_logging: true,
            file_level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Read the `quince.logs.*` keys; `QUINCE_LOG_DIR` wins over the path key
    pub fn from_configuration(configuration: &Configuration) -> Self {
        let config = &configuration.config;
        let log_dir = std::env::var("QUINCE_LOG_DIR")
            .ok()
            .or_else(|| config.get_string(LOG_PATH_PROPERTY).ok())
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_log_dir);

        let level = config
            .get_string(LOG_LEVEL_PROPERTY)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::INFO);

        Self {
            log_dir,
            console_output: config.get_bool(LOG_CONSOLE_PROPERTY).unwrap_or(true),
            console_level: level,
            file_logging: config.get_bool(LOG_FILE_PROPERTY).unwrap_or(true),
            file_level: level,
            rotation: LogRotation::Daily,
        }
    }
}

/// Keeps the non-blocking file writers alive; flushes them when dropped
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level for the console and root file.
/// Component files capture everything from their targets.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
    }

    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(filter);
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        let root_appender =
            RollingFileAppender::new(config.rotation.into(), &config.log_dir, "quince.log");
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.file_level.to_string()));
        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(root_filter);
        layers.push(Box::new(root_layer));

        for component in COMPONENT_LOGS {
            let appender = RollingFileAppender::new(
                config.rotation.into(),
                &config.log_dir,
                component.file_name,
            );
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let mut targets = Targets::new();
            for target in component.targets {
                targets = targets.with_target(*target, LevelFilter::TRACE);
            }

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_filter(targets);
            layers.push(Box::new(layer));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            component_files = COMPONENT_LOGS.len(),
            "File logging initialized"
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}
