//! Tracing setup for embedders that do not install their own subscriber
//!
//! Crate events go through an `EnvFilter` at the requested level and a
//! compact fmt layer. `RUST_LOG` directives still apply on top.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
    Silent,
}

impl LogLevel {
    fn as_level(self) -> Option<Level> {
        match self {
            LogLevel::Silent => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warning => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
        }
    }
}

/// Install the global subscriber once. Later calls are no-ops.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_logging_inner(level);
    });
    result
}

fn directive(s: &str) -> std::result::Result<tracing_subscriber::filter::Directive, ConfigError> {
    s.parse().map_err(|e| ConfigError::LogDirective(format!("{}: {}", s, e)))
}

fn filter_for(level: Level) -> Result<EnvFilter> {
    Ok(EnvFilter::from_default_env()
        .add_directive(directive(&format!("veloguard_dataplane={}", level))?)
        .add_directive(directive("tokio=warn")?))
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let Some(tracing_level) = level.as_level() else {
        return Ok(());
    };

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(filter_for(tracing_level)?);

    // Embedders may have installed their own subscriber already
    if tracing_subscriber::registry().with(fmt_layer).try_init().is_ok() {
        tracing::info!("Logging initialized at level: {:?}", level);
    }
    Ok(())
}
