//! Tracing subscriber setup for hosts embedding the audio service
//!
//! The library only emits `tracing` events under the `audio_policy_core`
//! target. [`setup_logging`] installs a subscriber that shows the service at
//! one level, lets single state machines be turned up on their own
//! (`sco`, `mode`, `worker`, ...) and keeps everything else at `warn`.
//! `RUST_LOG`, when set, replaces the whole filter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{AudioPolicyError, Result};

const CRATE_TARGET: &str = "audio_policy_core";

/// Modules that can get their own level
pub const COMPONENTS: [&str; 10] = [
    "service",
    "worker",
    "volume",
    "ringer",
    "safe_volume",
    "sco",
    "mode",
    "routing",
    "lifetime",
    "system",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the whole service, e.g. `info`
    pub level: String,
    /// Per-component overrides, keyed by module name
    pub components: BTreeMap<String, String>,
    /// Level for every other crate
    pub dependencies: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Log span close events with their timings
    pub span_timings: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            components: BTreeMap::new(),
            dependencies: "warn".to_string(),
            json: false,
            span_timings: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Turn one component up or down, e.g. `("sco", "trace")`
    pub fn with_component(mut self, component: impl Into<String>, level: impl Into<String>) -> Self {
        self.components.insert(component.into(), level.into());
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_span_timings(mut self) -> Self {
        self.span_timings = true;
        self
    }

    /// Filter directives equivalent to this configuration
    pub fn directives(&self) -> Result<String> {
        let mut directives = vec![
            parse_level(&self.dependencies)?.to_string(),
            format!("{CRATE_TARGET}={}", parse_level(&self.level)?),
        ];
        for (component, level) in &self.components {
            if !COMPONENTS.contains(&component.as_str()) {
                return Err(AudioPolicyError::config(format!("unknown log component: {component}")));
            }
            directives.push(format!("{CRATE_TARGET}::{component}={}", parse_level(level)?));
        }
        Ok(directives.join(","))
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(self.directives()?)
            .map_err(|e| AudioPolicyError::config(format!("invalid log filter: {e}")))
    }
}

fn parse_level(level: &str) -> Result<tracing::Level> {
    level
        .parse()
        .map_err(|_| AudioPolicyError::config(format!("Invalid log level: {level}")))
}

/// Install the global subscriber
///
/// Fails with a configuration error on a bad level or component, or if a
/// global subscriber is already set.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let span_events = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let builder = fmt::Subscriber::builder()
        .with_env_filter(config.env_filter()?)
        .with_span_events(span_events)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| AudioPolicyError::config(format!("logging already initialized: {e}")))?;

    tracing::info!(version = crate::VERSION, level = %config.level, "audio policy logging ready");
    Ok(())
}
