//! Logging initialization
//!
//! Installs a `tracing` subscriber with an `EnvFilter` and either a
//! human-readable or JSON formatter. `RUST_LOG` overrides the default filter.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter, Layer};

use crate::{Error, Result};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,controller_samples=debug,kube=info,tower=warn,hyper=warn";

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable development output
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::validation_for_field(
                "log_format",
                format!("unknown log format {other:?}, expected text or json"),
            )),
        }
    }
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already set.
pub fn init(format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let output_layer = match format {
        LogFormat::Text => fmt_layer::layer().with_target(true).boxed(),
        LogFormat::Json => fmt_layer::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(output_layer)
        .try_init()
        .map_err(|e| Error::internal_with_context("telemetry", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("text", LogFormat::Text)]
    #[case("json", LogFormat::Json)]
    #[case("JSON", LogFormat::Json)]
    fn log_format_parses(#[case] input: &str, #[case] expected: LogFormat) {
        assert_eq!(input.parse::<LogFormat>().unwrap(), expected);
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let err = "logfmt".parse::<LogFormat>().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn second_init_fails() {
        // Whichever call wins, the other must report an error
        let first = init(LogFormat::Text);
        let second = init(LogFormat::Json);
        assert!(first.is_err() || second.is_err());
    }
}
