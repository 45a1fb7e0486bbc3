//! Telemetry subscriber installation for embedders.
//!
//! The core emits structured `tracing` events at every enqueue, lease, ack,
//! nack, dead-letter, heartbeat, cascade step, gate decision, and
//! verification outcome; transporting them is the embedder's concern. These
//! helpers install a process-global subscriber the way a hosting binary
//! would, honoring `RUST_LOG` with a crate-level default. Integration tests
//! get their subscriber from `test-log` instead.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Telemetry setup errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The default filter directive did not parse.
    #[error("invalid filter directive: {message}")]
    Directive {
        /// Parse failure description.
        message: String,
    },

    /// A global subscriber is already installed.
    #[error("subscriber installation failed: {message}")]
    Init {
        /// Failure description from `tracing-subscriber`.
        message: String,
    },
}

fn env_filter() -> Result<EnvFilter, TelemetryError> {
    Ok(EnvFilter::from_default_env().add_directive(
        "switchyard=info"
            .parse()
            .map_err(|error: tracing_subscriber::filter::ParseError| TelemetryError::Directive {
                message: error.to_string(),
            })?,
    ))
}

/// Installs a human-readable global subscriber, filtered by `RUST_LOG` with
/// `switchyard=info` as the default directive.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_telemetry() -> Result<(), TelemetryError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter()?)
        .try_init()
        .map_err(|error| TelemetryError::Init {
            message: error.to_string(),
        })
}

/// Installs a JSON-formatted global subscriber for log-pipeline ingestion,
/// with the same filtering as [`init_telemetry`].
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_json_telemetry() -> Result<(), TelemetryError> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter()?)
        .try_init()
        .map_err(|error| TelemetryError::Init {
            message: error.to_string(),
        })
}
