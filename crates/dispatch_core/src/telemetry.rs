//! Structured logging for dispatch processes.
//!
//! One fmt layer, filtered per layer, over a span registry. Runtime
//! components run inside a `component` span, so JSON output carries the
//! component name and gateway instance next to every event.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{info, Subscriber};
use tracing_subscriber::fmt::{self, format::FmtSpan, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, TelemetryConfig};

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Handle returned once telemetry is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Install the global subscriber for `service` on first call; later calls
/// are no-ops.
///
/// `RUST_LOG`, when set, takes precedence over the configured filter.
pub fn initialise(config: &TelemetryConfig, service: &str) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| -> Result<(), TelemetryError> {
            let filter = build_filter(config)?;
            let layer = format_layer::<Registry, _>(
                config.log_format,
                io::stderr,
                io::stderr().is_terminal(),
            );
            tracing_subscriber::registry()
                .with(layer.with_filter(filter))
                .try_init()?;
            info!(service, format = %config.log_format, "telemetry initialised");
            Ok(())
        })
        .map(|_| TelemetryHandle)
}

fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| config.log_filter.clone());
    EnvFilter::try_new(directives).map_err(|error| TelemetryError::Filter(error.to_string()))
}

/// The fmt layer for `format`, writing UTC RFC 3339 timestamps to `writer`.
fn format_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::Json => base
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Compact => base
            .compact()
            .with_ansi(ansi)
            .with_span_events(FmtSpan::NONE)
            .boxed(),
    }
}
