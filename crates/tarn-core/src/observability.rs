//! Observability infrastructure for Tarn.
//!
//! Structured logging with consistent spans: every mutating lake operation
//! runs under a span carrying the operation name and pool coordinates, so a
//! single grep correlates a commit attempt across retries.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops. `RUST_LOG` controls levels (e.g. `info`,
/// `tarn_lake=debug`).
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for lake operations with standard fields.
///
/// # Example
///
/// ```rust
/// use tarn_core::observability::lake_span;
///
/// let span = lake_span("load", "01ARZ3NDEKTSV4RRFFQ69G5FAV", "main");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn lake_span(operation: &str, pool: &str, branch: &str) -> Span {
    tracing::info_span!("lake", op = operation, pool = pool, branch = branch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn span_helper_creates_span() {
        let span = lake_span("load", "pool", "main");
        let _guard = span.enter();
        tracing::info!("message in span");
    }
}
