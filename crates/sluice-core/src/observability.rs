//! Observability infrastructure shared by every worker process.
//!
//! Provides the logging bootstrap and span constructors so scheduling
//! components emit consistently shaped structured logs.

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
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `sluice_flow=debug`)
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

/// Creates a span for scheduling operations with standard fields.
#[must_use]
pub fn scheduling_span(operation: &str, worker_key: &str) -> Span {
    tracing::info_span!("scheduling", op = operation, worker = worker_key)
}

/// Creates a span covering one task execution.
#[must_use]
pub fn execution_span(operation: &str, dag_ins_id: &str, task_ins_id: &str) -> Span {
    tracing::info_span!(
        "execution",
        op = operation,
        dag_ins_id = dag_ins_id,
        task_ins_id = task_ins_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = scheduling_span("dispatch", "worker-1");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }
}
