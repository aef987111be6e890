use crate::Environment;
use tracing_error::ErrorLayer;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install color-eyre with a project-standard configuration.
///
/// Call this early in main() before any fallible operations to ensure
/// colored error output. Safe to call multiple times.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Initialize tracing with environment-aware configuration.
///
/// - **Production** (`APP_ENV=production`): JSON format for log aggregation,
///   `info` default level, hidden module targets.
/// - **Development** (default): pretty-printed human-readable output,
///   `debug` default level.
///
/// `RUST_LOG` overrides the default filter in both environments
/// (e.g. `RUST_LOG=matching_api=trace,qdrant_client=warn`).
///
/// Safe to call multiple times: a second initialization is silently ignored
/// (common in tests).
pub fn init_tracing(environment: &Environment) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if environment.is_production() {
            EnvFilter::new("info,tower_http=warn,hyper=warn")
        } else {
            EnvFilter::new("debug,tower_http=info,hyper=info,reqwest=info")
        }
    });

    if environment.is_production() {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(ErrorLayer::default())
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(true),
            )
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(ErrorLayer::default())
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init();
    }

    tracing::debug!(
        production = environment.is_production(),
        "Tracing initialized"
    );
}
