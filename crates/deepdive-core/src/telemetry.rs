use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::DeepDiveError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// Configuration options when initialising telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Filter directive; falls back to `RUST_LOG`, then the config level.
    pub env_filter: Option<String>,
    pub default_level: String,
    pub with_ansi: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            default_level: "info".to_string(),
            with_ansi: true,
        }
    }
}

/// Initialise the global tracing subscriber.
///
/// Safe to call multiple times; only the first invocation installs the subscriber.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), DeepDiveError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = options
        .env_filter
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or(options.default_level);

    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_ansi(options.with_ansi)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| {
            DeepDiveError::InvalidConfiguration(format!("telemetry init failed: {err}"))
        })?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}
