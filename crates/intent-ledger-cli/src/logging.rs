use anyhow::{Context, Result};
use intent_ledger_config::LoggingSettings;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "INTENT_LEDGER_LOG";

/// Install a stderr subscriber. `INTENT_LEDGER_LOG` overrides `logging.filter`.
pub fn init_tracing(settings: &LoggingSettings) -> Result<()> {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| settings.filter.clone());
    let env_filter = EnvFilter::try_new(&filter)
        .with_context(|| format!("failed to parse log filter '{filter}'"))?;

    let json_layer = settings.json.then(|| {
        fmt::layer()
            .json()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_target(true)
            .with_ansi(false)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!settings.json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    tracing::debug!(target: "logging", filter = %filter, json = settings.json, "logging_initialized");
    Ok(())
}
