use tracing::error;
use tracing_subscriber::{EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt};

use crate::config::{LogFormat, LoggingConfig};

/// `RUST_LOG` wins, then `LOG_LEVEL`, then INFO.
pub fn get_env_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        level
            .and_then(|l| EnvFilter::try_new(l).ok())
            .unwrap_or_else(|| EnvFilter::default().add_directive(LevelFilter::INFO.into()))
    })
}

pub fn setup_logging(config: &LoggingConfig) {
    let env_filter = get_env_filter(config.level.as_deref());

    let result = match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_filter(env_filter),
            ),
        ),
        LogFormat::Compact => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().compact().with_filter(env_filter)),
        ),
    };

    if let Err(e) = result {
        error!("logger was already initiated, continuing: {:?}", e);
    }
}
