use std::str::FromStr;

use anyhow::Context;
use strum_macros::{EnumString, VariantNames};

#[derive(EnumString, strum_macros::Display, VariantNames, Eq, PartialEq, Debug, Clone, Copy)]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use strum::VariantNames;
        LogFormat::from_str(s).with_context(|| {
            format!(
                "Unrecognized log format. Please specify one of: {:?}",
                LogFormat::VARIANTS
            )
        })
    }
}

/// Initializes the global tracing subscriber. Everything goes to stderr so
/// that command output written to stdout stays machine readable.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    // We fall back to printing all spans at info-level or above if
    // the RUST_LOG environment variable is not set.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    use tracing_subscriber::prelude::*;
    let log_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr);
    let log_layer = match log_format {
        LogFormat::Json => log_layer.json().boxed(),
        LogFormat::Plain => log_layer.boxed(),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(env_filter))
        .try_init()
        .context("installing the global tracing subscriber")?;

    Ok(())
}

/// Route panics through tracing so they end up in the same sink, with the
/// same format, as the rest of the command output.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let msg = match info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        match info.location() {
            Some(location) => tracing::error!(
                "panic at {}:{}:{}: {msg}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => tracing::error!("panic: {msg}"),
        }
    }));
}
