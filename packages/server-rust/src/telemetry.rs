//! Log subscriber setup.
//!
//! The library only emits `tracing` events and `metrics` counters. Binaries
//! embedding the server may call [`try_init`] or install their own subscriber.

use tracing_subscriber::EnvFilter;

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directives used when `RUST_LOG` is unset, e.g. `"info,tether_server=debug"`.
    pub filter: String,
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// `RUST_LOG` wins over the configured directives.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured directives do not parse.
    pub fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.filter)
                .map_err(|err| anyhow::anyhow!("invalid log filter {:?}: {err}", self.filter)),
        }
    }
}

/// Installs a global `fmt` subscriber writing to stderr.
///
/// # Errors
///
/// Returns an error if the filter is invalid or a global subscriber is
/// already installed.
pub fn try_init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("failed to install log subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_directives_are_reported() {
        let config = LoggingConfig {
            filter: "tether_server=notalevel".to_string(),
            json: false,
        };
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(config.env_filter().is_err());
        }
    }

    #[test]
    fn second_install_fails() {
        let config = LoggingConfig::default();
        // The first call may lose to another test; the second never wins.
        let _ = try_init(&config);
        assert!(try_init(&LoggingConfig { json: true, ..config }).is_err());
    }
}
