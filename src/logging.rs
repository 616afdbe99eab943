//! Logger installation.
//!
//! The library only emits through the `log` facade. Binaries and tests call
//! [`init`] once to route those records to stderr at the configured level.

use std::sync::Once;

use crate::config::Config;

static INIT: Once = Once::new();

/// Install an `env_logger` logger filtered at `config.log_level`.
///
/// Only the first call has any effect. If another logger was already
/// installed by the host process, that logger is kept.
pub fn init(config: &Config) {
    let filter = config.log_level.to_filter();
    INIT.call_once(|| {
        let result = env_logger::Builder::new()
            .filter_level(filter)
            .format_timestamp_millis()
            .target(env_logger::Target::Stderr)
            .try_init();
        if result.is_err() {
            log::debug!("logger already installed, keeping it");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_init_is_idempotent() {
        let config = Config {
            log_level: LogLevel::Info,
            ..Config::default()
        };
        init(&config);
        init(&Config::default());
        log::info!("logger initialised twice without panicking");
    }
}
