use env_logger::{Builder, Env};
use log::LevelFilter;

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set. Defaults to `info`.
    pub default_filter: String,
    /// Headless validation warnings are noisy in tests that provoke them on
    /// purpose; this caps them. Defaults to `None` (no cap).
    pub validation_level: Option<LevelFilter>,
    /// Capture output per test instead of writing to stderr.
    pub is_test: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_owned(),
            validation_level: None,
            is_test: false,
        }
    }
}

/// Installs `env_logger` as the global logger. Only the first call has any
/// effect; later calls (from other tests, say) are ignored.
pub fn init_logging(config: &LoggingConfig) {
    let mut builder = Builder::from_env(Env::default().default_filter_or(&config.default_filter));

    if let Some(level) = config.validation_level {
        builder.filter_module("render_device::backend::headless", level);
    }

    let _ = builder.is_test(config.is_test).try_init();
}
