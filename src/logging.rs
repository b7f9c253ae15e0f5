//! Logging setup shared by the CLI and the tests.

use colored::Color::{Green, Red, Yellow};
use logforth::layout::TextLayout;
use std::sync::Once;

static INIT: Once = Once::new();

/// Configuration for logging initialization.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level filter, e.g. "info" or "info,glowinfer=debug". The RUST_LOG
    /// environment variable takes precedence when set.
    pub level: String,
    /// Colored level text (info=green, warn=yellow, error=red).
    pub colored: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            colored: true,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colored = false;
        self
    }
}

/// GPU stack internals that would otherwise flood debug output.
const DEFAULT_NOISY_MODULE_LEVELS: [(&str, &str); 3] = [
    ("wgpu_core", "warn"),
    ("wgpu_hal", "warn"),
    ("naga", "warn"),
];

fn apply_default_module_levels(mut filter: String) -> String {
    for (module, level) in DEFAULT_NOISY_MODULE_LEVELS {
        let module_pattern = format!("{module}=");
        if !filter.contains(&module_pattern) {
            if !filter.is_empty() {
                filter.push(',');
            }
            filter.push_str(module);
            filter.push('=');
            filter.push_str(level);
        }
    }
    filter
}

/// Initialize logging to stderr. Idempotent: calls after the first are
/// no-ops, so tests can initialize freely.
pub fn init(config: LoggingConfig) {
    INIT.call_once(|| {
        let LoggingConfig { level, colored } = config;

        let filter_str =
            std::env::var("RUST_LOG").unwrap_or_else(|_| apply_default_module_levels(level));
        let filter = logforth::filter::EnvFilter::from_env_or("RUST_LOG", filter_str);

        let mut builder = logforth::builder();
        if colored {
            let layout = TextLayout::default()
                .info_color(Green)
                .warn_color(Yellow)
                .error_color(Red);
            builder = builder.dispatch(|d| {
                d.filter(filter)
                    .append(logforth::append::Stderr::default().with_layout(layout))
            });
        } else {
            builder = builder
                .dispatch(|d| d.filter(filter).append(logforth::append::Stderr::default()));
        }
        builder.apply();
    });
}

/// Plain stderr logging for tests.
pub fn init_stderr(level: &str) {
    init(LoggingConfig::new(level).no_color());
}

/// Default settings: stderr, colored, "info".
pub fn init_default() {
    init(LoggingConfig::default());
}
