//! # Logging
//!
//! Thin `tracing-subscriber` bootstrap, mirroring the teacher's
//! `init_logging`: env-filter driven level, JSON or pretty-text formatting
//! picked by config.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber. Call exactly once, from
/// `main`, before spawning any engine task.
pub fn init(log_level: &str, log_format: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_format {
        "json" => {
            fmt()
                .with_env_filter(filter)
                .json()
                .with_target(true)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }
}
