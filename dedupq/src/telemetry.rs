//! Tracing subscriber setup for binaries embedding the crate.
//!
//! The library itself only emits `tracing` events; nothing is printed unless
//! the host installs a subscriber, either its own or this one.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Level variable consulted when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "DEDUPQ_LOG";

fn filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = match std::env::var(LOG_LEVEL_ENV).as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!("dedupq={level}"))
}

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `DEDUPQ_LOG` picks the crate's level
/// (default `info`). `LOG_FORMAT=json` switches to JSON lines. Does nothing if
/// a global subscriber is already installed.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
