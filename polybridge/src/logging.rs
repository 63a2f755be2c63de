//! Tracing setup shared by embedding programs and the reference worker.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directives: `RUST_LOG` wins, else `POLYBRIDGE_LOG` picks the level.
fn filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = match std::env::var("POLYBRIDGE_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!("polybridge={level},polybridge_worker={level}"))
}

/// Install a stderr subscriber; `LOG_FORMAT=json` switches to JSON lines.
///
/// A no-op when a global subscriber is already set.
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
            .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
