//! Diagnostics for `hotwire serve` and `hotwire connect`.
//!
//! The engine, channel and client runtime only emit `tracing` events; this
//! module decides where they go. Human-facing progress (`[hmr] update ...`)
//! is printed to stdout by the commands themselves, so log lines always go
//! to stderr and can be redirected separately.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Crates whose level follows `-v`.
const HOTWIRE_TARGETS: [&str; 4] = ["hotwire", "hotwire_core", "hotwire_client", "hotwire_cli"];

/// Transport crates that are chatty below `warn` (one event per frame or
/// per watcher tick) unless `RUST_LOG` asks for them.
const QUIET_TARGETS: [&str; 4] = ["hyper", "tungstenite", "tokio_tungstenite", "notify"];

fn level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Filter directives layered on top of `RUST_LOG`, later entries winning.
fn directives(verbosity: u8, rust_log: Option<&str>) -> Vec<String> {
    let level = level(verbosity);
    let mut out: Vec<String> = QUIET_TARGETS
        .iter()
        .filter(|target| !rust_log.is_some_and(|env| env.contains(*target)))
        .map(|target| format!("{target}=warn"))
        .collect();
    out.extend(HOTWIRE_TARGETS.iter().map(|target| format!("{target}={level}")));
    out
}

/// Install the global subscriber.
///
/// `verbosity` is the `-v` count: hotwire's crates log at INFO, DEBUG with
/// `-v`, TRACE with `-vv`. Everything else stays at `RUST_LOG` (default
/// `warn`). With `json`, each event is one JSON object per line.
///
/// # Panics
/// Panics if a global subscriber was already installed.
pub fn init(verbosity: u8, json: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    for directive in directives(verbosity, rust_log.as_deref()) {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_raises_hotwire_crates() {
        let quiet = directives(0, None);
        assert!(quiet.contains(&"hotwire_core=INFO".to_string()));
        assert!(quiet.contains(&"notify=warn".to_string()));

        let loud = directives(2, None);
        assert!(loud.contains(&"hotwire_client=TRACE".to_string()));
        assert!(!loud.iter().any(|d| d.ends_with("=INFO")));
    }

    #[test]
    fn test_rust_log_keeps_transport_targets() {
        let list = directives(1, Some("tungstenite=trace"));
        assert!(!list.iter().any(|d| d.starts_with("tungstenite=")));
        assert!(list.contains(&"tokio_tungstenite=warn".to_string()));
        assert!(list.contains(&"hyper=warn".to_string()));
        assert!(list.contains(&"hotwire_cli=DEBUG".to_string()));
    }
}
