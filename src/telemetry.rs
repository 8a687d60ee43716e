//! Tracing subscriber setup for the CLI.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter directive: `--verbose`, then `RAIDRAFT_LOG`, then `RUST_LOG`,
/// then `info`.
pub fn filter_directive(verbose: bool, lookup: impl Fn(&str) -> Option<String>) -> String {
    if verbose {
        return "debug".into();
    }
    lookup("RAIDRAFT_LOG")
        .or_else(|| lookup("RUST_LOG"))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "info".into())
}

/// Install the global subscriber. Logs go to stderr so reports on stdout
/// stay clean.
pub fn init_tracing(verbose: bool) {
    let directive = filter_directive(verbose, |k| std::env::var(k).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_precedence() {
        let env = |k: &str| match k {
            "RAIDRAFT_LOG" => Some("rai_draft=trace".to_string()),
            "RUST_LOG" => Some("warn".to_string()),
            _ => None,
        };
        assert_eq!(filter_directive(true, env), "debug");
        assert_eq!(filter_directive(false, env), "rai_draft=trace");
        assert_eq!(filter_directive(false, |k| (k == "RUST_LOG").then(|| "warn".into())), "warn");
        assert_eq!(filter_directive(false, |_| None), "info");
    }
}
