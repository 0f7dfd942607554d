//! Log output of the `worldbuild` CLI.
//!
//! Log lines go to stderr; stdout is left to command output (plans, database
//! listings, build result summaries) so it can be piped. The CLI verbosity
//! applies to the WorldBuild crates only and dependencies log warnings.
//! `RUST_LOG`, when set, replaces that default filter entirely.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log targets of the WorldBuild crates (library crates and the binary).
const WORLDBUILD_TARGETS: [&str; 3] = ["artifact_db", "worldbuild_core", "worldbuild"];

/// Filter used when `RUST_LOG` is unset: `warn` globally, `level` for WorldBuild.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    WORLDBUILD_TARGETS
        .iter()
        .fold(String::from("warn"), |mut directives, target| {
            directives.push(',');
            directives.push_str(target);
            directives.push('=');
            directives.push_str(&level);
            directives
        })
}

/// Install the process-wide subscriber for a `worldbuild` run.
///
/// `json` selects newline-delimited JSON records (one object per event with
/// its `event` field) instead of human-readable lines. Only the first call in
/// a process installs anything.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().with_target(false).json().with_writer(std::io::stderr))
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_scope_verbosity_to_worldbuild_crates() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,artifact_db=debug,worldbuild_core=debug,worldbuild=debug"
        );
        assert!(EnvFilter::try_new(default_directives(Level::TRACE)).is_ok());
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
        tracing::info!(event = "telemetry.test");
    }
}
