pub mod admin_sync;
pub mod config;
pub mod dispatcher;
pub mod messages;
pub mod oauth_callback;
pub mod platform;
pub mod poller;
pub mod reconciliation;
pub mod shutdown;
pub mod state_machine;

#[cfg(test)]
pub(crate) mod testing;

use tracing_subscriber::EnvFilter;

pub use config::Config;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Crate version, suffixed with the short git hash when the release pipeline
/// provides one.
pub fn get_version() -> String {
    match option_env!("DOORMAN_GIT_HASH") {
        Some(git_hash) => {
            let short = git_hash.get(..8).unwrap_or(git_hash);
            format!("{}+{}", built_info::PKG_VERSION, short)
        }
        None => built_info::PKG_VERSION.to_string(),
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_starts_with_package_version() {
        assert!(get_version().starts_with(env!("CARGO_PKG_VERSION")));
    }
}
