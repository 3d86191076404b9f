pub mod autofill;
pub mod cli;
pub mod config;
pub mod credential;
pub mod credential_store;
pub mod host;
pub mod login;
pub mod page;
pub mod secret;
pub mod staging;

mod version;

/// Environment variable holding the log filter, e.g. `oneclick_lib=debug`.
pub const LOG_ENV: &str = "ONECLICK_LOG";

/// Route `log` records to stderr. Defaults to `info` when `ONECLICK_LOG` is
/// unset or invalid. Safe to call more than once.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
