//! Headless script host.
//!
//! Parses a run configuration from the command line, prepares page contexts
//! carrying settings and network policy, injects the native `phantom`, `fs` and
//! `console` bridges into the script scope, evaluates the bundled bootstrap
//! script and finally runs the user script.

pub mod config;
pub mod console;
pub mod fs;
pub mod host;
pub mod lifecycle;
pub mod page;
pub mod phantom;
pub mod scripting;

pub use config::{parse_args, NetworkProxy, ParseOutcome, ProxySetting, RunConfiguration};
pub use console::{ConsoleRelay, SharedBuffer};
pub use host::{HostEnvironment, ProcessHost};
pub use lifecycle::{Lifecycle, SCRIPT_FAILURE_EXIT_CODE};
pub use page::{NetworkPolicy, PageId, PageSettings};
pub use phantom::{Phantom, PhantomError};

/// Version string reported by `--version`.
pub const VERSION_STRING: &str = concat!(env!("CARGO_PKG_VERSION"), " (development)");

/// Bootstrap script bundled into the binary, evaluated before every user script.
pub const BOOTSTRAP_SCRIPT: &str = include_str!("bootstrap.rhai");

/// User agent reported by pages unless the host supplies its own.
pub const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Unknown; Linux) AppleWebKit/534.34 (KHTML, like Gecko) phantom/",
    env!("CARGO_PKG_VERSION"),
    " Safari/534.34"
);

/// `(major, minor, patch)` of this build.
pub fn version() -> (i64, i64, i64) {
    let part = |s: &str| s.parse::<i64>().unwrap_or(0);
    (
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        part(env!("CARGO_PKG_VERSION_PATCH")),
    )
}
