//! Command-line parsing into a [`RunConfiguration`].
//!
//! Flags are only recognized before the script path. The first token that is
//! not a flag names the script, and every token after it is handed to the
//! script verbatim, even when it looks like a flag.

use clap::error::ErrorKind;
use clap::{ArgAction, CommandFactory, Parser};
use std::ffi::OsString;
use std::path::PathBuf;

/// Port used when `--proxy` names a host without a usable port.
pub const DEFAULT_PROXY_PORT: u16 = 1080;

#[derive(Parser, Debug)]
#[command(
    name = "phantom",
    version = crate::VERSION_STRING,
    about = "Headless script host",
    override_usage = "phantom [OPTIONS] SCRIPT [ARGS]...",
    no_binary_name = true,
    args_override_self = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Args {
    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Print version
    #[arg(long, action = ArgAction::Version)]
    version: Option<bool>,

    /// Load inlined images
    #[arg(long, value_name = "yes|no", value_parser = parse_switch, require_equals = true)]
    load_images: Option<bool>,

    /// Enable plugins
    #[arg(long, value_name = "yes|no", value_parser = parse_switch, require_equals = true)]
    load_plugins: Option<bool>,

    /// Enable the disk cache
    #[arg(long, value_name = "yes|no", value_parser = parse_switch, require_equals = true)]
    disk_cache: Option<bool>,

    /// Ignore SSL errors (expired or self-signed certificates)
    #[arg(long, value_name = "yes|no", value_parser = parse_switch, require_equals = true)]
    ignore_ssl_errors: Option<bool>,

    /// Allow local content to access remote URLs
    #[arg(long, value_name = "yes|no", value_parser = parse_switch, require_equals = true)]
    local_access_remote: Option<bool>,

    /// HTTP proxy to use for every page (default port 1080)
    #[arg(long, value_name = "HOST[:PORT]", require_equals = true)]
    proxy: Option<String>,

    /// File to persist cookies in
    #[arg(long, value_name = "PATH", require_equals = true)]
    cookies: Option<String>,
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(format!("expected `yes` or `no`, got `{other}`")),
    }
}

/// HTTP proxy endpoint selected with `--proxy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySetting {
    pub host: String,
    pub port: u16,
}

impl ProxySetting {
    /// Parse `HOST[:PORT]`, splitting on the last colon.
    ///
    /// A port segment that is not a number leaves the whole value as the host
    /// and keeps [`DEFAULT_PROXY_PORT`]. So does a number outside the TCP port
    /// range, which could never address a proxy.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if let Some(idx) = value.rfind(':') {
            if idx > 0 {
                if let Ok(port) = value[idx + 1..].parse::<u16>() {
                    return Some(Self {
                        host: value[..idx].trim().to_string(),
                        port,
                    });
                }
            }
        }
        Some(Self {
            host: value.to_string(),
            port: DEFAULT_PROXY_PORT,
        })
    }
}

/// Process-wide proxy policy applied once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkProxy {
    /// Follow the system proxy configuration.
    System,
    /// Route every request through an explicit HTTP proxy.
    Http(ProxySetting),
}

/// Resolved options for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    pub proxy: Option<ProxySetting>,
    pub cookies_file: Option<PathBuf>,
    pub load_images: bool,
    pub load_plugins: bool,
    pub disk_cache: bool,
    pub ignore_ssl_errors: bool,
    pub local_access_remote: bool,
    pub script_path: PathBuf,
    pub script_args: Vec<String>,
}

impl RunConfiguration {
    /// Baseline configuration: images on, plugins off, disk cache off, SSL
    /// errors honored, local-to-remote access denied.
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            proxy: None,
            cookies_file: None,
            load_images: true,
            load_plugins: false,
            disk_cache: false,
            ignore_ssl_errors: false,
            local_access_remote: false,
            script_path: script_path.into(),
            script_args: Vec::new(),
        }
    }

    pub fn network_proxy(&self) -> NetworkProxy {
        match &self.proxy {
            Some(proxy) => NetworkProxy::Http(proxy.clone()),
            None => NetworkProxy::System,
        }
    }
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Run a script with this configuration.
    Run(RunConfiguration),
    /// `--version` was given; nothing else is consulted.
    Version,
    /// No script path (or `--help`); carries the usage text to show.
    Usage(String),
    /// Unknown option or invalid flag value; carries the rendered error.
    Rejected(String),
}

impl ParseOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ParseOutcome::Version | ParseOutcome::Rejected(_))
    }
}

/// Parse the argument vector with the program name already removed.
///
/// Only tokens starting with `--` ahead of the script are handed to clap. The
/// first other token is the script, so `-x.rhai` names a script rather than a
/// short flag. A bare `--` is an unknown option, not an end-of-options marker.
pub fn parse_args<I, T>(args: I) -> ParseOutcome
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut tokens = args.into_iter().map(Into::<OsString>::into);
    let mut flags = Vec::new();
    let mut script = None;
    let mut stray_terminator = false;
    for token in tokens.by_ref() {
        if token.to_str() == Some("--") {
            stray_terminator = true;
            break;
        }
        if token.to_string_lossy().starts_with("--") {
            flags.push(token);
        } else {
            script = Some(token.to_string_lossy().into_owned());
            break;
        }
    }

    let args = match Args::try_parse_from(flags) {
        Ok(args) => args,
        Err(err) => {
            return match err.kind() {
                ErrorKind::DisplayVersion => ParseOutcome::Version,
                ErrorKind::DisplayHelp => ParseOutcome::Usage(err.render().to_string()),
                _ => ParseOutcome::Rejected(err.render().to_string()),
            };
        }
    };
    if stray_terminator {
        let mut command = Args::command();
        let err = command.error(ErrorKind::UnknownArgument, "unexpected argument '--' found");
        return ParseOutcome::Rejected(err.render().to_string());
    }
    match script.filter(|script| !script.is_empty()) {
        Some(script) => {
            let script_args = tokens.map(|t| t.to_string_lossy().into_owned()).collect();
            args.into_outcome(script, script_args)
        }
        None => ParseOutcome::Usage(usage()),
    }
}

/// Usage text shown when no script was given.
pub fn usage() -> String {
    Args::command().render_help().to_string()
}

impl Args {
    fn into_outcome(self, script: String, script_args: Vec<String>) -> ParseOutcome {
        let mut config = RunConfiguration::new(script);
        config.script_args = script_args;
        config.proxy = self.proxy.as_deref().and_then(ProxySetting::parse);
        config.cookies_file = self
            .cookies
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        if let Some(value) = self.load_images {
            config.load_images = value;
        }
        if let Some(value) = self.load_plugins {
            config.load_plugins = value;
        }
        if let Some(value) = self.disk_cache {
            config.disk_cache = value;
        }
        if let Some(value) = self.ignore_ssl_errors {
            config.ignore_ssl_errors = value;
        }
        if let Some(value) = self.local_access_remote {
            config.local_access_remote = value;
        }
        ParseOutcome::Run(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(args: &[&str]) -> RunConfiguration {
        match parse_args(args) {
            ParseOutcome::Run(config) => config,
            other => panic!("expected a run configuration, got {other:?}"),
        }
    }

    #[test]
    fn defaults_without_flags() {
        let config = run(&["script.rhai"]);
        assert_eq!(config, RunConfiguration::new("script.rhai"));
        assert!(config.load_images);
        assert!(!config.load_plugins);
        assert!(!config.disk_cache);
        assert!(!config.ignore_ssl_errors);
        assert!(!config.local_access_remote);
        assert_eq!(config.network_proxy(), NetworkProxy::System);
    }

    #[test]
    fn boolean_flags_override_defaults() {
        let config = run(&[
            "--load-images=no",
            "--load-plugins=yes",
            "--disk-cache=yes",
            "--ignore-ssl-errors=yes",
            "--local-access-remote=yes",
            "script.rhai",
        ]);
        assert!(!config.load_images);
        assert!(config.load_plugins);
        assert!(config.disk_cache);
        assert!(config.ignore_ssl_errors);
        assert!(config.local_access_remote);
    }

    #[test]
    fn later_flag_wins() {
        let config = run(&["--load-images=no", "--load-images=yes", "script.rhai"]);
        assert!(config.load_images);
    }

    #[test]
    fn proxy_with_port() {
        let config = run(&["--proxy=host:1234", "s.rhai"]);
        assert_eq!(
            config.proxy,
            Some(ProxySetting { host: "host".into(), port: 1234 })
        );
    }

    #[test]
    fn proxy_without_port_uses_default() {
        let config = run(&["--proxy=host", "s.rhai"]);
        assert_eq!(
            config.proxy,
            Some(ProxySetting { host: "host".into(), port: DEFAULT_PROXY_PORT })
        );
    }

    #[test]
    fn proxy_with_bad_port_keeps_literal_host() {
        let config = run(&["--proxy=host:notanumber", "s.rhai"]);
        assert_eq!(
            config.proxy,
            Some(ProxySetting { host: "host:notanumber".into(), port: 1080 })
        );
    }

    #[test]
    fn proxy_port_out_of_range_keeps_literal_host() {
        assert_eq!(
            ProxySetting::parse("host:70000"),
            Some(ProxySetting { host: "host:70000".into(), port: DEFAULT_PROXY_PORT })
        );
        assert_eq!(
            ProxySetting::parse("host:65535"),
            Some(ProxySetting { host: "host".into(), port: 65535 })
        );
    }

    #[test]
    fn proxy_selects_http_policy() {
        let config = run(&["--proxy=10.0.0.1:3128", "s.rhai"]);
        assert_eq!(
            config.network_proxy(),
            NetworkProxy::Http(ProxySetting { host: "10.0.0.1".into(), port: 3128 })
        );
    }

    #[test]
    fn cookies_path_is_trimmed() {
        let config = run(&["--cookies= /tmp/jar.txt ", "s.rhai"]);
        assert_eq!(config.cookies_file, Some(PathBuf::from("/tmp/jar.txt")));
    }

    #[test]
    fn version_ignores_everything_after_it() {
        assert_eq!(parse_args(["--version"]), ParseOutcome::Version);
        assert_eq!(parse_args(["--version", "--bogus"]), ParseOutcome::Version);
        assert_eq!(parse_args(["--version", "script.rhai", "a"]), ParseOutcome::Version);
    }

    #[test]
    fn unknown_flag_is_rejected_by_name() {
        match parse_args(["--bogus", "script.rhai"]) {
            ParseOutcome::Rejected(message) => assert!(message.contains("--bogus")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn switch_value_other_than_yes_no_is_rejected() {
        match parse_args(["--load-images=maybe", "script.rhai"]) {
            ParseOutcome::Rejected(message) => assert!(message.contains("maybe")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn bare_double_dash_is_an_unknown_option() {
        match parse_args(["--", "s.rhai"]) {
            ParseOutcome::Rejected(message) => assert!(message.contains("'--'")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(parse_args(["--version", "--", "s.rhai"]), ParseOutcome::Version);
    }

    #[test]
    fn single_dash_tokens_name_the_script() {
        let config = run(&["-x.rhai", "a"]);
        assert_eq!(config.script_path, PathBuf::from("-x.rhai"));
        assert_eq!(config.script_args, vec!["a"]);
        assert_eq!(run(&["-V"]).script_path, PathBuf::from("-V"));
        assert_eq!(run(&["--disk-cache=yes", "-h"]).script_path, PathBuf::from("-h"));
    }

    #[test]
    fn long_help_shows_usage() {
        assert!(matches!(parse_args(["--help", "s.rhai"]), ParseOutcome::Usage(_)));
    }

    #[test]
    fn no_arguments_asks_for_usage() {
        let outcome = parse_args(Vec::<String>::new());
        assert!(matches!(outcome, ParseOutcome::Usage(_)));
        assert!(!outcome.is_terminal());
    }

    #[test]
    fn flags_after_script_are_script_arguments() {
        let config = run(&["--disk-cache=yes", "s.rhai", "--load-images=no", "--bogus", "x"]);
        assert!(config.disk_cache);
        assert!(config.load_images);
        assert_eq!(config.script_args, vec!["--load-images=no", "--bogus", "x"]);
    }

    proptest! {
        #[test]
        fn tokens_after_script_pass_through(
            flags in proptest::collection::vec(
                prop_oneof![
                    Just("--load-images=no"),
                    Just("--load-plugins=yes"),
                    Just("--disk-cache=yes"),
                    Just("--proxy=proxy.local:8080"),
                ],
                0..4,
            ),
            script in "[a-z][a-z0-9_]{0,8}\\.rhai",
            tail in proptest::collection::vec("[a-z0-9.]{1,8}|--[a-z]{1,6}(=[a-z]{1,3})?", 0..6),
        ) {
            let mut argv: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
            argv.push(script.clone());
            argv.extend(tail.iter().cloned());

            match parse_args(&argv) {
                ParseOutcome::Run(config) => {
                    prop_assert_eq!(config.script_path, PathBuf::from(script));
                    prop_assert_eq!(config.script_args, tail);
                }
                other => prop_assert!(false, "unexpected outcome {:?}", other),
            }
        }
    }
}
