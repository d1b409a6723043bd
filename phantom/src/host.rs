//! Host environment: the process-level services the controller depends on.
//!
//! The controller never reaches for globals. Proxy selection, the user agent,
//! standard input and the final exit request all go through this handle so an
//! embedder (or a test) can substitute its own.

use std::io::{self, Read};

use crate::config::NetworkProxy;
use crate::DEFAULT_USER_AGENT;

pub trait HostEnvironment {
    /// Apply the process-wide proxy. Called once per run.
    fn set_application_proxy(&mut self, proxy: &NetworkProxy);

    /// User agent pages start with.
    fn user_agent(&self) -> String {
        DEFAULT_USER_AGENT.to_string()
    }

    /// One line from standard input, without its terminator.
    fn read_line(&mut self) -> String;

    /// The run is over; the host should wind down with `code`.
    fn exit(&mut self, code: i32);
}

/// Host backed by the real process.
#[derive(Debug, Default)]
pub struct ProcessHost {
    proxy: Option<NetworkProxy>,
}

impl ProcessHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostEnvironment for ProcessHost {
    fn set_application_proxy(&mut self, proxy: &NetworkProxy) {
        if self.proxy.is_some() {
            log::warn!("Application proxy already selected, ignoring {:?}", proxy);
            return;
        }
        match proxy {
            NetworkProxy::System => log::debug!("Using system proxy configuration"),
            NetworkProxy::Http(p) => log::info!("Using HTTP proxy {}:{}", p.host, p.port),
        }
        self.proxy = Some(proxy.clone());
    }

    fn read_line(&mut self) -> String {
        let mut line = Vec::new();
        for byte in io::stdin().lock().bytes() {
            match byte {
                Ok(b'\n') | Ok(b'\r') | Err(_) => break,
                Ok(b) => line.push(b),
            }
        }
        String::from_utf8_lossy(&line).into_owned()
    }

    /// The binary exits with the controller's return value once the script
    /// unwinds, so nothing is torn down here.
    fn exit(&mut self, code: i32) {
        log::debug!("Exit requested with code {}", code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxySetting;

    #[test]
    fn proxy_is_applied_once() {
        let mut host = ProcessHost::new();
        let first = NetworkProxy::Http(ProxySetting { host: "proxy".into(), port: 3128 });
        host.set_application_proxy(&first);
        host.set_application_proxy(&NetworkProxy::System);
        assert_eq!(host.proxy, Some(first));
    }

    #[test]
    fn default_user_agent_names_the_host() {
        assert!(ProcessHost::new().user_agent().contains("phantom/"));
    }
}
