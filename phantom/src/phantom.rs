//! Script host controller.
//!
//! [`Phantom`] owns the scripting engine and a shared [`Session`]. The session
//! tracks live pages, the default page settings, the network policy and the
//! lifecycle; the bridge objects reach it through a weak handle while a
//! script runs.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rhai::{Engine, AST};
use thiserror::Error;

use crate::config::{ParseOutcome, RunConfiguration};
use crate::console::ConsoleRelay;
use crate::fs::absolute_path;
use crate::host::HostEnvironment;
use crate::lifecycle::{Lifecycle, SCRIPT_FAILURE_EXIT_CODE};
use crate::page::{NetworkPolicy, PageId, PageSettings, WebPage};
use crate::scripting::{self, ScriptError};
use crate::{BOOTSTRAP_SCRIPT, VERSION_STRING};

/// Exit status used when the bootstrap script cannot be used.
pub const BOOTSTRAP_FAILURE_EXIT_CODE: i32 = 1;

#[derive(Debug, Error)]
pub enum PhantomError {
    #[error("Can not bootstrap!")]
    BootstrapMissing,

    #[error("Can not bootstrap: {0}")]
    Bootstrap(#[source] ScriptError),
}

/// State shared between the controller and the script bridges.
pub(crate) struct Session {
    host: Box<dyn HostEnvironment>,
    lifecycle: Lifecycle,
    pages: Vec<WebPage>,
    primary: Option<PageId>,
    next_page_id: PageId,
    default_settings: PageSettings,
    network: Rc<NetworkPolicy>,
    library_path: PathBuf,
    script_path: Option<PathBuf>,
    script_args: Vec<String>,
    bootstrap: Option<AST>,
    relay: ConsoleRelay,
}

impl Session {
    fn new(host: Box<dyn HostEnvironment>, relay: ConsoleRelay) -> Self {
        let baseline = RunConfiguration::new(PathBuf::new());
        let default_settings = PageSettings::from_config(&baseline, host.user_agent());
        Self {
            host,
            lifecycle: Lifecycle::new(),
            pages: Vec::new(),
            primary: None,
            next_page_id: 1,
            default_settings,
            network: Rc::new(NetworkPolicy::default()),
            library_path: PathBuf::new(),
            script_path: None,
            script_args: Vec::new(),
            bootstrap: None,
            relay,
        }
    }

    /// Apply a parsed configuration and create the primary page.
    fn configure(&mut self, config: &RunConfiguration) {
        self.host.set_application_proxy(&config.network_proxy());
        self.network = Rc::new(NetworkPolicy::from_config(config));
        self.default_settings = PageSettings::from_config(config, self.host.user_agent());
        self.library_path = script_directory(&config.script_path);
        self.script_path = Some(config.script_path.clone());
        self.script_args = config.script_args.clone();
        self.primary = self.create_page();
    }

    fn add_page(&mut self) -> PageId {
        let id = self.next_page_id;
        self.next_page_id += 1;
        let mut page = WebPage::new(id, self.network.clone(), &self.default_settings);
        page.set_library_path(self.library_path.clone());
        self.pages.push(page);
        log::debug!("Created page {} ({} live)", id, self.pages.len());
        id
    }

    /// New page configured from the current defaults. `None` once exited.
    pub(crate) fn create_page(&mut self) -> Option<PageId> {
        if self.lifecycle.has_exited() {
            return None;
        }
        Some(self.add_page())
    }

    pub(crate) fn destroy_page(&mut self, id: PageId) -> bool {
        let Some(index) = self.pages.iter().position(|p| p.id() == id) else {
            return false;
        };
        self.pages.remove(index);
        if self.primary == Some(id) {
            self.primary = None;
        }
        log::debug!("Destroyed page {} ({} live)", id, self.pages.len());
        true
    }

    pub(crate) fn page(&self, id: PageId) -> Option<&WebPage> {
        self.pages.iter().find(|p| p.id() == id)
    }

    pub(crate) fn page_mut(&mut self, id: PageId) -> Option<&mut WebPage> {
        self.pages.iter_mut().find(|p| p.id() == id)
    }

    fn primary_page(&self) -> Option<&WebPage> {
        self.primary.and_then(|id| self.page(id))
    }

    /// Tear down every page and hand `code` to the host. Later calls are
    /// ignored.
    pub(crate) fn exit(&mut self, code: i32) {
        if !self.lifecycle.exit(code) {
            log::debug!("Ignoring exit({}), already exited", code);
            return;
        }
        log::info!("Exiting with code {} ({} pages destroyed)", code, self.pages.len());
        self.pages.clear();
        self.primary = None;
        self.host.exit(code);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.lifecycle.is_terminated()
    }

    pub(crate) fn script_args(&self) -> &[String] {
        &self.script_args
    }

    pub(crate) fn script_name(&self) -> String {
        self.script_path
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub(crate) fn default_settings(&self) -> &PageSettings {
        &self.default_settings
    }

    pub(crate) fn library_path(&self) -> &Path {
        &self.library_path
    }

    pub(crate) fn set_library_path(&mut self, path: PathBuf) {
        if let Some(id) = self.primary {
            if let Some(page) = self.page_mut(id) {
                page.set_library_path(path.clone());
            }
        }
        self.library_path = path;
    }

    pub(crate) fn read_stdin_line(&mut self) -> String {
        self.host.read_line()
    }

    pub(crate) fn bootstrap(&self) -> Option<&AST> {
        self.bootstrap.as_ref()
    }

    pub(crate) fn relay(&self) -> &ConsoleRelay {
        &self.relay
    }
}

fn script_directory(script: &Path) -> PathBuf {
    let dir = script.parent().unwrap_or(Path::new(""));
    absolute_path(dir)
}

/// The controller: configures pages from the command line, injects the
/// bridges, evaluates the bootstrap and runs the user script.
pub struct Phantom {
    engine: Engine,
    session: Rc<RefCell<Session>>,
}

impl Phantom {
    /// Controller writing console output to stdout.
    pub fn new(outcome: ParseOutcome, host: Box<dyn HostEnvironment>) -> Result<Self, PhantomError> {
        Self::with_relay(outcome, host, ConsoleRelay::stdout())
    }

    pub fn with_relay(
        outcome: ParseOutcome,
        host: Box<dyn HostEnvironment>,
        relay: ConsoleRelay,
    ) -> Result<Self, PhantomError> {
        Self::with_bootstrap(outcome, host, relay, BOOTSTRAP_SCRIPT)
    }

    /// Controller with an explicit bootstrap source.
    pub fn with_bootstrap(
        outcome: ParseOutcome,
        host: Box<dyn HostEnvironment>,
        relay: ConsoleRelay,
        bootstrap: &str,
    ) -> Result<Self, PhantomError> {
        let engine = scripting::build_engine(&relay);
        let session = Rc::new(RefCell::new(Session::new(host, relay.clone())));
        let phantom = Self { engine, session };

        let config = match outcome {
            ParseOutcome::Run(config) => config,
            ParseOutcome::Version => {
                relay.write_line(VERSION_STRING);
                phantom.session.borrow_mut().lifecycle.terminate();
                return Ok(phantom);
            }
            ParseOutcome::Rejected(message) => {
                log::debug!("Command line rejected");
                eprint!("{}", message);
                phantom.session.borrow_mut().lifecycle.terminate();
                return Ok(phantom);
            }
            ParseOutcome::Usage(text) => {
                relay.write_line(text.trim_end());
                let mut session = phantom.session.borrow_mut();
                session.primary = session.create_page();
                drop(session);
                return Ok(phantom);
            }
        };

        phantom.session.borrow_mut().configure(&config);
        phantom.bootstrap(bootstrap)?;
        Ok(phantom)
    }

    /// Inject the bridges into the primary page and evaluate the bootstrap
    /// there. Its functions are kept for every later script.
    fn bootstrap(&self, source: &str) -> Result<(), PhantomError> {
        if source.trim().is_empty() {
            return Err(PhantomError::BootstrapMissing);
        }
        let scope = self.primary_scope().ok_or(PhantomError::BootstrapMissing)?;
        let relay = self.session.borrow().relay.clone();
        let mut scope = scope.borrow_mut();
        scripting::install_bridges(&mut scope, Rc::downgrade(&self.session), relay);

        let mut ast = self
            .engine
            .compile(source)
            .map_err(|err| PhantomError::Bootstrap(err.into()))?;
        ast.set_source("bootstrap");
        self.engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|err| PhantomError::Bootstrap(err.into()))?;

        self.session.borrow_mut().bootstrap = Some(ast.clone_functions_only());
        log::debug!("Bootstrap evaluated ({} bytes)", source.len());
        Ok(())
    }

    fn primary_scope(&self) -> Option<Rc<RefCell<rhai::Scope<'static>>>> {
        self.session.borrow().primary_page().map(WebPage::scope)
    }

    /// Run the user script in the primary page. Returns `false` when nothing
    /// ran, the script failed, or the script requested an exit.
    pub fn execute(&mut self) -> bool {
        let (path, bootstrap) = {
            let session = self.session.borrow();
            if session.is_terminated() {
                return false;
            }
            let Some(path) = session.script_path.clone() else {
                return false;
            };
            (path, session.bootstrap.clone())
        };
        let Some(scope) = self.primary_scope() else {
            return false;
        };

        let result = {
            let mut scope = scope.borrow_mut();
            scripting::run_file(&self.engine, &mut scope, bootstrap.as_ref(), &path)
        };

        let mut session = self.session.borrow_mut();
        match result {
            Ok(()) => !session.is_terminated(),
            Err(_) if session.lifecycle.has_exited() => false,
            Err(err) => {
                log::error!("{}: {}", path.display(), err);
                eprintln!("{}", err);
                session.lifecycle.fail(SCRIPT_FAILURE_EXIT_CODE);
                false
            }
        }
    }

    /// Exit code of the run.
    pub fn return_value(&self) -> i32 {
        self.session.borrow().lifecycle.exit_code()
    }

    /// Exit on behalf of the embedding process.
    pub fn exit(&mut self, code: i32) {
        self.session.borrow_mut().exit(code);
    }

    pub fn is_terminated(&self) -> bool {
        self.session.borrow().is_terminated()
    }

    pub fn create_page(&mut self) -> Option<PageId> {
        self.session.borrow_mut().create_page()
    }

    pub fn destroy_page(&mut self, id: PageId) -> bool {
        self.session.borrow_mut().destroy_page(id)
    }

    pub fn page_count(&self) -> usize {
        self.session.borrow().pages.len()
    }

    pub fn primary_page(&self) -> Option<PageId> {
        self.session.borrow().primary
    }

    pub fn page_settings(&self, id: PageId) -> Option<PageSettings> {
        self.session.borrow().page(id).map(|p| p.settings().clone())
    }

    pub fn page_library_path(&self, id: PageId) -> Option<PathBuf> {
        self.session
            .borrow()
            .page(id)
            .map(|p| p.library_path().to_path_buf())
    }

    pub fn network_policy(&self) -> NetworkPolicy {
        (*self.session.borrow().network).clone()
    }

    pub fn default_page_settings(&self) -> PageSettings {
        self.session.borrow().default_settings.clone()
    }

    pub fn args(&self) -> Vec<String> {
        self.session.borrow().script_args.clone()
    }

    pub fn script_name(&self) -> String {
        self.session.borrow().script_name()
    }

    pub fn library_path(&self) -> PathBuf {
        self.session.borrow().library_path.clone()
    }

    pub fn set_library_path(&mut self, path: impl Into<PathBuf>) {
        self.session.borrow_mut().set_library_path(path.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkProxy;
    use crate::console::SharedBuffer;

    #[derive(Default)]
    struct NullHost {
        exits: Rc<RefCell<Vec<i32>>>,
        proxies: Rc<RefCell<Vec<NetworkProxy>>>,
    }

    impl HostEnvironment for NullHost {
        fn set_application_proxy(&mut self, proxy: &NetworkProxy) {
            self.proxies.borrow_mut().push(proxy.clone());
        }

        fn read_line(&mut self) -> String {
            "typed".to_string()
        }

        fn exit(&mut self, code: i32) {
            self.exits.borrow_mut().push(code);
        }
    }

    fn controller(config: RunConfiguration) -> (Phantom, SharedBuffer, Rc<RefCell<Vec<i32>>>) {
        let host = NullHost::default();
        let exits = host.exits.clone();
        let buffer = SharedBuffer::new();
        let phantom = Phantom::with_relay(
            ParseOutcome::Run(config),
            Box::new(host),
            ConsoleRelay::with_writer(buffer.clone()),
        )
        .unwrap();
        (phantom, buffer, exits)
    }

    #[test]
    fn primary_page_uses_configuration() {
        let mut config = RunConfiguration::new("/tmp/scripts/run.rhai");
        config.load_images = false;
        config.disk_cache = true;
        let (phantom, _, _) = controller(config);

        let primary = phantom.primary_page().unwrap();
        assert!(!phantom.page_settings(primary).unwrap().load_images);
        assert!(phantom.network_policy().disk_cache);
        assert_eq!(phantom.library_path(), PathBuf::from("/tmp/scripts"));
        assert_eq!(phantom.script_name(), "run.rhai");
        assert_eq!(phantom.page_count(), 1);
    }

    #[test]
    fn proxy_is_selected_once_per_run() {
        let host = NullHost::default();
        let proxies = host.proxies.clone();
        Phantom::with_relay(
            ParseOutcome::Run(RunConfiguration::new("a.rhai")),
            Box::new(host),
            ConsoleRelay::with_writer(SharedBuffer::new()),
        )
        .unwrap();
        assert_eq!(*proxies.borrow(), vec![NetworkProxy::System]);
    }

    #[test]
    fn pages_inherit_current_defaults() {
        let (mut phantom, _, _) = controller(RunConfiguration::new("/srv/a.rhai"));
        phantom.set_library_path("/srv/lib");
        let id = phantom.create_page().unwrap();
        assert_eq!(phantom.page_library_path(id), Some(PathBuf::from("/srv/lib")));
        assert_eq!(phantom.page_settings(id), Some(phantom.default_page_settings()));
    }

    #[test]
    fn exit_destroys_every_page() {
        let (mut phantom, _, exits) = controller(RunConfiguration::new("a.rhai"));
        for _ in 0..3 {
            phantom.create_page();
        }
        assert_eq!(phantom.page_count(), 4);

        phantom.exit(5);
        phantom.exit(6);
        assert_eq!(phantom.page_count(), 0);
        assert_eq!(phantom.return_value(), 5);
        assert!(phantom.is_terminated());
        assert_eq!(*exits.borrow(), vec![5]);
        assert_eq!(phantom.create_page(), None);
        assert!(!phantom.execute());
    }

    #[test]
    fn destroy_removes_only_that_page() {
        let (mut phantom, _, _) = controller(RunConfiguration::new("a.rhai"));
        let a = phantom.create_page().unwrap();
        let b = phantom.create_page().unwrap();
        assert!(phantom.destroy_page(a));
        assert!(!phantom.destroy_page(a));
        assert!(phantom.page_settings(b).is_some());
        assert_eq!(phantom.page_count(), 2);
    }

    #[test]
    fn version_terminates_before_configuration() {
        let buffer = SharedBuffer::new();
        let mut phantom = Phantom::with_relay(
            ParseOutcome::Version,
            Box::new(NullHost::default()),
            ConsoleRelay::with_writer(buffer.clone()),
        )
        .unwrap();
        assert!(phantom.is_terminated());
        assert_eq!(phantom.page_count(), 0);
        assert!(!phantom.execute());
        assert_eq!(buffer.lines(), vec![VERSION_STRING]);
        assert_eq!(phantom.return_value(), 0);
    }

    #[test]
    fn blank_bootstrap_is_fatal() {
        let result = Phantom::with_bootstrap(
            ParseOutcome::Run(RunConfiguration::new("a.rhai")),
            Box::new(NullHost::default()),
            ConsoleRelay::with_writer(SharedBuffer::new()),
            "  \n",
        );
        assert!(matches!(result, Err(PhantomError::BootstrapMissing)));
    }

    #[test]
    fn broken_bootstrap_is_fatal() {
        let result = Phantom::with_bootstrap(
            ParseOutcome::Run(RunConfiguration::new("a.rhai")),
            Box::new(NullHost::default()),
            ConsoleRelay::with_writer(SharedBuffer::new()),
            "fn open(path {",
        );
        assert!(matches!(result, Err(PhantomError::Bootstrap(_))));
    }

    #[test]
    fn missing_script_sets_failure_code() {
        let (mut phantom, _, _) = controller(RunConfiguration::new("/nonexistent/dir/x.rhai"));
        assert!(!phantom.execute());
        assert_eq!(phantom.return_value(), SCRIPT_FAILURE_EXIT_CODE);
        assert!(!phantom.is_terminated());
    }
}
