//! Page instances and the settings applied to them.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rhai::{Dynamic, Map, Scope};

use crate::config::RunConfiguration;

pub const SETTING_LOAD_IMAGES: &str = "loadImages";
pub const SETTING_LOAD_PLUGINS: &str = "loadPlugins";
pub const SETTING_USER_AGENT: &str = "userAgent";
pub const SETTING_LOCAL_ACCESS_REMOTE: &str = "localAccessRemote";

/// Identifier of a live page, unique within a session.
pub type PageId = u64;

/// Per-page settings. Each page holds its own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSettings {
    pub load_images: bool,
    pub load_plugins: bool,
    pub user_agent: String,
    pub local_access_remote: bool,
}

impl PageSettings {
    pub fn from_config(config: &RunConfiguration, user_agent: impl Into<String>) -> Self {
        Self {
            load_images: config.load_images,
            load_plugins: config.load_plugins,
            user_agent: user_agent.into(),
            local_access_remote: config.local_access_remote,
        }
    }

    pub fn to_map(&self) -> Map {
        let mut map = Map::new();
        map.insert(SETTING_LOAD_IMAGES.into(), Dynamic::from(self.load_images));
        map.insert(SETTING_LOAD_PLUGINS.into(), Dynamic::from(self.load_plugins));
        map.insert(SETTING_USER_AGENT.into(), Dynamic::from(self.user_agent.clone()));
        map.insert(
            SETTING_LOCAL_ACCESS_REMOTE.into(),
            Dynamic::from(self.local_access_remote),
        );
        map
    }

    /// Overwrite the settings named in `map`. Unknown keys and values of the
    /// wrong type are ignored.
    pub fn merge_map(&mut self, map: &Map) {
        let flag = |key: &str| map.get(key).and_then(|v| v.as_bool().ok());
        if let Some(value) = flag(SETTING_LOAD_IMAGES) {
            self.load_images = value;
        }
        if let Some(value) = flag(SETTING_LOAD_PLUGINS) {
            self.load_plugins = value;
        }
        if let Some(value) = flag(SETTING_LOCAL_ACCESS_REMOTE) {
            self.local_access_remote = value;
        }
        if let Some(value) = map.get(SETTING_USER_AGENT).and_then(|v| v.clone().into_string().ok()) {
            self.user_agent = value;
        }
    }
}

/// Network access policy shared by every page of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkPolicy {
    pub disk_cache: bool,
    pub cookies_file: Option<PathBuf>,
    pub ignore_ssl_errors: bool,
}

impl NetworkPolicy {
    pub fn from_config(config: &RunConfiguration) -> Self {
        Self {
            disk_cache: config.disk_cache,
            cookies_file: config.cookies_file.clone(),
            ignore_ssl_errors: config.ignore_ssl_errors,
        }
    }

    /// Read-only view for scripts. `cookiesFile` is unit when unset.
    pub fn to_map(&self) -> Map {
        let mut map = Map::new();
        map.insert("diskCache".into(), Dynamic::from(self.disk_cache));
        map.insert(
            "cookiesFile".into(),
            self.cookies_file
                .as_ref()
                .map(|path| Dynamic::from(path.display().to_string()))
                .unwrap_or(Dynamic::UNIT),
        );
        map.insert("ignoreSslErrors".into(), Dynamic::from(self.ignore_ssl_errors));
        map
    }
}

/// One isolated script context with its own variables.
pub struct WebPage {
    id: PageId,
    settings: PageSettings,
    network: Rc<NetworkPolicy>,
    library_path: PathBuf,
    scope: Rc<RefCell<Scope<'static>>>,
}

impl WebPage {
    pub fn new(id: PageId, network: Rc<NetworkPolicy>, settings: &PageSettings) -> Self {
        Self {
            id,
            settings: settings.clone(),
            network,
            library_path: PathBuf::new(),
            scope: Rc::new(RefCell::new(Scope::new())),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn settings(&self) -> &PageSettings {
        &self.settings
    }

    pub fn apply_settings(&mut self, settings: &PageSettings) {
        self.settings = settings.clone();
    }

    pub fn network_policy(&self) -> &NetworkPolicy {
        &self.network
    }

    pub fn library_path(&self) -> &Path {
        &self.library_path
    }

    pub fn set_library_path(&mut self, path: impl Into<PathBuf>) {
        self.library_path = path.into();
    }

    /// Variables of this page. Held outside the session borrow while a
    /// script runs, so bridges can reach the session re-entrantly.
    pub fn scope(&self) -> Rc<RefCell<Scope<'static>>> {
        self.scope.clone()
    }
}
