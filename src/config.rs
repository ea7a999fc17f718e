//! Proxy configuration: the validated snapshot of server settings and
//! stations, and the hot-reloadable store that publishes it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::ConfigError;

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2101
}

fn default_user_agent() -> String {
    "NTRIP Client/1.0".to_string()
}

fn default_true() -> bool {
    true
}

/// A single base station entry.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Station {
    #[serde(rename = "mountPoint")]
    pub mount_point: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Validated snapshot of everything the proxy needs to run: downstream
/// listen settings, the advertised mount-point, the station set, and the
/// admin-surface settings consumed only by the (out-of-core) admin
/// collaborator.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_interface")]
    pub interface: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(rename = "mountPoint")]
    pub mount_point: String,

    #[serde(rename = "userAgent", default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub stations: Vec<Station>,

    #[serde(rename = "adminPort", default)]
    pub admin_port: Option<u16>,

    #[serde(rename = "adminUsername", default)]
    pub admin_username: Option<String>,

    #[serde(rename = "adminPassword", default)]
    pub admin_password: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            port: default_port(),
            mount_point: "PROXY".to_string(),
            user_agent: default_user_agent(),
            stations: Vec::new(),
            admin_port: None,
            admin_username: None,
            admin_password: None,
        }
    }
}

impl ProxyConfig {
    /// Parse and validate a config document.
    pub fn from_json(path: &str, text: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: "<in-memory>".to_string(),
            source,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mount_point.is_empty() {
            return Err(ConfigError::Invalid("mountPoint must not be empty".into()));
        }
        if self.interface.is_empty() {
            return Err(ConfigError::Invalid("interface must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be 1-65535".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for station in &self.stations {
            if station.mount_point.is_empty() {
                return Err(ConfigError::Invalid(
                    "station mountPoint must not be empty".into(),
                ));
            }
            if !seen.insert(station.mount_point.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate station mountPoint: {}",
                    station.mount_point
                )));
            }
            if station.host.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "station {} missing host",
                    station.mount_point
                )));
            }
            if station.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "station {} has invalid port",
                    station.mount_point
                )));
            }
            if !(-90.0..=90.0).contains(&station.latitude) {
                return Err(ConfigError::Invalid(format!(
                    "station {} latitude out of range",
                    station.mount_point
                )));
            }
            if !(-180.0..=180.0).contains(&station.longitude) {
                return Err(ConfigError::Invalid(format!(
                    "station {} longitude out of range",
                    station.mount_point
                )));
            }
        }

        if let Some(admin_port) = self.admin_port {
            if admin_port == self.port {
                return Err(ConfigError::Invalid(
                    "adminPort must differ from the downstream port".into(),
                ));
            }
        }

        Ok(())
    }
}

type ReloadCallback = Box<dyn Fn(Arc<ProxyConfig>) + Send + Sync>;

/// In-memory snapshot store with atomic reload.
///
/// Readers call [`ConfigStore::get`] to obtain a consistent, immutable
/// `Arc<ProxyConfig>`; the reloader calls [`ConfigStore::reload`] which
/// either publishes a new snapshot via a single atomic pointer swap, or
/// leaves the previous snapshot untouched and surfaces the error.
pub struct ConfigStore {
    path: PathBuf,
    current: Arc<ArcSwap<ProxyConfig>>,
    watchers: Mutex<Vec<ReloadCallback>>,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    /// Load the store from `path`, creating a default config file if one
    /// does not exist yet.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let path_str = path.display().to_string();

        let config = match fs::read_to_string(&path).await {
            Ok(text) => ProxyConfig::from_json(&path_str, &text)?,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                info!("config file {} not found, writing defaults", path_str);
                let config = ProxyConfig::default();
                let text = config.to_json_pretty()?;
                fs::write(&path, text)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: path_str.clone(),
                        source,
                    })?;
                config
            },
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path_str,
                    source,
                })
            },
        };

        let mtime = file_mtime(&path).await;

        Ok(Self {
            path,
            current: Arc::new(ArcSwap::new(Arc::new(config))),
            watchers: Mutex::new(Vec::new()),
            last_mtime: Mutex::new(mtime),
        })
    }

    /// Current snapshot. Cheap: an atomic load plus an `Arc` clone.
    pub fn get(&self) -> Arc<ProxyConfig> {
        self.current.load_full()
    }

    /// Re-read and re-validate the config file. On success, publishes the
    /// new snapshot and fires every registered watcher. On failure, the
    /// previous snapshot is retained and the error is returned.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let path_str = self.path.display().to_string();
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path_str.clone(),
                source,
            })?;

        let config = ProxyConfig::from_json(&path_str, &text)?;
        self.replace(config).await;
        Ok(())
    }

    /// Validate and publish a config replacement directly (used by the
    /// admin collaborator's edit entry point). A failed replace leaves
    /// `get()` unchanged.
    pub async fn replace_from_json(&self, text: &str) -> Result<(), ConfigError> {
        let config = ProxyConfig::from_json(&self.path.display().to_string(), text)?;
        self.replace(config).await;
        Ok(())
    }

    async fn replace(&self, config: ProxyConfig) {
        let config = Arc::new(config);
        self.current.store(config.clone());

        let watchers = self.watchers.lock().await;
        for cb in watchers.iter() {
            cb(config.clone());
        }
    }

    /// Register a callback fired after every successful reload or replace.
    pub async fn watch<F>(&self, callback: F)
    where
        F: Fn(Arc<ProxyConfig>) + Send + Sync + 'static,
    {
        self.watchers.lock().await.push(Box::new(callback));
    }

    /// Poll the config file's mtime and reload when it has changed.
    /// Reload is idempotent, so a spurious wakeup is harmless: this is the
    /// implicit debouncing called for by the design.
    pub async fn poll_for_changes(&self) {
        let mtime = file_mtime(&self.path).await;
        let mut last = self.last_mtime.lock().await;
        if mtime == *last {
            return;
        }
        debug!("config file {} changed, reloading", self.path.display());
        *last = mtime;
        drop(last);

        if let Err(e) = self.reload().await {
            warn!("config reload failed, retaining previous snapshot: {}", e);
        }
    }

    /// Run the poll loop until `shutdown` resolves. Matches the
    /// poll-interval reload strategy used elsewhere in this codebase's
    /// dependency family rather than a filesystem-notification crate.
    pub async fn run_poll_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_for_changes().await;
                },
                _ = shutdown.recv() => {
                    debug!("config poll loop exiting on shutdown signal");
                    break;
                }
            }
        }
    }
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    match fs::metadata(path).await {
        Ok(meta) => meta.modified().ok(),
        Err(e) => {
            error!("could not stat config file {}: {}", path.display(), e);
            None
        },
    }
}
