use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `server.root`
pub const ROOT_ENV_VAR: &str = "DEVGATE_ROOT";

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP router configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// DNS responder configuration
    #[serde(default)]
    pub dns: DnsConfig,

    /// Default settings applied to every app
    #[serde(default)]
    pub defaults: AppDefaults,

    /// How backends without an explicit command are launched
    #[serde(default)]
    pub launcher: LauncherConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Synthetic top-level domain stripped from the Host header (default: "dev")
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Directory holding one sub-directory per app (default: ~/.devgate)
    pub root: Option<PathBuf>,

    /// Interval between idle sweeps in milliseconds (default: 1000)
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,

    /// Max time to wait for a backend response in seconds (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per TCP backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout for TCP backends in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            domain: default_domain(),
            root: None,
            reap_interval_ms: default_reap_interval(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolve the apps root: `DEVGATE_ROOT`, then `server.root`, then `~/.devgate`
    pub fn resolve_root(&self) -> PathBuf {
        if let Some(root) = std::env::var_os(ROOT_ENV_VAR).filter(|v| !v.is_empty()) {
            return PathBuf::from(root);
        }
        if let Some(ref root) = self.root {
            return root.clone();
        }
        dirs_next::home_dir()
            .map(|home| home.join(".devgate"))
            .unwrap_or_else(|| PathBuf::from(".devgate"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    /// Run the DNS responder (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// UDP port (default: 20560)
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind_address(),
            port: default_dns_port(),
        }
    }
}

/// Signal used to ask a backend to shut down
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StopSignal {
    /// SIGTERM (default)
    #[default]
    #[serde(alias = "sigterm")]
    Term,
    /// SIGINT, used by older backends
    #[serde(alias = "sigint")]
    Int,
}

impl StopSignal {
    #[cfg(unix)]
    pub fn as_raw(self) -> i32 {
        match self {
            StopSignal::Term => libc::SIGTERM,
            StopSignal::Int => libc::SIGINT,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppDefaults {
    /// Idle time in seconds before an app is stopped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Max time in seconds to wait for the readiness handshake
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period in seconds between the stop signal and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Signal sent to stop a backend
    #[serde(default)]
    pub stop_signal: StopSignal,

    /// Number of connect probes before giving up on a backend
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    /// First delay between connect probes in milliseconds
    #[serde(default = "default_probe_initial_backoff")]
    pub probe_initial_backoff_ms: u64,

    /// Upper bound for the delay between connect probes in milliseconds
    #[serde(default = "default_probe_max_backoff")]
    pub probe_max_backoff_ms: u64,
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            stop_signal: StopSignal::default(),
            probe_attempts: default_probe_attempts(),
            probe_initial_backoff_ms: default_probe_initial_backoff(),
            probe_max_backoff_ms: default_probe_max_backoff(),
        }
    }
}

impl AppDefaults {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn probe_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.probe_initial_backoff_ms)
    }

    pub fn probe_max_backoff(&self) -> Duration {
        Duration::from_millis(self.probe_max_backoff_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LauncherConfig {
    /// Interpreter used to run the bootstrap script (default: ruby)
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Bootstrap script that binds the app's HTTP server and signals readiness
    pub bootstrap: Option<PathBuf>,

    /// Shell used for explicit commands and login-shell wrapping (default: bash)
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Files whose presence in an app directory forces login-shell wrapping
    #[serde(default = "default_marker_files")]
    pub marker_files: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            bootstrap: None,
            shell: default_shell(),
            marker_files: default_marker_files(),
        }
    }
}

/// Optional per-app settings, read from `<root>/<app>.toml`
///
/// # Security Warning
///
/// `command` is executed through the configured shell with the permissions of
/// the router. Keep the apps root writable only by the user running it.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AppConfig {
    /// Shell command that starts the backend, overriding every other heuristic
    pub command: Option<String>,

    /// Interpreter to run the bootstrap script with
    #[serde(alias = "ruby")]
    pub interpreter: Option<String>,

    /// Wrap the launch in a login shell
    #[serde(default)]
    pub full_shell: bool,

    /// Serve over this TCP port instead of a unix socket
    pub port: Option<u16>,

    /// Idle timeout in seconds (overrides default)
    pub idle_timeout_secs: Option<u64>,

    /// Extra environment variables for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AppConfig {
    /// Load the settings file for the app directory `app_dir`.
    ///
    /// The file sits next to the directory and shares its name, so
    /// `~/.devgate/blog/` is configured by `~/.devgate/blog.toml`.
    /// A missing file yields the default (empty) settings.
    pub fn load_for(app_dir: &Path) -> anyhow::Result<Self> {
        let path = Self::path_for(app_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: AppConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn path_for(app_dir: &Path) -> PathBuf {
        let mut name = app_dir.as_os_str().to_os_string();
        name.push(".toml");
        PathBuf::from(name)
    }

    pub fn idle_timeout(&self, defaults: &AppDefaults) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(defaults.idle_timeout_secs))
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_domain() -> String {
    "dev".to_string()
}

fn default_reap_interval() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

fn default_dns_port() -> u16 {
    20560
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_probe_attempts() -> u32 {
    20
}

fn default_probe_initial_backoff() -> u64 {
    25
}

fn default_probe_max_backoff() -> u64 {
    500
}

fn default_interpreter() -> String {
    "ruby".to_string()
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_marker_files() -> Vec<String> {
    vec![".rvmrc".to_string(), ".rbenv-version".to_string()]
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: Config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let domain = self.server.domain.trim_matches('.');
        if domain.is_empty() {
            anyhow::bail!("server.domain must not be empty");
        }
        if self.server.reap_interval_ms == 0 {
            anyhow::bail!("server.reap_interval_ms must be greater than zero");
        }
        if self.defaults.probe_attempts == 0 {
            anyhow::bail!("defaults.probe_attempts must be at least 1");
        }
        if self.defaults.probe_initial_backoff_ms > self.defaults.probe_max_backoff_ms {
            anyhow::bail!("defaults.probe_initial_backoff_ms must not exceed probe_max_backoff_ms");
        }
        if self.launcher.shell.trim().is_empty() {
            anyhow::bail!("launcher.shell must not be empty");
        }
        Ok(())
    }
}
