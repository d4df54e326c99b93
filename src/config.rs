use anyhow::Context;
use hyper::Method;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Config file read from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "frontdoor.toml";

/// Global configuration for the front door
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front door listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// The supervised backend process
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the local status listener, disabled when unset
    pub admin_port: Option<u16>,

    /// Seconds to wait for open connections to finish on shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Maximum idle upstream connections kept in the pool (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Largest request body buffered for forwarding, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Text served on `GET /`
    #[serde(default = "default_liveness_message")]
    pub liveness_message: String,

    /// Methods that are forwarded; anything else gets 405
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Parsed allow-list. Names that fail to parse are skipped here and
    /// reported by [`Config::validate`].
    pub fn methods(&self) -> Vec<Method> {
        self.allowed_methods
            .iter()
            .filter_map(|m| Method::from_str(&m.to_ascii_uppercase()).ok())
            .collect()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: None,
            drain_timeout_secs: default_drain_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            max_body_bytes: default_max_body_bytes(),
            liveness_message: default_liveness_message(),
            allowed_methods: default_allowed_methods(),
        }
    }
}

/// What the supervisor does after the backend exits on its own
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Stay `Crashed`; requests keep getting 503
    #[default]
    Never,
    /// Respawn up to `max_restarts` times
    OnFailure,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RestartConfig {
    #[serde(default)]
    pub policy: RestartPolicy,

    /// Restarts allowed over the lifetime of the front door
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Delay before each respawn in milliseconds
    #[serde(default = "default_restart_backoff")]
    pub backoff_ms: u64,
}

impl RestartConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::default(),
            max_restarts: default_max_restarts(),
            backoff_ms: default_restart_backoff(),
        }
    }
}

/// Configuration for the supervised backend
///
/// # Security Warning
///
/// `command` is executed directly with the permissions of the front door.
/// Configuration files and the environment must come from trusted sources.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Command line, split with shell quoting rules (e.g. `"npm start"`)
    #[serde(default = "default_backend_command")]
    pub command: String,

    /// Extra arguments appended after the split command line
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Host the backend is reached on
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Port the backend listens on (exported to it as `PORT`)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// HTTP readiness path; a plain TCP connect is used when unset
    pub health_path: Option<String>,

    /// Startup grace period in seconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Readiness poll interval in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Forwarding timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    #[serde(default)]
    pub restart: RestartConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            host: default_backend_host(),
            port: default_backend_port(),
            health_path: None,
            startup_timeout_secs: default_startup_timeout(),
            health_check_interval_ms: default_health_interval(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            restart: RestartConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Create a backend config for `command` on `port` with defaults
    pub fn local(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    /// Full argv: the split command line followed by `args`
    pub fn argv(&self) -> Result<Vec<String>, shell_words::ParseError> {
        let mut argv = shell_words::split(&self.command)?;
        argv.extend(self.args.iter().cloned());
        Ok(argv)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// `host:port` of the backend listener
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the backend configuration
    fn validate(&self, errors: &mut Vec<String>) {
        match self.argv() {
            Ok(argv) if argv.is_empty() => {
                errors.push("backend: 'command' must not be empty".to_string())
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("backend: cannot parse 'command': {}", e)),
        }

        if self.port == 0 {
            errors.push("backend: 'port' must be greater than 0".to_string());
        }

        if self.startup_timeout_secs == 0 {
            errors.push("backend: 'startup_timeout_secs' must be greater than 0".to_string());
        }

        if self.request_timeout_secs == 0 {
            errors.push("backend: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if self.health_check_interval_ms == 0 {
            errors.push("backend: 'health_check_interval_ms' must be greater than 0".to_string());
        }

        if let Some(ref path) = self.health_path {
            if !path.starts_with('/') {
                errors.push(format!("backend: 'health_path' must start with '/': {}", path));
            }
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_liveness_message() -> String {
    "Todo Backend API is running...".to_string()
}

fn default_allowed_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_backend_command() -> String {
    "npm start".to_string()
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    5000
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    200
}

fn default_request_timeout() -> u64 {
    10
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_backoff() -> u64 {
    1000
}

impl Config {
    /// Parse and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config = Self::parse_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("cannot parse config file {}", path.display()))
    }

    /// Resolve configuration the way the binary does: an explicit path must
    /// exist, the default file is optional, then the process environment is
    /// layered on top.
    pub fn resolve(explicit_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::parse_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::parse_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables using `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = parse_env(&lookup, "PORT")? {
            self.server.port = port;
        }
        if let Some(bind) = lookup("BIND_ADDRESS") {
            self.server.bind = bind;
        }
        if let Some(port) = parse_env(&lookup, "ADMIN_PORT")? {
            self.server.admin_port = Some(port);
        }
        if let Some(command) = lookup("BACKEND_COMMAND") {
            self.backend.command = command;
        }
        if let Some(dir) = lookup("BACKEND_WORKDIR") {
            self.backend.working_dir = Some(dir);
        }
        if let Some(port) = parse_env(&lookup, "BACKEND_PORT")? {
            self.backend.port = port;
        }
        if let Some(secs) = parse_env(&lookup, "STARTUP_TIMEOUT_SECS")? {
            self.backend.startup_timeout_secs = secs;
        }
        if let Some(secs) = parse_env(&lookup, "REQUEST_TIMEOUT_SECS")? {
            self.backend.request_timeout_secs = secs;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        self.backend.validate(&mut errors);

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        } else if self.server.port == self.backend.port {
            errors.push(format!(
                "server: 'port' and backend 'port' are both {}",
                self.server.port
            ));
        }

        for name in &self.server.allowed_methods {
            if Method::from_str(&name.to_ascii_uppercase()).is_err() {
                errors.push(format!("server: invalid method in 'allowed_methods': {}", name));
            }
        }

        if self.server.admin_port == Some(self.server.port) {
            errors.push(format!(
                "server: 'admin_port' and 'port' are both {}",
                self.server.port
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> anyhow::Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, raw, e)),
    }
}
