use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin/status server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Application pool settings
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port for the admin/status API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bind address for the admin/status API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Authentication token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_port: default_admin_port(),
            bind: default_bind_address(),
            admin_token: None,
            pid_file: None,
        }
    }
}

/// Settings for the application pool and its supervision tasks
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Directory holding one entry per application (default: ~/.docker-dev)
    #[serde(default = "default_pool_dir")]
    pub dir: PathBuf,

    /// Seconds without a successful readiness wait before an app is evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often each app asks the pool whether it is idle
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,

    /// Container health polling interval in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    /// Restart sentinel polling interval in milliseconds
    #[serde(default = "default_restart_poll_interval")]
    pub restart_poll_interval_ms: u64,

    /// Give up on a booting app after this many seconds (unset: wait forever)
    pub boot_timeout_secs: Option<u64>,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// First port handed out to apps
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// End of the port range (exclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Shell used to boot apps (default: $SHELL, then /bin/bash)
    pub shell: Option<String>,

    /// Run the shell as an interactive login shell so user profiles load
    #[serde(default = "default_true")]
    pub login_shell: bool,

    /// Command executed inside the project directory
    #[serde(default = "default_compose_command")]
    pub compose_command: String,

    /// Output lines retained per app
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,

    /// Diagnostic events retained by the pool
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Docker host URL (default: DOCKER_HOST, then common socket paths)
    pub docker_host: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dir: default_pool_dir(),
            idle_timeout_secs: default_idle_timeout(),
            idle_check_interval_secs: default_idle_check_interval(),
            readiness_interval_ms: default_readiness_interval(),
            restart_poll_interval_ms: default_restart_poll_interval(),
            boot_timeout_secs: None,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            shell: None,
            login_shell: true,
            compose_command: default_compose_command(),
            log_lines: default_log_lines(),
            event_capacity: default_event_capacity(),
            docker_host: None,
        }
    }
}

impl PoolConfig {
    /// Pool settings rooted at `dir`, everything else default
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn restart_poll_interval(&self) -> Duration {
        Duration::from_millis(self.restart_poll_interval_ms)
    }

    pub fn boot_timeout(&self) -> Option<Duration> {
        self.boot_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// The shell to boot apps with
    pub fn shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/bash".to_string())
    }

    /// Validate the pool configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.port_range_start == 0 || self.port_range_start >= self.port_range_end {
            errors.push(format!(
                "pool: port range {}..{} is empty or starts at 0",
                self.port_range_start, self.port_range_end
            ));
        }
        if self.idle_check_interval_secs == 0 {
            errors.push("pool: 'idle_check_interval_secs' must be greater than 0".to_string());
        }
        if self.readiness_interval_ms == 0 {
            errors.push("pool: 'readiness_interval_ms' must be greater than 0".to_string());
        }
        if self.restart_poll_interval_ms == 0 {
            errors.push("pool: 'restart_poll_interval_ms' must be greater than 0".to_string());
        }
        if self.compose_command.trim().is_empty() {
            errors.push("pool: 'compose_command' must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_admin_port() -> u16 {
    9898
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docker-dev")
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_idle_check_interval() -> u64 {
    10
}

fn default_readiness_interval() -> u64 {
    250
}

fn default_restart_poll_interval() -> u64 {
    1000
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_port_range_start() -> u16 {
    3001
}

fn default_port_range_end() -> u16 {
    3999
}

fn default_true() -> bool {
    true
}

fn default_compose_command() -> String {
    "docker-compose --no-ansi up".to_string()
}

fn default_log_lines() -> usize {
    crate::linebuffer::DEFAULT_CAPACITY
}

fn default_event_capacity() -> usize {
    crate::events::DEFAULT_EVENT_CAPACITY
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(pool_errors) = self.pool.validate() {
            errors.extend(pool_errors);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
