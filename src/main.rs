use devpool::admin::{list_apps, AdminServer, PKG_NAME, VERSION};
use devpool::config::Config;
use devpool::docker::DockerStatus;
use devpool::pool::AppPool;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "devpool.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devpool=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; a missing default file means built-in defaults
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if explicit_path.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    std::fs::create_dir_all(&config.pool.dir).map_err(|e| {
        anyhow::anyhow!("Failed to create pool directory '{}': {}", config.pool.dir.display(), e)
    })?;

    // Write PID file if configured (with exclusive lock)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let provider = Arc::new(DockerStatus::new(config.pool.docker_host.clone()));
    let pool = AppPool::new(config.pool.clone(), provider)?;
    pool.set_on_close(|app| info!(app = %app.name(), "App closed"));

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&pool), shutdown_rx, admin_token);
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sigusr1.recv() => {
                info!("Received SIGUSR1, stopping all apps");
                pool.purge_all().await;
            }
            _ = sighup.recv() => {
                log_app_listing(&pool);
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all apps...");
    pool.purge_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn log_app_listing(pool: &AppPool) {
    let apps = list_apps(pool);
    info!(count = apps.len(), "Current apps");
    for entry in apps {
        info!(
            key = %entry.key,
            app = %entry.name,
            url = %entry.url,
            state = ?entry.state,
            pid = ?entry.pid,
            idle_secs = entry.idle_secs,
            "App"
        );
    }
}

/// PID file handle that maintains an exclusive lock
struct PidFile {
    _file: std::fs::File,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting app pool");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        "Server configuration"
    );
    info!(
        dir = %config.pool.dir.display(),
        idle_timeout_secs = config.pool.idle_timeout_secs,
        boot_timeout_secs = ?config.pool.boot_timeout_secs,
        port_range = %format!("{}..{}", config.pool.port_range_start, config.pool.port_range_end),
        compose_command = %config.pool.compose_command,
        "Pool settings"
    );
    info!(
        shell = %config.pool.shell(),
        login_shell = config.pool.login_shell,
        shutdown_grace_period_secs = config.pool.shutdown_grace_period_secs,
        "Process settings"
    );
}
