//! Process-backed applications
//!
//! A directory in the pool is a docker-compose project. Booting it runs
//! `docker-compose up` through the user's login shell on a pseudo-random
//! port, then supervises it with four tasks sharing one [`TaskGroup`]:
//!
//! - output watcher: mirrors the merged stdout/stderr and owns teardown
//! - idle monitor: asks the pool whether the app has been unused too long
//! - restart monitor: kills the app when `tmp/restart.txt` changes
//! - readiness poller: waits for `<name>_web_1` to report healthy
//!
//! [`TaskGroup`]: crate::group::TaskGroup

use crate::app::{App, AppParts, Target};
use crate::config::PoolConfig;
use crate::docker::{find_container, web_container_name, ContainerStatus, HealthStatus};
use crate::error::AppError;
use crate::pool::AppPool;
use crate::watch::watch_file;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// File that marks a directory as a docker-compose project
pub const DESCRIPTOR_FILE: &str = "docker-compose.yml";

/// Environment files sourced before boot, later ones override earlier ones
pub const ENV_FILES: [&str; 5] = ["~/.powconfig", ".env", ".envrc", ".powrc", ".powenv"];

/// Random picks tried before settling on an unverified port
const PORT_ATTEMPTS: usize = 32;

/// Handle to the boot shell of a process-backed app
pub(crate) struct ProcessHandle {
    pub(crate) pid: u32,
    child: Mutex<Option<Child>>,
}

/// Send SIGTERM to `pid`
pub(crate) fn terminate(pid: u32) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Pick a port in the configured range.
///
/// Ports held by live apps are skipped and each candidate must be bindable
/// on the loopback interface; after [`PORT_ATTEMPTS`] misses the last
/// candidate is used anyway.
pub fn allocate_port(config: &PoolConfig, in_use: &HashSet<u16>) -> u16 {
    let mut rng = rand::thread_rng();
    let mut candidate = config.port_range_start;

    for _ in 0..PORT_ATTEMPTS {
        candidate = rng.gen_range(config.port_range_start..config.port_range_end);
        if in_use.contains(&candidate) {
            continue;
        }
        if std::net::TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
            return candidate;
        }
    }

    warn!(port = candidate, "No free port verified, using last candidate");
    candidate
}

/// Script run by `bash` inside the project directory
pub fn boot_script(dir: &Path, port: u16, command: &str) -> String {
    let mut script = format!("cd {}\n", shell_words::quote(&dir.to_string_lossy()));

    for file in ENV_FILES {
        script.push_str(&format!(
            "\nif test -e {file}; then\n\tsource {file}\nfi\n",
            file = file
        ));
    }

    script.push_str(&format!("\nexport PORT={}\n\nexec {}", port, command));
    script
}

/// Create a pipe whose write end becomes both stdout and stderr of the child
fn merged_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element array for pipe(2) to fill.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by us.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    // Other apps booting concurrently must not inherit our write end,
    // or this app's output would never reach EOF.
    set_cloexec(&read)?;
    set_cloexec(&write)?;
    Ok((read, write))
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is an open descriptor for the lifetime of `fd`.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pid of a freshly spawned child
fn child_pid(child: &Child) -> Result<u32, AppError> {
    child.id().ok_or_else(|| {
        AppError::io(
            "starting app",
            io::Error::new(io::ErrorKind::Other, "process exited before its pid was read"),
        )
    })
}

/// Boot the docker-compose project in `dir` as app `name`.
///
/// `register` runs once the app exists and before any supervision task is
/// started.
pub(crate) fn launch<R>(
    pool: &Arc<AppPool>,
    name: &str,
    dir: &Path,
    register: R,
) -> Result<Arc<App>, AppError>
where
    R: FnOnce(&Arc<App>),
{
    let config = pool.config();

    let descriptor = dir.join(DESCRIPTOR_FILE);
    if !descriptor.exists() {
        return Err(AppError::MissingDescriptor(dir.to_path_buf()));
    }

    let port = allocate_port(config, &pool.ports_in_use());
    let shell = config.shell();
    let script = boot_script(dir, port, &config.compose_command);

    let (read_end, write_end) = merged_pipe().map_err(|e| AppError::io("creating output pipe", e))?;
    let stderr_end = write_end
        .try_clone()
        .map_err(|e| AppError::io("creating output pipe", e))?;
    let output = pipe::Receiver::from_owned_fd(read_end)
        .map_err(|e| AppError::io("reading app output", e))?;

    let mut cmd = Command::new(&shell);
    if config.login_shell {
        cmd.arg("-l").arg("-i");
    }
    cmd.arg("-c")
        .arg(format!("exec bash -c {}", shell_words::quote(&script)))
        .current_dir(dir)
        .env("PORT", port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr_end))
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| AppError::io("starting app", e))?;
    // Drop our copies of the write end so EOF arrives when the child exits.
    drop(cmd);

    let pid = child_pid(&child)?;

    info!(app = name, port, pid, %shell, "Booting app");

    let app = App::new(
        pool,
        AppParts {
            name: name.to_string(),
            target: Target::loopback(port),
            dir: Some(dir.to_path_buf()),
            public: dir.join("public").is_dir(),
            process: Some(ProcessHandle {
                pid,
                child: Mutex::new(Some(child)),
            }),
        },
    );

    app.event_add("booting_app", &[("port", port.to_string())]);
    register(&app);

    let group = app.group();
    group.spawn("output", watch_output(Arc::clone(&app), output));
    group.spawn(
        "idle",
        monitor_idle(Arc::clone(&app), config.idle_check_interval()),
    );
    group.spawn(
        "restart",
        monitor_restart(
            Arc::clone(&app),
            dir.to_path_buf(),
            config.restart_poll_interval(),
        ),
    );
    group.spawn(
        "readiness",
        poll_readiness(
            Arc::clone(&app),
            pool.provider(),
            config.readiness_interval(),
            config.boot_timeout(),
        ),
    );

    Ok(app)
}

/// Mirror output into the log ring until EOF or cancellation, then tear down
async fn watch_output(app: Arc<App>, output: pipe::Receiver) -> Result<(), AppError> {
    let pid = app.pid().unwrap_or(0);
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();

    let result = loop {
        buf.clear();
        tokio::select! {
            _ = app.group().dying() => break Ok(()),
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => break Err(AppError::UnexpectedExit { last_line: app.last_line() }),
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    app.record_output(line);
                    info!(target: "app", app = %app.name(), pid, "{}", line);
                }
                Err(e) => {
                    debug!(app = %app.name(), error = %e, "Error reading app output");
                    break Err(AppError::UnexpectedExit { last_line: app.last_line() });
                }
            },
        }
    };

    let reason = if result.is_err() {
        "stdout/stderr closed"
    } else {
        "detected internal shutdown"
    };
    let _ = app.kill(reason);

    let grace = app
        .pool()
        .map(|pool| pool.config().shutdown_grace_period())
        .unwrap_or(Duration::from_secs(10));
    reap(&app, grace).await;

    if let Some(pool) = app.pool() {
        pool.remove(&app);
    }

    if app.target().is_socket() {
        if let Err(e) = tokio::fs::remove_file(app.address()).await {
            debug!(app = %app.name(), path = %app.address(), error = %e, "Socket file not removed");
        }
    }

    app.event_add("shutdown", &[]);
    info!(app = %app.name(), "App shutdown and cleaned up");

    result
}

/// Wait for the boot shell to exit, escalating to SIGKILL after `grace`
async fn reap(app: &App, grace: Duration) {
    let child = app.process().and_then(|p| p.child.lock().take());
    let Some(mut child) = child else {
        return;
    };

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(app = %app.name(), ?status, "App process exited");
        }
        Ok(Err(e)) => {
            warn!(app = %app.name(), error = %e, "Error waiting for app to exit");
        }
        Err(_) => {
            warn!(
                app = %app.name(),
                grace_period_secs = grace.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// Kill the app once the pool considers it idle
async fn monitor_idle(app: Arc<App>, interval: Duration) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = app.group().dying() => return Ok(()),
            _ = ticker.tick() => {
                let Some(pool) = app.pool() else {
                    return Ok(());
                };
                if pool.is_idle(&app) {
                    let _ = app.kill("idle");
                    return Ok(());
                }
            }
        }
    }
}

/// Kill the app when `tmp/restart.txt` under its project changes
async fn monitor_restart(app: Arc<App>, dir: PathBuf, interval: Duration) -> Result<(), AppError> {
    let tmp = dir.join("tmp");
    tokio::fs::create_dir_all(&tmp)
        .await
        .map_err(|e| AppError::io("creating tmp directory", e))?;

    let sentinel = tmp.join("restart.txt");
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&sentinel)
        .await
        .map_err(|e| AppError::io("creating restart.txt", e))?;

    let changed = watch_file(&sentinel, app.group().token(), interval)
        .await
        .map_err(|e| AppError::io("watching restart.txt", e))?;

    if changed {
        let _ = app.kill("restart file touched");
    }
    Ok(())
}

/// Poll the container provider until the web container is healthy
async fn poll_readiness(
    app: Arc<App>,
    provider: Arc<dyn ContainerStatus>,
    interval: Duration,
    boot_timeout: Option<Duration>,
) -> Result<(), AppError> {
    app.event_add("waiting_on_app", &[]);

    let expected = web_container_name(app.name());
    let started = Instant::now();
    let mut container_id: Option<String> = None;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = app.group().dying() => {
                app.event_add("dying_on_start", &[]);
                info!(app = %app.name(), "Detected app dying on start");
                return Err(AppError::DiedBeforeBooting);
            }
            _ = ticker.tick() => {}
        }

        if let Some(limit) = boot_timeout {
            if started.elapsed() > limit {
                app.event_add("boot_timeout", &[("after", format!("{:?}", limit))]);
                warn!(app = %app.name(), timeout_secs = limit.as_secs(), "App did not become healthy in time");
                return Err(AppError::BootTimeout(limit));
            }
        }

        let id = match &container_id {
            Some(id) => id.clone(),
            None => {
                let containers = provider
                    .list_containers()
                    .await
                    .map_err(|e| AppError::Container(e.to_string()))?;
                match find_container(&containers, &expected) {
                    Some(id) => {
                        debug!(app = %app.name(), container = %expected, id = %id, "Found web container");
                        container_id = Some(id.clone());
                        id
                    }
                    None => continue,
                }
            }
        };

        let health = provider
            .health(&id)
            .await
            .map_err(|e| AppError::Container(e.to_string()))?;

        match health {
            HealthStatus::Healthy => {
                if app.ready().close() {
                    app.event_add("app_ready", &[]);
                    info!(app = %app.name(), "App booted");
                }
                return Ok(());
            }
            HealthStatus::Unhealthy => {
                app.event_add("dying_on_start", &[("container", expected.clone())]);
                warn!(app = %app.name(), container = %expected, "Container is unhealthy");
                return Err(AppError::Unhealthy(expected));
            }
            HealthStatus::Starting | HealthStatus::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_script_sources_env_files_in_order() {
        let script = boot_script(Path::new("/apps/blog"), 3042, "docker-compose --no-ansi up");

        assert!(script.starts_with("cd /apps/blog\n"));
        let positions: Vec<usize> = ENV_FILES
            .iter()
            .map(|f| script.find(&format!("source {}", f)).expect("env file sourced"))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        let export = script.find("export PORT=3042").unwrap();
        assert!(export > *positions.last().unwrap());
        assert!(script.ends_with("exec docker-compose --no-ansi up"));
    }

    #[test]
    fn test_boot_script_quotes_directory() {
        let script = boot_script(Path::new("/apps/my blog"), 3001, "true");
        assert!(script.starts_with("cd '/apps/my blog'\n"));
    }

    #[test]
    fn test_allocate_port_within_range() {
        let config = PoolConfig::default();
        for _ in 0..20 {
            let port = allocate_port(&config, &HashSet::new());
            assert!((3001..3999).contains(&port));
        }
    }

    #[test]
    fn test_allocate_port_skips_ports_in_use() {
        let mut config = PoolConfig::default();
        config.port_range_start = 3101;
        config.port_range_end = 3103;

        let in_use: HashSet<u16> = [3101].into_iter().collect();
        let mut saw_free = false;
        for _ in 0..10 {
            if allocate_port(&config, &in_use) == 3102 {
                saw_free = true;
            }
        }
        assert!(saw_free);
    }

    #[tokio::test]
    async fn test_child_pid_after_exit_is_an_error() {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .spawn()
            .unwrap();
        assert!(child_pid(&child).is_ok());

        child.wait().await.unwrap();
        let err = child_pid(&child).unwrap_err();
        assert!(err.to_string().starts_with("starting app"));
    }

    #[test]
    fn test_merged_pipe_is_cloexec() {
        let (read, write) = merged_pipe().unwrap();
        for fd in [&read, &write] {
            let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
            assert!(flags & libc::FD_CLOEXEC != 0);
        }
    }
}
