//! Applications: one name's current backend
//!
//! An [`App`] is either process-backed (a `docker-compose` project booted by
//! [`crate::process`]) or proxy-backed (a fixed address read by
//! [`crate::proxy`]). Both share the same lifecycle:
//!
//! ```text
//! Booting ──ready──► Running
//!    │                  │
//!    └──────death───────┴──► Dead
//! ```
//!
//! Readiness is a one-shot latch; death is the cancellation of the app's
//! [`TaskGroup`]. Once dead an app never comes back; the pool builds a fresh
//! one on the next lookup.

use crate::error::AppError;
use crate::events::Events;
use crate::group::TaskGroup;
use crate::linebuffer::LineBuffer;
use crate::pool::AppPool;
use crate::process::{self, ProcessHandle};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle state of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// Waiting for the backend to report healthy
    Booting,
    /// Ready to serve traffic
    Running,
    /// Torn down (terminal)
    Dead,
}

/// Network target an application is reachable at
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    /// `None` means the scheme default, or that `host` is a socket path
    pub port: Option<u16>,
}

impl Target {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// `http://127.0.0.1:<port>`
    pub fn loopback(port: u16) -> Self {
        Self::new("http", "127.0.0.1", Some(port))
    }

    /// `host:port`, or the bare host when no port is set
    pub fn address(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.address())
    }

    /// Whether the address is a filesystem socket path
    pub fn is_socket(&self) -> bool {
        self.scheme == "httpu"
    }
}

/// One-shot readiness latch
pub(crate) struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Close the latch; returns `false` if it was already closed
    pub(crate) fn close(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// Parameters for building an [`App`]
pub(crate) struct AppParts {
    pub name: String,
    pub target: Target,
    pub dir: Option<PathBuf>,
    pub public: bool,
    pub process: Option<ProcessHandle>,
}

/// A managed backend reachable at a computed address
pub struct App {
    name: String,
    target: Target,
    public: bool,
    dir: Option<PathBuf>,
    process: Option<ProcessHandle>,

    events: Arc<Events>,
    lines: Mutex<LineBuffer>,
    last_line: Mutex<String>,
    last_use: Mutex<Instant>,

    ready: ReadySignal,
    group: TaskGroup,
    pool: Weak<AppPool>,
}

impl App {
    pub(crate) fn new(pool: &Arc<AppPool>, parts: AppParts) -> Arc<Self> {
        Arc::new(Self {
            name: parts.name,
            target: parts.target,
            public: parts.public,
            dir: parts.dir,
            process: parts.process,
            events: pool.events(),
            lines: Mutex::new(LineBuffer::new(pool.config().log_lines)),
            last_line: Mutex::new(String::new()),
            last_use: Mutex::new(Instant::now()),
            ready: ReadySignal::new(),
            group: TaskGroup::new(),
            pool: Arc::downgrade(pool),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn scheme(&self) -> &str {
        &self.target.scheme
    }

    pub fn host(&self) -> &str {
        &self.target.host
    }

    pub fn port(&self) -> Option<u16> {
        self.target.port
    }

    /// `host:port`, or the bare host for socket targets
    pub fn address(&self) -> String {
        self.target.address()
    }

    pub fn url(&self) -> String {
        self.target.url()
    }

    /// Whether the project has a `public/` directory
    pub fn public(&self) -> bool {
        self.public
    }

    /// Project directory of a process-backed app
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Pid of the boot shell, `None` for proxy-backed apps
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    pub fn is_proxy(&self) -> bool {
        self.process.is_none()
    }

    /// Non-blocking lifecycle classification
    pub fn status(&self) -> AppState {
        if self.group.is_dying() {
            AppState::Dead
        } else if self.ready.is_closed() {
            AppState::Running
        } else {
            AppState::Booting
        }
    }

    /// Only a running app may receive traffic
    pub fn can_serve(&self) -> bool {
        self.status() == AppState::Running
    }

    pub fn is_dead(&self) -> bool {
        self.group.is_dying()
    }

    /// Supervision tasks that have not finished yet
    pub fn live_tasks(&self) -> usize {
        self.group.live()
    }

    /// Time since the last successful [`wait_until_ready`](Self::wait_until_ready)
    pub fn idle_for(&self) -> Duration {
        self.last_use.lock().elapsed()
    }

    /// Rendered log ring
    pub fn log(&self) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.lines.lock().write_to(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Last line of output seen from the process
    pub fn last_line(&self) -> String {
        self.last_line.lock().clone()
    }

    /// Suspend until the app can serve traffic or has died.
    ///
    /// Death takes priority: when both have happened the termination error is
    /// returned. A successful wait marks the app as used.
    pub async fn wait_until_ready(&self) -> Result<(), AppError> {
        tokio::select! {
            biased;
            _ = self.group.dying() => return Err(self.termination_error()),
            _ = self.ready.wait() => {}
        }

        if self.group.is_dying() {
            return Err(self.termination_error());
        }

        *self.last_use.lock() = Instant::now();
        Ok(())
    }

    /// The recorded termination error, if the app is dead
    pub fn err(&self) -> Option<AppError> {
        if self.group.is_dying() {
            Some(self.termination_error())
        } else {
            None
        }
    }

    fn termination_error(&self) -> AppError {
        self.group.err().unwrap_or(AppError::Shutdown)
    }

    /// Ask the backend to stop.
    ///
    /// Process-backed apps get SIGTERM; their output watcher notices the exit
    /// and tears the app down. Proxy-backed apps have nothing to signal and
    /// are cancelled directly. Delivery failures are logged and returned but
    /// never escalated.
    pub fn kill(&self, reason: &str) -> std::io::Result<()> {
        let Some(process) = &self.process else {
            self.event_add("killing_app", &[("reason", reason.to_string())]);
            info!(app = %self.name, reason, "Killing proxy app");
            self.cancel(reason);
            return Ok(());
        };

        self.event_add(
            "killing_app",
            &[("pid", process.pid.to_string()), ("reason", reason.to_string())],
        );
        info!(app = %self.name, pid = process.pid, reason, "Killing app");

        let result = process::terminate(process.pid);
        if let Err(ref e) = result {
            self.event_add(
                "killing_error",
                &[("pid", process.pid.to_string()), ("error", e.to_string())],
            );
            warn!(app = %self.name, pid = process.pid, error = %e, "Error trying to kill app");
        }
        result
    }

    /// Cancel the supervision group, recording `reason` as the termination error
    pub fn cancel(&self, reason: &str) {
        self.group.kill(Some(AppError::Killed {
            reason: reason.to_string(),
        }));
    }

    /// Wait until every supervision task has exited
    pub async fn wait(&self) -> Option<AppError> {
        self.group.wait().await
    }

    /// Record an app-scoped event in the pool's sink and this app's log
    pub(crate) fn event_add(&self, name: &str, fields: &[(&str, String)]) {
        let mut all = Vec::with_capacity(fields.len() + 1);
        all.push(("app", self.name.clone()));
        all.extend(fields.iter().map(|(k, v)| (*k, v.clone())));

        let rendered = self.events.add(name, &all);
        self.lines.lock().append(format!("#event {}", rendered));
    }

    /// Record a line of process output
    pub(crate) fn record_output(&self, line: &str) {
        self.lines.lock().append(line);
        *self.last_line.lock() = line.trim_end().to_string();
    }

    pub(crate) fn group(&self) -> &TaskGroup {
        &self.group
    }

    pub(crate) fn ready(&self) -> &ReadySignal {
        &self.ready
    }

    pub(crate) fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    pub(crate) fn pool(&self) -> Option<Arc<AppPool>> {
        self.pool.upgrade()
    }

    #[cfg(test)]
    pub(crate) fn set_last_use(&self, at: Instant) {
        *self.last_use.lock() = at;
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("pid", &self.pid())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_address() {
        let target = Target::loopback(3042);
        assert_eq!(target.address(), "127.0.0.1:3042");
        assert_eq!(target.url(), "http://127.0.0.1:3042");
        assert!(!target.is_socket());
    }

    #[test]
    fn test_socket_target_address() {
        let target = Target::new("httpu", "/tmp/blog.sock", None);
        assert_eq!(target.address(), "/tmp/blog.sock");
        assert_eq!(target.url(), "httpu:///tmp/blog.sock");
        assert!(target.is_socket());
    }

    #[test]
    fn test_ready_signal_closes_once() {
        let ready = ReadySignal::new();
        assert!(!ready.is_closed());
        assert!(ready.close());
        assert!(ready.is_closed());
        assert!(!ready.close());
        assert!(ready.is_closed());
    }

    #[tokio::test]
    async fn test_ready_signal_wakes_waiters() {
        let ready = Arc::new(ReadySignal::new());
        let waiter = Arc::clone(&ready);
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        ready.close();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
