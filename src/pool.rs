//! Application pool: name → application registry
//!
//! The pool directory holds one entry per application. A directory is a
//! docker-compose project booted on demand, a regular file is a proxy
//! descriptor, and a symlink to either registers its link name as an alias
//! of the target's application.
//!
//! The registry mutex only guards map operations. Booting happens outside it,
//! serialised per canonical name by an async gate so that two concurrent
//! first lookups never produce two live applications for one name.

use crate::app::App;
use crate::config::PoolConfig;
use crate::docker::ContainerStatus;
use crate::error::AppError;
use crate::events::Events;
use crate::{process, proxy};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

type CloseCallback = Arc<dyn Fn(&App) + Send + Sync>;

/// Registry of live applications keyed by name and alias
pub struct AppPool {
    config: PoolConfig,
    provider: Arc<dyn ContainerStatus>,
    events: Arc<Events>,
    registry: Mutex<HashMap<String, Arc<App>>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    on_close: Mutex<Option<CloseCallback>>,
}

/// What a pool directory entry turned out to be
struct Located {
    path: PathBuf,
    is_dir: bool,
    canonical: String,
}

impl AppPool {
    /// Build a pool from validated settings
    pub fn new(config: PoolConfig, provider: Arc<dyn ContainerStatus>) -> anyhow::Result<Arc<Self>> {
        if let Err(errors) = config.validate() {
            anyhow::bail!("Invalid pool configuration:\n  - {}", errors.join("\n  - "));
        }

        let events = Arc::new(Events::new(config.event_capacity));
        Ok(Arc::new(Self {
            config,
            provider,
            events,
            registry: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            on_close: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Shared diagnostic event sink
    pub fn events(&self) -> Arc<Events> {
        Arc::clone(&self.events)
    }

    pub(crate) fn provider(&self) -> Arc<dyn ContainerStatus> {
        Arc::clone(&self.provider)
    }

    /// Install the callback invoked whenever an application leaves the pool
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: Fn(&App) + Send + Sync + 'static,
    {
        *self.on_close.lock() = Some(Arc::new(callback));
    }

    /// Number of registry keys, aliases included
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().is_empty()
    }

    /// Distinct applications currently registered
    pub fn apps(&self) -> Vec<Arc<App>> {
        let registry = self.registry.lock();
        distinct(registry.values())
    }

    /// Ports held by registered process-backed applications
    pub(crate) fn ports_in_use(&self) -> HashSet<u16> {
        self.registry
            .lock()
            .values()
            .filter(|app| !app.is_proxy())
            .filter_map(|app| app.port())
            .collect()
    }

    /// The registered live application for `name`, without booting anything
    pub fn get(&self, name: &str) -> Option<Arc<App>> {
        self.cached(name)
    }

    /// Return the live application for `name`, booting it if necessary
    pub async fn resolve(self: &Arc<Self>, name: &str) -> Result<Arc<App>, AppError> {
        if let Some(app) = self.cached(name) {
            return Ok(app);
        }

        if !is_valid_name(name) {
            return Err(AppError::UnknownApp(name.to_string()));
        }

        let located = self.locate(name).await?;
        let canonical = located.canonical.clone();

        let gate = self.gate(&canonical);
        let result = {
            let _guard = gate.lock().await;
            self.resolve_gated(name, located).await
        };
        self.release_gate(&canonical, &gate);

        result
    }

    /// Re-check, build and register while holding the canonical name's gate
    async fn resolve_gated(
        self: &Arc<Self>,
        name: &str,
        located: Located,
    ) -> Result<Arc<App>, AppError> {
        let canonical = located.canonical;

        // Someone else may have booted it while we waited on the gate.
        if let Some(app) = self.cached(&canonical) {
            if canonical != name {
                debug!(app = %canonical, alias = name, "Registering alias");
                self.registry.lock().insert(name.to_string(), Arc::clone(&app));
            }
            return Ok(app);
        }

        // Registration happens before any supervision task starts, so a task
        // that tears the app down always finds its keys.
        let register = |app: &Arc<App>| self.register(&canonical, name, app);
        let built = if located.is_dir {
            process::launch(self, &canonical, &located.path, register)
        } else {
            proxy::read_static(self, &canonical, &located.path, register)
        };

        match built {
            Ok(app) => Ok(app),
            Err(err) => {
                self.events.add(
                    "error_starting_app",
                    &[("app", canonical.clone()), ("error", err.to_string())],
                );
                warn!(app = %canonical, error = %err, "Error starting app");
                Err(err)
            }
        }
    }

    /// Store `app` under its canonical name and, if different, the lookup name
    fn register(&self, canonical: &str, name: &str, app: &Arc<App>) {
        let mut registry = self.registry.lock();
        registry.insert(canonical.to_string(), Arc::clone(app));
        if canonical != name {
            registry.insert(name.to_string(), Arc::clone(app));
        }
    }

    /// Cached live application for `name`; dead entries are dropped
    fn cached(&self, name: &str) -> Option<Arc<App>> {
        let mut registry = self.registry.lock();
        let app = registry.get(name).cloned()?;
        if !app.is_dead() {
            return Some(app);
        }
        registry.retain(|_, candidate| !Arc::ptr_eq(candidate, &app));
        None
    }

    /// Find the pool directory entry for `name`, trying dash expansion second
    async fn locate(&self, name: &str) -> Result<Located, AppError> {
        let mut candidates = vec![name.to_string()];
        let expanded = name.replacen('-', "/", 1);
        if expanded != name {
            candidates.push(expanded);
        }

        for candidate in candidates {
            let path = self.config.dir.join(&candidate);
            self.events
                .add("app_lookup", &[("path", path.display().to_string())]);

            match tokio::fs::metadata(&path).await {
                Ok(meta) => {
                    let canonical = canonical_name(&path)
                        .await
                        .unwrap_or_else(|| name.to_string());
                    return Ok(Located {
                        path,
                        is_dir: meta.is_dir(),
                        canonical,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.report_bad_symlink(&path).await;
                }
                Err(e) => return Err(AppError::io("reading pool directory", e)),
            }
        }

        Err(AppError::UnknownApp(name.to_string()))
    }

    async fn report_bad_symlink(&self, path: &Path) {
        if tokio::fs::symlink_metadata(path).await.is_err() {
            return;
        }
        let dest = tokio::fs::read_link(path)
            .await
            .map(|d| d.display().to_string())
            .unwrap_or_default();

        warn!(path = %path.display(), dest = %dest, "Bad symlink detected, destination doesn't exist");
        self.events.add(
            "bad_symlink",
            &[("path", path.display().to_string()), ("dest", dest)],
        );
    }

    fn gate(&self, canonical: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock();
        Arc::clone(gates.entry(canonical.to_string()).or_default())
    }

    /// Forget the gate for `canonical` once nobody else holds a handle to it
    fn release_gate(&self, canonical: &str, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.gates.lock();
        // One handle in the map, one held by the caller.
        if Arc::strong_count(gate) <= 2 {
            gates.remove(canonical);
        }
    }

    /// Whether `app` has been unused longer than the idle timeout.
    ///
    /// An idle app is unregistered under every key before this returns
    /// `true`; the caller is expected to kill it.
    pub fn is_idle(&self, app: &Arc<App>) -> bool {
        let mut registry = self.registry.lock();

        let idle_for = app.idle_for();
        if idle_for <= self.config.idle_timeout() {
            return false;
        }

        registry.retain(|_, candidate| !Arc::ptr_eq(candidate, app));
        drop(registry);

        app.event_add("idle_app", &[("last_used", format!("{:?}", idle_for))]);
        true
    }

    /// Unregister every key pointing at `app` and run the close callback
    pub fn remove(&self, app: &Arc<App>) {
        let removed = {
            let mut registry = self.registry.lock();
            let before = registry.len();
            registry.retain(|_, candidate| !Arc::ptr_eq(candidate, app));
            before - registry.len()
        };

        debug!(app = %app.name(), keys = removed, "Removed app from pool");

        let callback = self.on_close.lock().clone();
        if let Some(callback) = callback {
            callback(app);
        }
    }

    /// Visit every `(key, app)` pair registered at the time of the call
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &Arc<App>),
    {
        let snapshot: Vec<(String, Arc<App>)> = self
            .registry
            .lock()
            .iter()
            .map(|(name, app)| (name.clone(), Arc::clone(app)))
            .collect();

        for (name, app) in &snapshot {
            visit(name, app);
        }
    }

    /// Cancel every application and wait for all of them to finish
    pub async fn purge_all(&self) {
        let apps = self.apps();
        info!(count = apps.len(), "Purging apps");

        for app in &apps {
            app.event_add("purging_app", &[]);
            app.cancel("purging");
        }

        futures::future::join_all(apps.iter().map(|app| app.wait())).await;

        self.events.add("apps_purged", &[]);
    }
}

fn distinct<'a>(apps: impl Iterator<Item = &'a Arc<App>>) -> Vec<Arc<App>> {
    let mut out: Vec<Arc<App>> = Vec::new();
    for app in apps {
        if !out.iter().any(|seen| Arc::ptr_eq(seen, app)) {
            out.push(Arc::clone(app));
        }
    }
    out
}

/// Names are single path components; dashes may later expand to one `/`
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

/// Base name of the symlink target at `path`, if `path` is a symlink
async fn canonical_name(path: &Path) -> Option<String> {
    let meta = tokio::fs::symlink_metadata(path).await.ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    let dest = tokio::fs::read_link(path).await.ok()?;
    dest.file_name().map(|n| n.to_string_lossy().into_owned())
}

impl std::fmt::Debug for AppPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppPool")
            .field("dir", &self.config.dir)
            .field("keys", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{ContainerSummary, HealthStatus};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct NoContainers;

    impl ContainerStatus for NoContainers {
        fn list_containers(&self) -> BoxFuture<'_, anyhow::Result<Vec<ContainerSummary>>> {
            async { Ok(Vec::new()) }.boxed()
        }

        fn health<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, anyhow::Result<HealthStatus>> {
            async { Ok(HealthStatus::None) }.boxed()
        }
    }

    fn pool_in(dir: &TempDir) -> Arc<AppPool> {
        AppPool::new(PoolConfig::with_dir(dir.path()), Arc::new(NoContainers)).unwrap()
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("blog"));
        assert!(is_valid_name("blog-staging"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("a/b"));
    }

    #[tokio::test]
    async fn test_unknown_app() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir);

        let err = pool.resolve("missing").await.unwrap_err();
        assert!(matches!(err, AppError::UnknownApp(ref n) if n == "missing"));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_proxy_app_is_cached() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("api"), "8080").unwrap();
        let pool = pool_in(&dir);

        let first = pool.resolve("api").await.unwrap();
        let second = pool.resolve("api").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_dash_expansion_replaces_first_dash() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("acme")).unwrap();
        std::fs::write(dir.path().join("acme").join("web-api"), "4000").unwrap();
        let pool = pool_in(&dir);

        let app = pool.resolve("acme-web-api").await.unwrap();
        assert_eq!(app.address(), "127.0.0.1:4000");
        assert_eq!(app.name(), "acme-web-api");
    }

    #[tokio::test]
    async fn test_bad_symlink_is_reported() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("stale")).unwrap();
        let pool = pool_in(&dir);

        let err = pool.resolve("stale").await.unwrap_err();
        assert!(matches!(err, AppError::UnknownApp(_)));
        assert!(pool
            .events()
            .recent()
            .iter()
            .any(|e| e.starts_with("bad_symlink")));
    }

    #[tokio::test]
    async fn test_invalid_proxy_is_not_cached() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken"), "not a url").unwrap();
        let pool = pool_in(&dir);

        let err = pool.resolve("broken").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidProxy { .. }));
        assert!(pool.is_empty());
        assert!(pool
            .events()
            .recent()
            .iter()
            .any(|e| e.starts_with("error_starting_app app=broken")));
    }

    #[tokio::test]
    async fn test_is_idle_removes_every_key() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("api"), "8080").unwrap();
        std::os::unix::fs::symlink(dir.path().join("api"), dir.path().join("api-v2")).unwrap();
        let pool = pool_in(&dir);

        let app = pool.resolve("api").await.unwrap();
        let alias = pool.resolve("api-v2").await.unwrap();
        assert!(Arc::ptr_eq(&app, &alias));
        assert_eq!(pool.len(), 2);

        assert!(!pool.is_idle(&app));

        app.set_last_use(Instant::now() - Duration::from_secs(7200));
        assert!(pool.is_idle(&app));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_remove_runs_close_callback() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("api"), "8080").unwrap();
        let pool = pool_in(&dir);

        let closed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&closed);
        pool.set_on_close(move |app| sink.lock().push(app.name().to_string()));

        let app = pool.resolve("api").await.unwrap();
        pool.remove(&app);

        assert!(pool.is_empty());
        assert_eq!(*closed.lock(), vec!["api".to_string()]);
    }

    #[tokio::test]
    async fn test_close_callback_may_replace_itself() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("api"), "8080").unwrap();
        let pool = pool_in(&dir);

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let weak = Arc::downgrade(&pool);
        pool.set_on_close(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if let Some(pool) = weak.upgrade() {
                pool.set_on_close(|_| {});
            }
        });

        let app = pool.resolve("api").await.unwrap();
        pool.remove(&app);
        pool.remove(&app);

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        let dir = TempDir::new().unwrap();

        let mut config = PoolConfig::with_dir(dir.path());
        config.port_range_start = 3500;
        config.port_range_end = 3500;
        let err = AppPool::new(config, Arc::new(NoContainers)).unwrap_err();
        assert!(err.to_string().contains("port range 3500..3500"));

        let mut config = PoolConfig::with_dir(dir.path());
        config.idle_check_interval_secs = 0;
        config.readiness_interval_ms = 0;
        let err = AppPool::new(config, Arc::new(NoContainers)).unwrap_err().to_string();
        assert!(err.contains("idle_check_interval_secs"));
        assert!(err.contains("readiness_interval_ms"));
    }

    #[tokio::test]
    async fn test_for_each_sees_aliases() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("api"), "8080").unwrap();
        std::os::unix::fs::symlink(dir.path().join("api"), dir.path().join("edge")).unwrap();
        let pool = pool_in(&dir);

        pool.resolve("edge").await.unwrap();

        let mut keys = Vec::new();
        pool.for_each(|key, app| keys.push((key.to_string(), app.name().to_string())));
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ("api".to_string(), "api".to_string()),
                ("edge".to_string(), "api".to_string()),
            ]
        );
        assert_eq!(pool.apps().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_all_empties_pool() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("api"), "8080").unwrap();
        std::fs::write(dir.path().join("db"), "http://10.0.0.2:5432").unwrap();
        let pool = pool_in(&dir);

        let api = pool.resolve("api").await.unwrap();
        pool.resolve("db").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), pool.purge_all())
            .await
            .expect("purge should finish");

        assert!(pool.is_empty());
        assert!(api.is_dead());
        match api.wait_until_ready().await {
            Err(AppError::Killed { reason }) => assert_eq!(reason, "purging"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dead_entry_is_replaced() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("api"), "8080").unwrap();
        let pool = pool_in(&dir);

        let first = pool.resolve("api").await.unwrap();
        first.cancel("test");
        let second = pool.resolve("api").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.can_serve());
    }
}
