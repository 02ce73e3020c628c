//! Proxy-backed applications
//!
//! A regular file in the pool directory names an address that is already
//! being served by something else. It contains either a bare port
//! (`8080` → `http://127.0.0.1:8080`) or a URL (`https://10.0.0.5:8443`,
//! `httpu:///tmp/app.sock`).

use crate::app::{App, AppParts, Target};
use crate::error::AppError;
use crate::pool::AppPool;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use url::Url;

/// Parse the contents of a proxy descriptor file
pub fn parse_descriptor(content: &str) -> Result<Target, String> {
    let content = content.trim();
    if content.is_empty() {
        return Err("empty descriptor".to_string());
    }

    if content.bytes().all(|b| b.is_ascii_digit()) {
        return content
            .parse::<u16>()
            .map(Target::loopback)
            .map_err(|_| format!("port {} out of range", content));
    }

    let url = Url::parse(content).map_err(|e| e.to_string())?;

    match url.host_str().filter(|h| !h.is_empty()) {
        Some(host) => {
            let port = url.port().or_else(|| written_port(content));
            Ok(Target::new(url.scheme(), host, port))
        }
        None if !url.cannot_be_a_base() && url.path().len() > 1 => {
            Ok(Target::new(url.scheme(), url.path(), None))
        }
        None => Err(format!("no host in '{}'", content)),
    }
}

/// Port spelled out in the URL's authority.
///
/// `Url::port` hides a port equal to the scheme default; a descriptor that
/// writes `:80` keeps it.
fn written_port(content: &str) -> Option<u16> {
    let (_, rest) = content.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let (host, port) = host_port.rsplit_once(':')?;
    if host.ends_with(']') || !host.contains(':') {
        port.parse().ok()
    } else {
        None
    }
}

/// Build a proxy-backed app from the descriptor at `path`.
///
/// The app is ready immediately. Its only task waits for cancellation and
/// then drops the app from the pool.
pub(crate) fn read_static<R>(
    pool: &Arc<AppPool>,
    name: &str,
    path: &Path,
    register: R,
) -> Result<Arc<App>, AppError>
where
    R: FnOnce(&Arc<App>),
{
    let content = std::fs::read_to_string(path)
        .map_err(|e| AppError::io("reading proxy descriptor", e))?;

    let target = parse_descriptor(&content).map_err(|reason| AppError::InvalidProxy {
        path: path.to_path_buf(),
        reason,
    })?;

    let app = App::new(
        pool,
        AppParts {
            name: name.to_string(),
            target,
            dir: None,
            public: false,
            process: None,
        },
    );

    app.event_add("proxy_created", &[("destination", app.url())]);
    info!(app = name, destination = %app.url(), "Generated proxy connection");
    register(&app);

    let member = Arc::clone(&app);
    app.group().spawn("proxy", async move {
        member.group().dying().await;
        if let Some(pool) = member.pool() {
            pool.remove(&member);
        }
        Ok(())
    });

    app.ready().close();

    Ok(app)
}
