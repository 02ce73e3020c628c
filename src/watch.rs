//! Polling file-change notification

use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

async fn stamp(path: &Path) -> io::Result<Option<Stamp>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(Stamp {
            modified: meta.modified().ok(),
            len: meta.len(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Block until `path` changes or `cancel` fires.
///
/// Returns `Ok(true)` on the first observed change of modification time or
/// length (a file that disappears counts as changed) and `Ok(false)` once
/// cancelled.
pub async fn watch_file(
    path: &Path,
    cancel: &CancellationToken,
    interval: Duration,
) -> io::Result<bool> {
    let initial = stamp(path).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            _ = tokio::time::sleep(interval) => {
                let current = stamp(path).await?;
                if current != initial {
                    return Ok(true);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_detects_modification() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("restart.txt");
        std::fs::write(&path, "").unwrap();

        let cancel = CancellationToken::new();
        let watched = path.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            watch_file(&watched, &token, Duration::from_millis(20)).await
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::write(&path, "touched").unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watcher should notice the change")
            .unwrap()
            .unwrap();
        assert!(changed);
    }

    #[tokio::test]
    async fn test_cancel_stops_watching() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("restart.txt");
        std::fs::write(&path, "").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let changed = watch_file(&path, &cancel, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn test_removal_counts_as_change() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("restart.txt");
        std::fs::write(&path, "").unwrap();

        let cancel = CancellationToken::new();
        let watched = path.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            watch_file(&watched, &token, Duration::from_millis(20)).await
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::remove_file(&path).unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(changed);
    }
}
