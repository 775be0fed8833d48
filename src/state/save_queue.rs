//! Coalescing persistence queue.
//!
//! Each target path has at most one pending write and at most one worker.
//! A new request for a target that already has a pending write replaces it,
//! so rapid updates collapse into a single write of the latest content.
//! Content is rendered when the write happens, not when it is requested.
//!
//! Writes to one target are strictly sequential and spaced by at least
//! `min_interval`. A failed write is logged and the queue keeps going.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::HubError;

/// Produces the bytes to write for a target, evaluated at write time.
pub type RenderFn = Arc<dyn Fn() -> BoxFuture<'static, crate::Result<Vec<u8>>> + Send + Sync>;

#[derive(Default)]
struct TargetState {
    pending: Option<RenderFn>,
    running: bool,
    last_write: Option<Instant>,
}

struct Inner {
    min_interval: Duration,
    targets: Mutex<HashMap<PathBuf, TargetState>>,
    /// Number of running workers; `flush` waits for zero.
    active: watch::Sender<usize>,
}

/// Deduplicating, per-target sequenced write queue.
#[derive(Clone)]
pub struct SaveQueue {
    inner: Arc<Inner>,
}

impl SaveQueue {
    pub fn new(min_interval: Duration) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                min_interval,
                targets: Mutex::new(HashMap::new()),
                active,
            }),
        }
    }

    /// Request a write of `target`. Replaces any write still pending for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, target: PathBuf, render: RenderFn) {
        let mut targets = self
            .inner
            .targets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = targets.entry(target.clone()).or_default();
        if state.pending.replace(render).is_some() {
            tracing::trace!(path = %target.display(), "coalesced pending write");
        }
        if !state.running {
            state.running = true;
            self.inner.active.send_modify(|n| *n += 1);
            tokio::spawn(run_worker(self.inner.clone(), target));
        }
    }

    /// Wait until every pending write has been attempted.
    pub async fn flush(&self) {
        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
    }

    /// Number of targets with a write waiting to run.
    pub fn pending_count(&self) -> usize {
        self.inner
            .targets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|state| state.pending.is_some())
            .count()
    }
}

async fn run_worker(inner: Arc<Inner>, target: PathBuf) {
    loop {
        let delay = {
            let targets = inner
                .targets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            targets
                .get(&target)
                .and_then(|state| state.last_write)
                .map(|last| (last + inner.min_interval).saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let render = {
            let mut targets = inner
                .targets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let state = targets.entry(target.clone()).or_default();
            match state.pending.take() {
                Some(render) => render,
                None => {
                    state.running = false;
                    inner.active.send_modify(|n| *n = n.saturating_sub(1));
                    return;
                }
            }
        };

        let result = match render().await {
            Ok(bytes) => write_atomic(&target, &bytes).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::debug!(path = %target.display(), "snapshot written"),
            Err(e) => tracing::warn!(
                path = %target.display(),
                error = %e,
                "snapshot write failed, will retry on next change"
            ),
        }

        let mut targets = inner
            .targets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        targets.entry(target.clone()).or_default().last_write = Some(Instant::now());
    }
}

/// Write `bytes` to `path` via a temporary sibling file and a rename, so
/// readers never observe a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> crate::Result<()> {
    let to_err = |e: std::io::Error| HubError::Persistence(path.display().to_string(), e.to_string());

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(to_err)?;
    }
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp, bytes).await.map_err(to_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(to_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_render(value: Arc<AtomicUsize>, renders: Arc<AtomicUsize>) -> RenderFn {
        Arc::new(move || {
            let value = value.clone();
            let renders = renders.clone();
            Box::pin(async move {
                renders.fetch_add(1, Ordering::SeqCst);
                Ok(value.load(Ordering::SeqCst).to_string().into_bytes())
            })
        })
    }

    #[tokio::test]
    async fn test_rapid_requests_coalesce_to_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let queue = SaveQueue::new(Duration::from_millis(20));
        let value = Arc::new(AtomicUsize::new(0));
        let renders = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            value.store(i, Ordering::SeqCst);
            queue.schedule(path.clone(), counting_render(value.clone(), renders.clone()));
        }
        assert_eq!(queue.pending_count(), 1);
        queue.flush().await;

        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "9");
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_writes_to_same_target_are_spaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let queue = SaveQueue::new(Duration::from_millis(100));
        let value = Arc::new(AtomicUsize::new(1));
        let renders = Arc::new(AtomicUsize::new(0));

        queue.schedule(path.clone(), counting_render(value.clone(), renders.clone()));
        queue.flush().await;
        let first = Instant::now();

        value.store(2, Ordering::SeqCst);
        queue.schedule(path.clone(), counting_render(value.clone(), renders.clone()));
        queue.flush().await;

        assert!(first.elapsed() >= Duration::from_millis(90));
        assert_eq!(renders.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "2");
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stop_queue() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let bad = blocker.join("state.json");
        let good = dir.path().join("tools.json");

        let queue = SaveQueue::new(Duration::from_millis(5));
        let value = Arc::new(AtomicUsize::new(5));
        let renders = Arc::new(AtomicUsize::new(0));

        queue.schedule(bad.clone(), counting_render(value.clone(), renders.clone()));
        queue.schedule(good.clone(), counting_render(value.clone(), renders.clone()));
        queue.flush().await;

        assert!(!bad.exists());
        assert_eq!(std::fs::read_to_string(&good).unwrap(), "5");

        value.store(6, Ordering::SeqCst);
        queue.schedule(good.clone(), counting_render(value.clone(), renders.clone()));
        queue.flush().await;
        assert_eq!(std::fs::read_to_string(&good).unwrap(), "6");
    }

    #[tokio::test]
    async fn test_render_error_is_logged_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let queue = SaveQueue::new(Duration::from_millis(5));
        let failing: RenderFn = Arc::new(|| {
            Box::pin(async { Err(HubError::Serialization("boom".to_string())) })
        });

        queue.schedule(path.clone(), failing);
        queue.flush().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("file.json");
        write_atomic(&path, b"{}").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert!(!path.with_file_name("file.json.tmp").exists());
    }
}
