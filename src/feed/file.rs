//! Mounted-secret change feed.
//!
//! A secret `namespace/name` is the directory `<root>/<namespace>/<name>`;
//! every regular file inside it is one payload field (file name → contents).
//! This is the layout of a cluster secret mounted as a volume, including the
//! `..data` symlink swap used for atomic updates: entries starting with `.`
//! are skipped and symlinks are followed.
//!
//! The namespace directory is watched recursively with `notify`; on every
//! relevant event the secret directory is re-read and compared against the
//! last delivered state, so duplicate notifications collapse into one event.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{ChangeFeed, RawSecretPayload, SecretEvent, SecretEventStream, SecretRef};
use crate::error::WatchError;

/// Quiet period after a filesystem event before the directory is re-read.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Change feed over secrets mounted as directories.
#[derive(Debug, Clone)]
pub struct FileChangeFeed {
    root: PathBuf,
    default_namespace: String,
}

impl FileChangeFeed {
    /// Feed rooted at `root`; bare secret names resolve into `default_namespace`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, default_namespace: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            default_namespace: default_namespace.into(),
        }
    }

    /// Directory holding `secret`'s fields.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Establish`] if `secret` is not a valid reference.
    pub fn secret_dir(&self, secret: &str) -> Result<PathBuf, WatchError> {
        let secret_ref = SecretRef::parse(secret, &self.default_namespace)?;
        Ok(self.root.join(&secret_ref.namespace).join(&secret_ref.name))
    }
}

#[async_trait]
impl ChangeFeed for FileChangeFeed {
    async fn watch(&self, secret: &str) -> Result<SecretEventStream, WatchError> {
        let secret_dir = self.secret_dir(secret)?;
        let establish = |reason: String| WatchError::Establish {
            secret: secret.to_string(),
            reason,
        };

        let watch_dir = secret_dir
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| establish("secret directory has no parent".to_string()))?;
        if !watch_dir.is_dir() {
            return Err(establish(format!("{} does not exist", watch_dir.display())));
        }

        let (dirty_tx, dirty_rx) = mpsc::channel(16);
        let watcher = create_watcher(dirty_tx, &watch_dir, &secret_dir)
            .map_err(|e| establish(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(16);
        let initial = read_secret_dir(&secret_dir).map_err(|e| establish(e.to_string()))?;
        if let Some(payload) = &initial {
            // Fresh channel with spare capacity.
            let _ = event_tx.try_send(SecretEvent::Added(payload.clone()));
        }

        tokio::spawn(forward_changes(
            secret.to_string(),
            secret_dir,
            initial,
            watcher,
            dirty_rx,
            event_tx,
        ));

        Ok(ReceiverStream::new(event_rx).boxed())
    }
}

/// Filesystem notifications reduced to "something under the secret changed".
enum Dirty {
    Changed,
    Failed(String),
}

fn create_watcher(
    dirty_tx: mpsc::Sender<Dirty>,
    watch_dir: &Path,
    secret_dir: &Path,
) -> notify::Result<RecommendedWatcher> {
    let secret_dir = secret_dir.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            let signal = match result {
                Ok(event) if event.paths.iter().any(|p| p.starts_with(&secret_dir)) => {
                    Dirty::Changed
                }
                Ok(_) => return,
                Err(e) => Dirty::Failed(e.to_string()),
            };
            // Non-blocking send - a full channel already means "re-read".
            let _ = dirty_tx.try_send(signal);
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )?;
    watcher.watch(watch_dir, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Turn change signals into secret events until the consumer goes away.
async fn forward_changes(
    secret: String,
    secret_dir: PathBuf,
    mut last: Option<RawSecretPayload>,
    // Dropping the watcher stops notifications, so it lives in this task.
    _watcher: RecommendedWatcher,
    mut dirty_rx: mpsc::Receiver<Dirty>,
    event_tx: mpsc::Sender<SecretEvent>,
) {
    loop {
        let signal = tokio::select! {
            () = event_tx.closed() => break,
            signal = dirty_rx.recv() => signal,
        };

        match signal {
            Some(Dirty::Changed) => {}
            Some(Dirty::Failed(reason)) => {
                let _ = event_tx
                    .send(SecretEvent::Error(WatchError::Stream {
                        secret: secret.clone(),
                        reason,
                    }))
                    .await;
                break;
            }
            None => break,
        }

        tokio::time::sleep(DEBOUNCE).await;
        while dirty_rx.try_recv().is_ok() {}

        let current = match read_secret_dir(&secret_dir) {
            Ok(current) => current,
            Err(e) => {
                warn!(secret = %secret, error = %e, "Failed to read secret directory");
                continue;
            }
        };

        let event = match (&last, &current) {
            (None, Some(payload)) => SecretEvent::Added(payload.clone()),
            (Some(old), Some(new)) if old != new => SecretEvent::Modified(new.clone()),
            (Some(_), None) => SecretEvent::Deleted,
            _ => continue,
        };
        debug!(secret = %secret, kind = event.kind(), "Secret directory changed");
        last = current;

        if event_tx.send(event).await.is_err() {
            break;
        }
    }
    debug!(secret = %secret, "File change feed closed");
}

/// Read every visible regular file in `dir`; `None` if the directory is gone.
fn read_secret_dir(dir: &Path) -> std::io::Result<Option<RawSecretPayload>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut data = HashMap::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        // metadata() follows symlinks
        if fs::metadata(&path).is_ok_and(|m| m.is_file()) {
            data.insert(name, fs::read(&path)?);
        }
    }
    Ok(Some(RawSecretPayload::new(data)))
}
