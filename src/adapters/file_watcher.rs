use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::{Context, Result};
use notify::{
    EventKind, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use tokio::sync::mpsc;

/// Quiet period after a change before it is reported
pub const DEBOUNCE: Duration = Duration::from_millis(250);

/// Watches a single file for changes.
///
/// The parent directory is watched rather than the file itself, so editors that save
/// by renaming a fresh copy over the original do not lose the watch.
pub struct FileWatcher {
    path: PathBuf,
    // Dropping the watcher stops the notifications
    _watcher: notify::RecommendedWatcher,
    changes: mpsc::Receiver<()>,
}

impl FileWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid watch path: {}", path.display()))?
            .to_owned();
        let (tx, changes) = mpsc::channel(1);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if is_relevant(&event, &file_name) {
                            tracing::debug!("Watched file changed: {:?}", event.kind);
                            // A pending notification already covers this change
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err_with(|| format!("Failed to watch directory {}", watch_dir.display()))?;

        tracing::info!(path = %path.display(), "Watching file");
        Ok(Self {
            path,
            _watcher: watcher,
            changes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next change, coalescing any burst that follows within [`DEBOUNCE`].
    ///
    /// Returns `false` once the watcher can no longer report changes.
    pub async fn changed(&mut self) -> bool {
        if self.changes.recv().await.is_none() {
            return false;
        }
        tokio::time::sleep(DEBOUNCE).await;
        while self.changes.try_recv().is_ok() {}
        true
    }
}

fn is_relevant(event: &notify::Event, file_name: &OsString) -> bool {
    let kind_matches = match event.kind {
        EventKind::Create(_) => true,
        // The old name going away is followed by events for the new file
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    };
    kind_matches
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}
