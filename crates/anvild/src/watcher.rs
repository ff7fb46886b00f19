//! File-system watching over the source-data root.
//!
//! notify delivers events on its own thread; they buffer in a channel and
//! the driver pulls one batch per tick. Classification of the batch (direct
//! resource change vs compile-dependency change) happens in the server,
//! which owns the dependency index.

use camino::{Utf8Path, Utf8PathBuf};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::mpsc;
use tracing::warn;

use crate::error::{Result, ServerError};

pub struct FileWatcher {
    // Kept alive for the lifetime of the watch; dropping it stops notify.
    _watcher: RecommendedWatcher,
    tx: mpsc::Sender<notify::Result<notify::Event>>,
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
}

impl FileWatcher {
    pub fn start(root: &Utf8Path) -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let watcher_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = watcher_tx.send(event);
        })
        .map_err(|e| ServerError::Watch {
            path: root.to_owned(),
            message: e.to_string(),
        })?;

        watcher
            .watch(root.as_std_path(), RecursiveMode::Recursive)
            .map_err(|e| ServerError::Watch {
                path: root.to_owned(),
                message: e.to_string(),
            })?;

        Ok(Self {
            _watcher: watcher,
            tx,
            rx,
        })
    }

    /// Queue a synthetic change event, as if the file had been touched on
    /// disk. Tools that bypass the watcher (and tests) use this.
    pub fn inject(&self, path: Utf8PathBuf) {
        let _ = self.tx.send(Ok(notify::Event {
            kind: notify::EventKind::Modify(notify::event::ModifyKind::Any),
            paths: vec![path.into_std_path_buf()],
            attrs: Default::default(),
        }));
    }

    /// Pull every buffered change event. Directory events and duplicate
    /// paths are dropped; order of first occurrence is preserved.
    pub fn drain_changed_files(&mut self) -> Vec<Utf8PathBuf> {
        let mut changed = Vec::new();
        for event in self.rx.try_iter() {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                    continue;
                }
            };
            if matches!(event.kind, notify::EventKind::Access(_)) {
                continue;
            }
            for path in event.paths {
                if path.is_dir() {
                    continue;
                }
                let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                    continue;
                };
                if !changed.contains(&path) {
                    changed.push(path);
                }
            }
        }
        changed
    }
}
