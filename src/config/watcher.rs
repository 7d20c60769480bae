use crate::config::Config;
use anyhow::{Context, Result};
use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Watches the config file and notifies subscribers when a valid new
/// document lands on disk.
///
/// The parent directory is watched, not the file: saves go through a
/// temp-file rename, which replaces the inode and would silently detach a
/// watch on the file itself. Saves performed by the management API also pass
/// through here; the reconcile they trigger is idempotent.
pub struct ConfigWatcher {
    config_path: PathBuf,
    tx: broadcast::Sender<Config>,
}

impl ConfigWatcher {
    pub fn new(config_path: impl Into<PathBuf>) -> (Self, broadcast::Receiver<Config>) {
        let (tx, rx) = broadcast::channel(16);
        (
            Self {
                config_path: config_path.into(),
                tx,
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Config> {
        self.tx.subscribe()
    }

    /// Blocking watch loop; run on a dedicated blocking task.
    pub fn watch(self) -> Result<()> {
        let dir = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self
            .config_path
            .file_name()
            .map(|n| n.to_os_string())
            .context("config path has no file name")?;

        let (sync_tx, sync_rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = recommended_watcher(sync_tx)?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        info!("Watching {:?} for changes to {:?}", dir, file_name);

        // Debounce: a save is a write plus a rename, collapse the burst.
        let mut last_reload = std::time::Instant::now();
        let debounce = Duration::from_millis(100);

        loop {
            match sync_rx.recv() {
                Ok(Ok(event)) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        continue;
                    }
                    if !event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()))
                    {
                        continue;
                    }

                    let now = std::time::Instant::now();
                    if now.duration_since(last_reload) < debounce {
                        continue;
                    }
                    last_reload = now;

                    debug!("Config file changed: {:?}", event);

                    // Let the rename settle before reading.
                    std::thread::sleep(Duration::from_millis(50));

                    match Config::load(&self.config_path) {
                        Ok(config) => {
                            info!("Config reloaded successfully");
                            if self.tx.send(config).is_err() {
                                debug!("No config subscribers, stopping watcher");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Ignoring invalid config after change: {:#}", e);
                        }
                    }
                }
                Ok(Err(e)) => {
                    error!("Watch error: {:?}", e);
                }
                Err(e) => {
                    error!("Channel error: {:?}", e);
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Async wrapper: spawns the blocking watch loop.
pub async fn watch_config_async(
    config_path: String,
) -> (broadcast::Receiver<Config>, tokio::task::JoinHandle<()>) {
    let (watcher, rx) = ConfigWatcher::new(config_path);

    let handle = tokio::task::spawn_blocking(move || {
        if let Err(e) = watcher.watch() {
            error!("Config watcher error: {}", e);
        }
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_watcher_creation() {
        let (watcher, _rx) = ConfigWatcher::new("/tmp/snigate-test-config.json");
        let _rx2 = watcher.subscribe();
    }

    #[tokio::test]
    async fn test_watcher_picks_up_renamed_save() {
        let dir = std::env::temp_dir().join(format!("snigate-watch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        Config::initial().save(&path).unwrap();

        let (watcher, mut rx) = ConfigWatcher::new(&path);
        let _task = tokio::task::spawn_blocking(move || {
            let _ = watcher.watch();
        });
        // Give the blocking watcher a moment to register.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut changed = Config::initial();
        changed.reverse_proxy.disable = true;
        changed.save(&path).unwrap();

        let reloaded =
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("watcher did not fire")
                .unwrap();
        assert!(reloaded.reverse_proxy.disable);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
