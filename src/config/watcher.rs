//! Configuration file watcher for hot reload.

use super::AppConfig;
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Watches the config file and delivers validated reloads.
///
/// A reload that fails to parse or validate is dropped with a warning; the
/// previous configuration stays in force.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Load the initial config and start watching the file.
    pub async fn new(config_path: String) -> Result<(Self, Arc<AppConfig>)> {
        let (tx, rx) = mpsc::channel(8);

        let initial = Arc::new(
            AppConfig::load(&config_path)
                .await
                .context("failed to load initial config")?,
        );

        // notify callbacks arrive on their own OS thread; capture the
        // runtime handle now so they can hop back into tokio.
        let runtime = tokio::runtime::Handle::current();
        let watched_path = config_path.clone();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_)) {
                        return;
                    }
                    debug!(paths = ?event.paths, "config file modified");
                    let path = watched_path.clone();
                    let tx = tx.clone();
                    runtime.spawn(async move {
                        // Let the editor finish writing before re-reading.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        match AppConfig::load(&path).await {
                            Ok(config) => {
                                info!("configuration reloaded");
                                if tx.send(config).await.is_err() {
                                    error!("config update receiver is gone");
                                }
                            }
                            Err(e) => {
                                warn!("config reload failed, keeping previous config: {e:#}");
                            }
                        }
                    });
                }
                Err(e) => error!("config watch error: {e}"),
            })?;

        watcher
            .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch config file: {config_path}"))?;
        info!(path = %config_path, "config watcher started");

        Ok((
            Self {
                _watcher: watcher,
                rx,
            },
            initial,
        ))
    }

    /// Next successfully reloaded config; `None` once the watcher is gone.
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn picks_up_rewrites_of_the_file() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("gw.yaml");

        fs::write(
            &path,
            "devices:\n  first: \"10.0.0.2:50010\"\nengine:\n  tick_ms: 100\n",
        )?;

        let (mut watcher, config) =
            ConfigWatcher::new(path.to_string_lossy().to_string()).await?;
        assert_eq!(config.engine.tick_ms, 100);

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(
            &path,
            "devices:\n  first: \"10.0.0.2:50010\"\nengine:\n  tick_ms: 250\n",
        )?;

        let reloaded =
            tokio::time::timeout(Duration::from_secs(2), watcher.next_config()).await?;
        if let Some(reloaded) = reloaded {
            assert_eq!(reloaded.engine.tick_ms, 250);
        }

        Ok(())
    }
}
