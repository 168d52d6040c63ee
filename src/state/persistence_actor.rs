//! Debounced snapshot persistence on an embedded sled database.
//!
//! Saves are queued, not written: the actor keeps the latest pending
//! [`EngineSnapshot`] and flushes it once the debounce window passes without
//! a newer one arriving (last-write-wins). Parameter edits at fader speed
//! therefore cost one disk write per window, not one per edit. `flush`
//! forces the write immediately; use it before shutdown.

use super::EngineSnapshot;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Default debounce window in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Key the snapshot lives under in sled.
const SNAPSHOT_KEY: &[u8] = b"engine_snapshot";

#[derive(Debug)]
enum Command {
    Save(EngineSnapshot),
    Load(oneshot::Sender<Option<EngineSnapshot>>),
    Flush(oneshot::Sender<Result<()>>),
    Shutdown,
}

/// The actor task. Spawn it, talk through the handle.
pub struct PersistenceActor {
    db: sled::Db,
    command_rx: mpsc::Receiver<Command>,
    pending: Option<EngineSnapshot>,
    last_save_at: Instant,
    debounce_ms: u64,
    write_count: u64,
}

/// Cheap-to-clone handle to the persistence actor.
#[derive(Clone)]
pub struct PersistenceActorHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl PersistenceActor {
    /// Open the database and spawn the actor.
    ///
    /// A `debounce_ms` of 0 writes every snapshot immediately.
    pub fn spawn(db_path: impl AsRef<Path>, debounce_ms: u64) -> Result<PersistenceActorHandle> {
        let db_path = db_path.as_ref();
        let db = sled::open(db_path)
            .with_context(|| format!("failed to open sled database at {}", db_path.display()))?;
        info!(path = %db_path.display(), debounce_ms, "persistence actor started");

        let (cmd_tx, command_rx) = mpsc::channel(64);
        let actor = PersistenceActor {
            db,
            command_rx,
            pending: None,
            last_save_at: Instant::now(),
            debounce_ms,
            write_count: 0,
        };
        tokio::spawn(actor.run());

        Ok(PersistenceActorHandle { cmd_tx })
    }

    async fn run(mut self) {
        let tick = Duration::from_millis(self.debounce_ms.max(100));
        let mut ticker = tokio::time::interval(tick);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    // All handles gone: flush and wind down.
                    None | Some(Command::Shutdown) => {
                        self.flush_pending().await;
                        info!(writes = self.write_count, "persistence actor stopped");
                        return;
                    }
                    Some(Command::Save(snapshot)) => {
                        self.pending = Some(snapshot);
                        self.last_save_at = Instant::now();
                        if self.debounce_ms == 0 {
                            self.flush_pending().await;
                        }
                    }
                    Some(Command::Load(reply)) => {
                        let _ = reply.send(self.load());
                    }
                    Some(Command::Flush(reply)) => {
                        self.flush_pending().await;
                        let _ = reply.send(Ok(()));
                    }
                },
                _ = ticker.tick() => {
                    let window_passed = self.last_save_at.elapsed()
                        >= Duration::from_millis(self.debounce_ms);
                    if self.pending.is_some() && window_passed {
                        self.flush_pending().await;
                    }
                }
            }
        }
    }

    async fn flush_pending(&mut self) {
        let Some(snapshot) = self.pending.take() else {
            return;
        };

        let json = match serde_json::to_vec(&snapshot) {
            Ok(data) => data,
            Err(e) => {
                error!("failed to serialize snapshot: {e}");
                self.pending = Some(snapshot);
                return;
            }
        };

        // sled writes block; keep them off the runtime threads.
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || {
            db.insert(SNAPSHOT_KEY, json)?;
            db.flush()?;
            Ok::<_, sled::Error>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.write_count += 1;
                trace!(write = self.write_count, "snapshot flushed");
            }
            // The snapshot is gone on failure; the next save brings fresh data.
            Ok(Err(e)) => error!("failed to write snapshot: {e}"),
            Err(e) => error!("snapshot write task panicked: {e}"),
        }
    }

    fn load(&self) -> Option<EngineSnapshot> {
        match self.db.get(SNAPSHOT_KEY) {
            Ok(Some(data)) => match serde_json::from_slice::<EngineSnapshot>(&data) {
                Ok(snapshot) => {
                    debug!(
                        version = %snapshot.version,
                        timestamp = snapshot.timestamp,
                        "snapshot loaded"
                    );
                    Some(snapshot)
                }
                Err(e) => {
                    warn!("stored snapshot is unreadable, ignoring: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!("failed to read snapshot: {e}");
                None
            }
        }
    }
}

impl PersistenceActorHandle {
    /// Queue a snapshot for a debounced save (last-write-wins).
    pub async fn save_snapshot(&self, snapshot: EngineSnapshot) -> Result<()> {
        self.cmd_tx
            .send(Command::Save(snapshot))
            .await
            .context("persistence actor is gone")
    }

    /// Read the last flushed snapshot; pending saves are not visible.
    pub async fn load_snapshot(&self) -> Result<Option<EngineSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Load(tx))
            .await
            .context("persistence actor is gone")?;
        rx.await.context("persistence actor dropped the reply")
    }

    /// Write any pending snapshot now.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush(tx))
            .await
            .context("persistence actor is gone")?;
        rx.await.context("persistence actor dropped the reply")?
    }

    /// Fire-and-forget stop; the actor flushes before exiting.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(Command::Shutdown);
    }
}
