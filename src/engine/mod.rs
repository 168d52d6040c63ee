//! Parameter synchronization and dispatch engine.
//!
//! [`Core`] is the shared mutable state: object registry, device topology,
//! change-flag matrix, and the dispatch settings. Everything that touches it
//! goes through one process-wide mutex; the scheduler tick, the inbound
//! pump, and host calls all serialize there so cross-cutting operations
//! (removing an object mid-dispatch, restoring a snapshot) stay atomic.
//!
//! [`Engine`] is the orchestrator around that mutex: it owns the transports,
//! the selection collaborator, and the persistence handle, spawns the ticker
//! and inbound pump tasks, and offers the host-facing API. It is constructed
//! explicitly and passed by reference; there is no global instance.

pub mod flags;
pub mod inbound;
pub mod object;
pub mod registry;
pub mod scheduler;
pub mod selection;
pub mod topology;

#[cfg(test)]
mod tests;

pub use flags::{ChangeFlags, ChangeKind, Participant};
pub use object::{
    BridgeObject, DirectionMode, DirectionSetting, ObjectKind, ParamId, ProcessorId,
    MAX_MAPPING_ID, MAX_OBJECT_ID,
};
pub use registry::ObjectRegistry;
pub use selection::{InMemorySelection, SelectionAccess};
pub use topology::{DeviceTopology, ExtensionMode, ParallelSide, DEVICE_CHANNELS};

use crate::protocol::{DeviceIndex, InboundEnvelope, Transport, TransportContext};
use crate::state::{EngineSnapshot, PersistenceActorHandle};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Dispatch interval bounds in milliseconds.
pub const MIN_TICK_MS: u64 = 20;
pub const MAX_TICK_MS: u64 = 5000;
pub const DEFAULT_TICK_MS: u64 = 100;

/// Clamp a configured dispatch interval into the supported range.
pub fn clamp_tick_ms(ms: u64) -> u64 {
    let clamped = ms.clamp(MIN_TICK_MS, MAX_TICK_MS);
    if clamped != ms {
        warn!(
            requested = ms,
            clamped, "dispatch interval out of range, clamping"
        );
    }
    clamped
}

/// Everything behind the single engine mutex.
#[derive(Debug)]
pub struct Core {
    pub registry: ObjectRegistry,
    pub topology: DeviceTopology,
    /// Global dirty words (object count, device config, tab, selection).
    pub changes: ChangeFlags,
    /// Dispatch interval, already clamped.
    pub tick_ms: u64,
    /// Polling enablement: the tick runs but transmits nothing while false.
    pub online: bool,
    /// Tab page last selected from the remote side.
    pub remote_tab: u8,
}

impl Core {
    pub fn new(topology: DeviceTopology, tick_ms: u64, online: bool) -> Self {
        Self {
            registry: ObjectRegistry::new(),
            topology,
            changes: ChangeFlags::new(),
            tick_ms: clamp_tick_ms(tick_ms),
            online,
            remote_tab: 0,
        }
    }
}

/// Invoked after objects were unlinked but before they are destroyed, so
/// holders of non-owning ids can requery. One call per removal batch.
pub type StaleRefsCallback = Arc<dyn Fn() + Send + Sync>;

/// Read-only view of one object, safe to hold across lock windows.
///
/// The processor id is the only durable handle; re-resolve it instead of
/// caching the view.
#[derive(Debug, Clone)]
pub struct ObjectView {
    pub id: ProcessorId,
    pub kind: ObjectKind,
    pub object_id: u16,
    pub mapping_id: u8,
    pub direction: DirectionSetting,
    pub name: String,
    pub values: Vec<(ParamId, f32)>,
}

impl ObjectView {
    fn of(obj: &BridgeObject) -> Self {
        Self {
            id: obj.id,
            kind: obj.kind,
            object_id: obj.object_id,
            mapping_id: obj.mapping_id,
            direction: DirectionSetting::from_mode(obj.direction),
            name: obj.name.clone(),
            values: obj.kind.params().iter().map(|&p| (p, obj.value(p))).collect(),
        }
    }
}

/// Coarse engine state for listings and diagnostics.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub sound_objects: usize,
    pub matrix_inputs: usize,
    pub matrix_outputs: usize,
    pub mode: ExtensionMode,
    pub active_side: ParallelSide,
    pub first_is_master: bool,
    pub tick_ms: u64,
    pub online: bool,
    pub remote_tab: u8,
    pub saves_scheduled: u64,
}

/// The orchestrator. Construct one per process, share it as `Arc<Engine>`.
pub struct Engine {
    core: Arc<Mutex<Core>>,
    selection: Arc<dyn SelectionAccess>,
    transports: RwLock<HashMap<DeviceIndex, Arc<dyn Transport>>>,
    persistence: RwLock<Option<PersistenceActorHandle>>,
    stale_refs: RwLock<Option<StaleRefsCallback>>,
    /// Non-zero while a removal batch suspends snapshot scheduling.
    batch_depth: AtomicU32,
    saves_scheduled: AtomicU64,
    inbound_tx: mpsc::UnboundedSender<InboundEnvelope>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundEnvelope>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(topology: DeviceTopology, tick_ms: u64, online: bool) -> Self {
        Self::with_selection(topology, tick_ms, online, Arc::new(InMemorySelection::new()))
    }

    pub fn with_selection(
        topology: DeviceTopology,
        tick_ms: u64,
        online: bool,
        selection: Arc<dyn SelectionAccess>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            core: Arc::new(Mutex::new(Core::new(topology, tick_ms, online))),
            selection,
            transports: RwLock::new(HashMap::new()),
            persistence: RwLock::new(None),
            stale_refs: RwLock::new(None),
            batch_depth: AtomicU32::new(0),
            saves_scheduled: AtomicU64::new(0),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn selection(&self) -> Arc<dyn SelectionAccess> {
        self.selection.clone()
    }

    /// Sender a transport (or test) uses to inject inbound telemetry.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<InboundEnvelope> {
        self.inbound_tx.clone()
    }

    /// Attach and initialize the transport serving one device channel.
    pub async fn register_transport(
        &self,
        device: DeviceIndex,
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        let ctx = TransportContext {
            device,
            inbound_tx: self.inbound_tx.clone(),
        };
        transport
            .init(ctx)
            .await
            .with_context(|| format!("transport '{}' failed to initialize", transport.name()))?;
        info!(
            transport = transport.name(),
            device = device.label(),
            "transport registered"
        );
        self.transports.write().await.insert(device, transport);
        Ok(())
    }

    pub async fn set_persistence(&self, handle: PersistenceActorHandle) {
        *self.persistence.write().await = Some(handle);
    }

    pub async fn set_stale_refs_callback(&self, cb: StaleRefsCallback) {
        *self.stale_refs.write().await = Some(cb);
    }

    // ---- host-facing object lifecycle ----

    pub async fn create_object(&self, kind: ObjectKind) -> ProcessorId {
        let id = {
            let mut core = self.core.lock();
            let id = core.registry.create(kind);
            core.changes.mark(Participant::Host, ChangeKind::OBJECT_COUNT);
            id
        };
        self.schedule_save().await;
        id
    }

    /// Two-phase removal: unlink under the lock, notify reference holders,
    /// then destroy. Unknown ids are a silent no-op.
    pub async fn remove_object(&self, id: ProcessorId) -> bool {
        let removed = {
            let mut core = self.core.lock();
            let removed = core.registry.remove(id);
            if removed.is_some() {
                core.changes.mark(Participant::Host, ChangeKind::OBJECT_COUNT);
            }
            removed
        };
        let Some(obj) = removed else {
            debug!(id, "remove of unknown processor id ignored");
            return false;
        };
        self.selection.forget(&[id]);
        self.notify_stale_refs().await;
        drop(obj);
        self.schedule_save().await;
        true
    }

    /// Remove a set of objects with one stale-references notification and at
    /// most one scheduled snapshot save for the whole batch.
    pub async fn remove_batch(&self, ids: &[ProcessorId]) -> usize {
        self.batch_depth.fetch_add(1, Ordering::SeqCst);

        let removed: Vec<BridgeObject> = {
            let mut core = self.core.lock();
            let removed: Vec<BridgeObject> =
                ids.iter().filter_map(|&id| core.registry.remove(id)).collect();
            if !removed.is_empty() {
                core.changes.mark(Participant::Host, ChangeKind::OBJECT_COUNT);
            }
            removed
        };

        let count = removed.len();
        if count > 0 {
            let removed_ids: Vec<ProcessorId> = removed.iter().map(|o| o.id).collect();
            self.selection.forget(&removed_ids);
            self.notify_stale_refs().await;
        }
        drop(removed);

        self.batch_depth.fetch_sub(1, Ordering::SeqCst);
        if count > 0 {
            self.schedule_save().await;
        }
        count
    }

    pub fn resolve(&self, id: ProcessorId) -> Option<ObjectView> {
        self.core.lock().registry.find(id).map(ObjectView::of)
    }

    /// All live objects, collection order (sound objects, inputs, outputs).
    pub fn object_views(&self) -> Vec<ObjectView> {
        self.core.lock().registry.iter().map(ObjectView::of).collect()
    }

    // ---- host-facing mutation ----

    pub async fn set_parameter(
        &self,
        id: ProcessorId,
        param: ParamId,
        value: f32,
        source: Participant,
    ) -> bool {
        let changed = {
            let mut core = self.core.lock();
            match core.registry.find_mut(id) {
                Some(obj) => obj.set_value(param, value, source),
                None => false,
            }
        };
        if changed && source != Participant::Init {
            self.schedule_save().await;
        }
        changed
    }

    pub async fn set_object_id(&self, id: ProcessorId, object_id: u16, source: Participant) -> bool {
        let changed = {
            let mut core = self.core.lock();
            match core.registry.find_mut(id) {
                Some(obj) => obj.set_object_id(object_id, source),
                None => false,
            }
        };
        if changed && source != Participant::Init {
            self.schedule_save().await;
        }
        changed
    }

    pub async fn set_mapping_id(&self, id: ProcessorId, mapping_id: u8, source: Participant) -> bool {
        let changed = {
            let mut core = self.core.lock();
            match core.registry.find_mut(id) {
                Some(obj) => obj.set_mapping_id(mapping_id, source),
                None => false,
            }
        };
        if changed && source != Participant::Init {
            self.schedule_save().await;
        }
        changed
    }

    pub async fn set_direction(
        &self,
        id: ProcessorId,
        direction: DirectionMode,
        source: Participant,
    ) -> bool {
        let changed = {
            let mut core = self.core.lock();
            match core.registry.find_mut(id) {
                Some(obj) => obj.set_direction(direction, source),
                None => false,
            }
        };
        if changed && source != Participant::Init {
            self.schedule_save().await;
        }
        changed
    }

    pub async fn set_name(&self, id: ProcessorId, name: &str, source: Participant) -> bool {
        let changed = {
            let mut core = self.core.lock();
            match core.registry.find_mut(id) {
                Some(obj) => obj.set_name(name, source),
                None => false,
            }
        };
        if changed && source != Participant::Init {
            self.schedule_save().await;
        }
        changed
    }

    pub fn touch_parameter(&self, id: ProcessorId, kinds: ChangeKind) {
        if let Some(obj) = self.core.lock().registry.find_mut(id) {
            obj.touch(kinds);
        }
    }

    pub fn is_parameter_touched(&self, id: ProcessorId, param: ParamId) -> bool {
        self.core
            .lock()
            .registry
            .find(id)
            .map(|o| o.is_touched(param))
            .unwrap_or(false)
    }

    // ---- global configuration ----

    pub async fn set_extension_mode(&self, mode: ExtensionMode) {
        let changed = {
            let mut core = self.core.lock();
            let changed = core.topology.set_mode(mode);
            if changed {
                core.changes.mark(Participant::Host, ChangeKind::DEVICE_CONFIG);
            }
            changed
        };
        if changed {
            info!(mode = mode.label(), "extension mode changed");
            self.schedule_save().await;
        }
    }

    pub async fn set_parallel_side(&self, side: ParallelSide) {
        let changed = {
            let mut core = self.core.lock();
            let changed = core.topology.set_active_side(side);
            if changed {
                core.changes.mark(Participant::Host, ChangeKind::DEVICE_CONFIG);
            }
            changed
        };
        if changed {
            self.schedule_save().await;
        }
    }

    pub async fn set_tick_interval_ms(&self, ms: u64) {
        let clamped = clamp_tick_ms(ms);
        let changed = {
            let mut core = self.core.lock();
            let changed = core.tick_ms != clamped;
            core.tick_ms = clamped;
            if changed {
                core.changes.mark(Participant::Host, ChangeKind::DEVICE_CONFIG);
            }
            changed
        };
        if changed {
            info!(tick_ms = clamped, "dispatch interval changed");
            self.schedule_save().await;
        }
    }

    pub async fn set_online(&self, online: bool) {
        let changed = {
            let mut core = self.core.lock();
            let changed = core.online != online;
            core.online = online;
            if changed {
                core.changes.mark(Participant::Host, ChangeKind::DEVICE_CONFIG);
            }
            changed
        };
        if changed {
            info!(online, "polling enablement changed");
            self.schedule_save().await;
        }
    }

    /// Apply reloaded global settings in one lock window.
    pub async fn apply_settings(
        &self,
        mode: ExtensionMode,
        side: ParallelSide,
        tick_ms: u64,
        online: bool,
    ) {
        let clamped = clamp_tick_ms(tick_ms);
        let changed = {
            let mut core = self.core.lock();
            let mut changed = core.topology.set_mode(mode);
            changed |= core.topology.set_active_side(side);
            changed |= core.tick_ms != clamped;
            core.tick_ms = clamped;
            changed |= core.online != online;
            core.online = online;
            if changed {
                core.changes.mark(Participant::Host, ChangeKind::DEVICE_CONFIG);
            }
            changed
        };
        if changed {
            info!(
                mode = mode.label(),
                tick_ms = clamped,
                online,
                "settings applied"
            );
            self.schedule_save().await;
        }
    }

    pub fn status(&self) -> EngineStatus {
        let core = self.core.lock();
        let (sound_objects, matrix_inputs, matrix_outputs) = core.registry.counts();
        EngineStatus {
            sound_objects,
            matrix_inputs,
            matrix_outputs,
            mode: core.topology.mode(),
            active_side: core.topology.active_side(),
            first_is_master: core.topology.is_first_master(),
            tick_ms: core.tick_ms,
            online: core.online,
            remote_tab: core.remote_tab,
            saves_scheduled: self.saves_scheduled.load(Ordering::Relaxed),
        }
    }

    // ---- snapshots ----

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::from_core(&self.core.lock())
    }

    /// Restore engine state from a snapshot.
    ///
    /// Stale objects are removed before new ones are constructed, then the
    /// usual stale-references notification fires once.
    pub async fn restore_snapshot(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let stale: Vec<ProcessorId> = {
            let mut core = self.core.lock();
            let before = core.registry.live_ids();
            snapshot.apply_to_core(&mut core)?;
            let after = core.registry.live_ids();
            core.changes.mark(
                Participant::Host,
                ChangeKind::OBJECT_COUNT | ChangeKind::DEVICE_CONFIG,
            );
            before.difference(&after).copied().collect()
        };
        self.selection.forget(&stale);
        self.notify_stale_refs().await;
        info!(objects = snapshot.objects.len(), "snapshot restored");
        Ok(())
    }

    /// Restore the last flushed snapshot, if any.
    ///
    /// Returns false when persistence is not attached or holds nothing.
    pub async fn restore_latest(&self) -> Result<bool> {
        let snapshot = {
            let guard = self.persistence.read().await;
            let Some(persistence) = guard.as_ref() else {
                return Ok(false);
            };
            persistence.load_snapshot().await?
        };
        let Some(snapshot) = snapshot else {
            return Ok(false);
        };
        self.restore_snapshot(&snapshot).await?;
        Ok(true)
    }

    /// Save the current state, bypassing the debounce window.
    pub async fn save_now(&self) -> Result<()> {
        let guard = self.persistence.read().await;
        let Some(persistence) = guard.as_ref() else {
            return Ok(());
        };
        persistence.save_snapshot(self.snapshot()).await?;
        persistence.flush().await
    }

    /// Schedule a debounced snapshot save, unless a batch suspends it or no
    /// persistence handle is attached.
    async fn schedule_save(&self) {
        if self.batch_depth.load(Ordering::SeqCst) > 0 {
            return;
        }
        let guard = self.persistence.read().await;
        let Some(persistence) = guard.as_ref() else {
            return;
        };
        let snapshot = self.snapshot();
        if let Err(e) = persistence.save_snapshot(snapshot).await {
            warn!("failed to schedule snapshot save: {e:#}");
        } else {
            self.saves_scheduled.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn notify_stale_refs(&self) {
        if let Some(cb) = self.stale_refs.read().await.as_ref() {
            cb();
        }
    }

    // ---- tasks ----

    /// Spawn the dispatch ticker and the inbound pump.
    pub fn start(self: Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let ticker = {
            let engine = Arc::clone(&self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    let ms = engine.core.lock().tick_ms;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    let out = {
                        let mut core = engine.core.lock();
                        scheduler::run_tick(&mut core)
                    };
                    engine.deliver(out).await;
                }
                debug!("dispatch ticker stopped");
            })
        };
        tasks.push(ticker);

        if let Some(mut rx) = self.inbound_rx.lock().take() {
            let engine = Arc::clone(&self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let pump = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        env = rx.recv() => {
                            let Some(env) = env else { break };
                            let persist = {
                                let mut core = engine.core.lock();
                                inbound::route_inbound(
                                    &mut core,
                                    engine.selection.as_ref(),
                                    &env,
                                )
                            };
                            if persist {
                                engine.schedule_save().await;
                            }
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
                debug!("inbound pump stopped");
            });
            tasks.push(pump);
        }

        info!("engine started");
    }

    /// Hand one tick's output to the transport layer, outside the core lock.
    ///
    /// A failed send is logged and not retried within the tick; the next
    /// value change produces a fresh attempt.
    async fn deliver(&self, out: scheduler::TickOutput) {
        let transports = self.transports.read().await;

        for (device, msg) in &out.sends {
            let Some(transport) = transports.get(device) else {
                debug!(device = device.label(), "no transport for device, dropping send");
                continue;
            };
            if let Err(e) = transport.send(msg).await {
                warn!(
                    device = device.label(),
                    kind = ?msg.kind,
                    "transport send failed: {e:#}"
                );
            }
        }

        if let Some(subs) = out.subscriptions {
            for (device, set) in subs {
                let Some(transport) = transports.get(&device) else {
                    continue;
                };
                if let Err(e) = transport.sync_subscriptions(&set).await {
                    warn!(
                        device = device.label(),
                        "subscription sync failed: {e:#}"
                    );
                }
            }
        }
    }

    /// Stop the tasks, close the transports, flush persistence.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        let transports: Vec<Arc<dyn Transport>> =
            self.transports.write().await.drain().map(|(_, t)| t).collect();
        for transport in transports {
            if let Err(e) = transport.shutdown().await {
                warn!(transport = transport.name(), "transport shutdown failed: {e:#}");
            }
        }

        let persistence = self.persistence.write().await.take();
        if let Some(persistence) = persistence {
            if let Err(e) = persistence.flush().await {
                warn!("final snapshot flush failed: {e:#}");
            }
            persistence.shutdown();
        }

        info!("engine stopped");
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> Arc<Mutex<Core>> {
        Arc::clone(&self.core)
    }
}
