//! Console transport - logs all traffic for testing and debugging

use crate::protocol::{SubscriptionSet, Transport, TransportContext, WireMessage};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// ConsoleTransport logs every outbound message instead of encoding it
///
/// This is useful for:
/// - Exercising the dispatch loop without a device on the network
/// - Debugging which values the engine decides to transmit
/// - Development without hardware dependencies
pub struct ConsoleTransport {
    name: String,
    /// Track if transport is initialized
    initialized: Arc<RwLock<bool>>,
    /// Messages accepted so far
    send_count: Arc<RwLock<u64>>,
}

impl ConsoleTransport {
    /// Create a new ConsoleTransport with a given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initialized: Arc::new(RwLock::new(false)),
            send_count: Arc::new(RwLock::new(0)),
        }
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: TransportContext) -> Result<()> {
        info!(
            "🔌 ConsoleTransport '{}' initializing for {} device",
            self.name,
            ctx.device.label()
        );

        *self.initialized.write().await = true;
        *self.send_count.write().await = 0;

        info!("✅ ConsoleTransport '{}' ready", self.name);
        Ok(())
    }

    async fn send(&self, msg: &WireMessage) -> Result<()> {
        if !*self.initialized.read().await {
            warn!(
                "⚠️  ConsoleTransport '{}' not initialized, dropping message",
                self.name
            );
            return Ok(());
        }

        let mut count = self.send_count.write().await;
        *count += 1;
        let send_num = *count;
        drop(count);

        let payload_str = msg
            .payload
            .iter()
            .map(|p| format!("{:?}", p))
            .collect::<Vec<_>>()
            .join(", ");

        info!(
            "📤 [{}] '{}' → {:?} obj={} map={} ({}) [send #{}]",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            self.name,
            msg.kind,
            msg.addr.object,
            msg.addr.mapping,
            payload_str,
            send_num
        );

        Ok(())
    }

    async fn sync_subscriptions(&self, subs: &SubscriptionSet) -> Result<()> {
        if *self.initialized.read().await {
            info!(
                "🔄 ConsoleTransport '{}' subscription sync: {} sound objects, {} inputs, {} outputs",
                self.name,
                subs.sound_objects.len(),
                subs.inputs.len(),
                subs.outputs.len()
            );
            debug!(transport = %self.name, subs = ?subs, "subscription set");
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let was_initialized = *self.initialized.read().await;

        if was_initialized {
            let final_count = *self.send_count.read().await;
            info!(
                "🛑 ConsoleTransport '{}' shutting down ({} messages logged)",
                self.name, final_count
            );
        }

        *self.initialized.write().await = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeviceIndex, MsgAddr, RemoteKind};
    use tokio::sync::mpsc;

    fn make_test_context() -> TransportContext {
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        TransportContext {
            device: DeviceIndex::First,
            inbound_tx,
        }
    }

    #[tokio::test]
    async fn test_console_transport_lifecycle() {
        let transport = ConsoleTransport::new("test");
        let ctx = make_test_context();

        assert_eq!(transport.name(), "test");
        assert!(!*transport.initialized.read().await);

        transport.init(ctx).await.unwrap();
        assert!(*transport.initialized.read().await);

        transport
            .send(&WireMessage::xy(MsgAddr::mapped(3, 1), 0.25, 0.75))
            .await
            .unwrap();
        transport
            .send(&WireMessage::int(RemoteKind::InputMute, MsgAddr::object(3), 1))
            .await
            .unwrap();
        assert_eq!(*transport.send_count.read().await, 2);

        transport
            .sync_subscriptions(&SubscriptionSet::new())
            .await
            .unwrap();

        transport.shutdown().await.unwrap();
        assert!(!*transport.initialized.read().await);
    }

    #[tokio::test]
    async fn test_console_transport_send_without_init() {
        let transport = ConsoleTransport::new("uninit_test");

        // Should succeed but warn (not error)
        let result = transport
            .send(&WireMessage::float(
                RemoteKind::ReverbSend,
                MsgAddr::object(1),
                -6.0,
            ))
            .await;

        assert!(result.is_ok());
        assert_eq!(*transport.send_count.read().await, 0);
    }
}
