//! Wire-level message model and the transport seam.
//!
//! The engine speaks in [`WireMessage`]s; encoding them onto an actual
//! OSC/MIDI link is the job of a [`Transport`] implementation. One transport
//! serves one device channel of the redundant pair.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::sync::mpsc;

pub mod console;

pub use console::ConsoleTransport;

/// Which device of the redundant pair a message travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceIndex {
    First,
    Second,
}

impl DeviceIndex {
    pub fn label(self) -> &'static str {
        match self {
            DeviceIndex::First => "first",
            DeviceIndex::Second => "second",
        }
    }
}

/// Remote message categories understood by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteKind {
    /// Combined X/Y coordinate of a sound object (two floats).
    PositionXy,
    ReverbSend,
    Spread,
    DelayMode,
    InputGain,
    InputMute,
    InputLevel,
    InputName,
    OutputGain,
    OutputMute,
    OutputLevel,
    OutputName,
    /// Select or deselect the addressed object.
    ObjectSelect,
    /// Recall a named selection group by id.
    GroupSelect,
    /// Remotely switch the active UI tab.
    TabSelect,
    /// Device reports whether it currently acts as master.
    DeviceMaster,
}

/// Object address carried by a message.
///
/// `mapping` is only meaningful for coordinate messages; everything else
/// leaves it at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgAddr {
    pub object: u16,
    pub mapping: u8,
}

impl MsgAddr {
    pub fn object(object: u16) -> Self {
        Self { object, mapping: 0 }
    }

    pub fn mapped(object: u16, mapping: u8) -> Self {
        Self { object, mapping }
    }
}

/// A single typed payload element.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Int(i32),
    Float(f32),
    Str(String),
}

impl PayloadValue {
    /// Numeric view of the element; ints widen to float.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            PayloadValue::Int(v) => Some(*v as f32),
            PayloadValue::Float(v) => Some(*v),
            PayloadValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One message in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub kind: RemoteKind,
    pub addr: MsgAddr,
    pub payload: Vec<PayloadValue>,
}

impl WireMessage {
    pub fn float(kind: RemoteKind, addr: MsgAddr, value: f32) -> Self {
        Self {
            kind,
            addr,
            payload: vec![PayloadValue::Float(value)],
        }
    }

    pub fn int(kind: RemoteKind, addr: MsgAddr, value: i32) -> Self {
        Self {
            kind,
            addr,
            payload: vec![PayloadValue::Int(value)],
        }
    }

    pub fn xy(addr: MsgAddr, x: f32, y: f32) -> Self {
        Self {
            kind: RemoteKind::PositionXy,
            addr,
            payload: vec![PayloadValue::Float(x), PayloadValue::Float(y)],
        }
    }

    pub fn text(kind: RemoteKind, addr: MsgAddr, value: impl Into<String>) -> Self {
        Self {
            kind,
            addr,
            payload: vec![PayloadValue::Str(value.into())],
        }
    }
}

/// An inbound message tagged with the device it arrived from.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    pub device: DeviceIndex,
    pub msg: WireMessage,
}

/// Device-local addresses the bridge wants telemetry for.
///
/// Sound objects subscribe per (object, mapping); matrix channels per
/// object number. Ordered sets keep subscription sync output deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    pub sound_objects: BTreeSet<(u16, u8)>,
    pub inputs: BTreeSet<u16>,
    pub outputs: BTreeSet<u16>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sound_objects.is_empty() && self.inputs.is_empty() && self.outputs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sound_objects.len() + self.inputs.len() + self.outputs.len()
    }
}

/// Context handed to a transport at init time.
#[derive(Clone)]
pub struct TransportContext {
    /// Device channel this transport serves.
    pub device: DeviceIndex,
    /// Where decoded inbound messages go.
    pub inbound_tx: mpsc::UnboundedSender<InboundEnvelope>,
}

/// Transport trait - wire codecs and links implement this.
///
/// All methods take &self (not &mut self) to support Arc<dyn Transport>.
/// Implementations should use interior mutability for connection state.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs (e.g. "console", "osc").
    fn name(&self) -> &str;

    /// Open the link and start delivering inbound messages to
    /// `ctx.inbound_tx`.
    async fn init(&self, ctx: TransportContext) -> Result<()>;

    /// Send one message to the device.
    async fn send(&self, msg: &WireMessage) -> Result<()>;

    /// Replace the device-side telemetry subscriptions with `subs`.
    ///
    /// Default implementation: no-op (link has no subscription concept).
    async fn sync_subscriptions(&self, _subs: &SubscriptionSet) -> Result<()> {
        Ok(())
    }

    /// Close the link gracefully.
    async fn shutdown(&self) -> Result<()>;

    /// Current link status.
    ///
    /// Default implementation: always connected.
    fn is_connected(&self) -> bool {
        true
    }
}
