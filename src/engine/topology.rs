//! Address resolution across the redundant device pair.
//!
//! A single logical object number space (1..=128) maps onto one or two
//! physical 64-channel devices depending on the extension mode. Resolution
//! runs before any object lookup, in both directions.

use crate::engine::object::MAX_OBJECT_ID;
use crate::protocol::DeviceIndex;
use serde::{Deserialize, Serialize};

/// Channels per physical device.
pub const DEVICE_CHANNELS: u16 = 64;

/// How the second device relates to the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionMode {
    /// Single device; the second channel is never used.
    Off,
    /// Second device carries object numbers 65..=128.
    Extend,
    /// Both devices hold the full set; one of them is master.
    Mirror,
    /// Both devices addressed in parallel; one side is authoritative.
    Parallel,
}

impl ExtensionMode {
    pub fn label(self) -> &'static str {
        match self {
            ExtensionMode::Off => "off",
            ExtensionMode::Extend => "extend",
            ExtensionMode::Mirror => "mirror",
            ExtensionMode::Parallel => "parallel",
        }
    }
}

/// Which parallel device answers inbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelSide {
    /// No side designated; inbound is dropped until one is.
    None,
    First,
    Second,
}

/// Resolver state for the device pair.
#[derive(Debug, Clone)]
pub struct DeviceTopology {
    mode: ExtensionMode,
    active_side: ParallelSide,
    /// Mirror-mode master, tracked from inbound device telemetry.
    master: DeviceIndex,
}

impl DeviceTopology {
    pub fn new(mode: ExtensionMode, active_side: ParallelSide) -> Self {
        Self {
            mode,
            active_side,
            master: DeviceIndex::First,
        }
    }

    pub fn mode(&self) -> ExtensionMode {
        self.mode
    }

    pub fn active_side(&self) -> ParallelSide {
        self.active_side
    }

    pub fn is_first_master(&self) -> bool {
        self.master == DeviceIndex::First
    }

    pub fn is_second_master(&self) -> bool {
        self.master == DeviceIndex::Second
    }

    /// Returns true when the mode actually changed.
    pub fn set_mode(&mut self, mode: ExtensionMode) -> bool {
        if self.mode == mode {
            return false;
        }
        self.mode = mode;
        true
    }

    pub fn set_active_side(&mut self, side: ParallelSide) -> bool {
        if self.active_side == side {
            return false;
        }
        self.active_side = side;
        true
    }

    /// Fold a device's master claim into the resolver.
    ///
    /// A positive claim wins immediately; a retraction from the current
    /// master hands the role to the other device.
    pub fn note_master(&mut self, device: DeviceIndex, is_master: bool) -> bool {
        let next = if is_master {
            device
        } else if self.master == device {
            match device {
                DeviceIndex::First => DeviceIndex::Second,
                DeviceIndex::Second => DeviceIndex::First,
            }
        } else {
            self.master
        };

        if next == self.master {
            return false;
        }
        self.master = next;
        true
    }

    /// Does the current mode address the second device at all?
    pub fn uses_second_device(&self) -> bool {
        self.mode != ExtensionMode::Off
    }

    /// Translate a device-local object number into the logical space.
    ///
    /// Is telemetry from this device authoritative under the current mode?
    ///
    /// This is the drop half of inbound resolution, usable on its own for
    /// messages that carry no channel number (group recall).
    pub fn accepts_inbound(&self, from: DeviceIndex) -> bool {
        match self.mode {
            ExtensionMode::Off => from == DeviceIndex::First,
            ExtensionMode::Extend => true,
            ExtensionMode::Mirror => from == self.master,
            ExtensionMode::Parallel => matches!(
                (self.active_side, from),
                (ParallelSide::First, DeviceIndex::First)
                    | (ParallelSide::Second, DeviceIndex::Second)
            ),
        }
    }

    /// `None` means the message must be discarded: wrong device for the
    /// mode, non-authoritative mirror/parallel side, or an out-of-range
    /// channel number.
    pub fn resolve_inbound(&self, raw: u16, from: DeviceIndex) -> Option<u16> {
        if raw == 0 || raw > DEVICE_CHANNELS || !self.accepts_inbound(from) {
            return None;
        }
        match (self.mode, from) {
            (ExtensionMode::Extend, DeviceIndex::Second) => Some(raw + DEVICE_CHANNELS),
            _ => Some(raw),
        }
    }

    /// Device routes for one logical object number.
    ///
    /// Empty when the number is unreachable in the current mode.
    pub fn outbound_routes(&self, effective: u16) -> Vec<(DeviceIndex, u16)> {
        if effective == 0 || effective > MAX_OBJECT_ID {
            return Vec::new();
        }

        match self.mode {
            ExtensionMode::Off => {
                if effective <= DEVICE_CHANNELS {
                    vec![(DeviceIndex::First, effective)]
                } else {
                    Vec::new()
                }
            }
            ExtensionMode::Extend => {
                if effective <= DEVICE_CHANNELS {
                    vec![(DeviceIndex::First, effective)]
                } else {
                    vec![(DeviceIndex::Second, effective - DEVICE_CHANNELS)]
                }
            }
            ExtensionMode::Mirror | ExtensionMode::Parallel => {
                if effective <= DEVICE_CHANNELS {
                    vec![
                        (DeviceIndex::First, effective),
                        (DeviceIndex::Second, effective),
                    ]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

impl Default for DeviceTopology {
    fn default() -> Self {
        Self::new(ExtensionMode::Off, ParallelSide::None)
    }
}
