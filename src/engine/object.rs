//! Object model: sound objects and matrix channels bridged to the device.

use super::flags::{ChangeFlags, ChangeKind, Participant};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Process-local handle id. Never reused while the object is alive.
pub type ProcessorId = u16;

/// Highest addressable object number (two chained 64-channel devices).
pub const MAX_OBJECT_ID: u16 = 128;

/// Coordinate mapping areas offered by the device (0 = unset).
pub const MAX_MAPPING_ID: u8 = 4;

/// Ticks a touched parameter stays marked after the last touch.
pub const GESTURE_DECAY_TICKS: u8 = 3;

/// The three bridged object families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    SoundObject,
    MatrixInput,
    MatrixOutput,
}

impl ObjectKind {
    pub fn label(self) -> &'static str {
        match self {
            ObjectKind::SoundObject => "sound object",
            ObjectKind::MatrixInput => "matrix input",
            ObjectKind::MatrixOutput => "matrix output",
        }
    }

    /// Parameters that exist on this kind.
    pub fn params(self) -> &'static [ParamId] {
        match self {
            ObjectKind::SoundObject => &[
                ParamId::PosX,
                ParamId::PosY,
                ParamId::ReverbSend,
                ParamId::Spread,
                ParamId::DelayMode,
            ],
            ObjectKind::MatrixInput | ObjectKind::MatrixOutput => {
                &[ParamId::Gain, ParamId::Mute, ParamId::Level]
            }
        }
    }

    /// Change kinds this kind transmits when dirty and in Tx mode.
    ///
    /// Levels are telemetry and never leave the bridge.
    pub fn tx_kinds(self) -> &'static [ChangeKind] {
        match self {
            ObjectKind::SoundObject => &[
                ChangeKind::POSITION,
                ChangeKind::REVERB_SEND,
                ChangeKind::SPREAD,
                ChangeKind::DELAY_MODE,
            ],
            ObjectKind::MatrixInput | ObjectKind::MatrixOutput => {
                &[ChangeKind::GAIN, ChangeKind::MUTE]
            }
        }
    }
}

/// Identifies one value slot of an object.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ParamId {
    PosX,
    PosY,
    ReverbSend,
    Spread,
    DelayMode,
    Gain,
    Mute,
    Level,
}

impl ParamId {
    pub const COUNT: usize = 8;

    pub const ALL: [ParamId; Self::COUNT] = [
        ParamId::PosX,
        ParamId::PosY,
        ParamId::ReverbSend,
        ParamId::Spread,
        ParamId::DelayMode,
        ParamId::Gain,
        ParamId::Mute,
        ParamId::Level,
    ];

    fn idx(self) -> usize {
        self as usize
    }

    /// Dirty-flag category this parameter reports under.
    pub fn change_kind(self) -> ChangeKind {
        match self {
            ParamId::PosX | ParamId::PosY => ChangeKind::POSITION,
            ParamId::ReverbSend => ChangeKind::REVERB_SEND,
            ParamId::Spread => ChangeKind::SPREAD,
            ParamId::DelayMode => ChangeKind::DELAY_MODE,
            ParamId::Gain => ChangeKind::GAIN,
            ParamId::Mute => ChangeKind::MUTE,
            ParamId::Level => ChangeKind::LEVEL,
        }
    }

    /// Integer-valued parameters travel as ints on the wire.
    pub fn is_integer(self) -> bool {
        matches!(self, ParamId::DelayMode | ParamId::Mute)
    }

    /// Accepted value range.
    pub fn range(self) -> (f32, f32) {
        match self {
            ParamId::PosX | ParamId::PosY | ParamId::Spread => (0.0, 1.0),
            ParamId::DelayMode => (0.0, 2.0),
            ParamId::Mute => (0.0, 1.0),
            ParamId::ReverbSend | ParamId::Gain | ParamId::Level => (-120.0, 24.0),
        }
    }

    /// Clamp `value` into range; integer parameters also round.
    pub fn normalize(self, value: f32) -> f32 {
        let (lo, hi) = self.range();
        let v = if self.is_integer() { value.round() } else { value };
        v.clamp(lo, hi)
    }

    fn default_value(self) -> f32 {
        match self {
            ParamId::PosX | ParamId::PosY => 0.5,
            _ => 0.0,
        }
    }
}

bitflags! {
    /// Sync direction of one object relative to the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirectionMode: u8 {
        /// Accept inbound values from the device.
        const RX = 1 << 0;
        /// Transmit local changes to the device.
        const TX = 1 << 1;
    }
}

/// Human/config-facing spelling of [`DirectionMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionSetting {
    #[serde(alias = "off")]
    None,
    Rx,
    Tx,
    Both,
}

impl DirectionSetting {
    pub fn to_mode(self) -> DirectionMode {
        match self {
            DirectionSetting::None => DirectionMode::empty(),
            DirectionSetting::Rx => DirectionMode::RX,
            DirectionSetting::Tx => DirectionMode::TX,
            DirectionSetting::Both => DirectionMode::RX | DirectionMode::TX,
        }
    }

    pub fn from_mode(mode: DirectionMode) -> Self {
        match (mode.contains(DirectionMode::RX), mode.contains(DirectionMode::TX)) {
            (false, false) => DirectionSetting::None,
            (true, false) => DirectionSetting::Rx,
            (false, true) => DirectionSetting::Tx,
            (true, true) => DirectionSetting::Both,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DirectionSetting::None => "none",
            DirectionSetting::Rx => "rx",
            DirectionSetting::Tx => "tx",
            DirectionSetting::Both => "both",
        }
    }
}

/// One bridged object: addressing, current values, dirty state.
///
/// All mutation goes through the setters so the change-flag matrix stays
/// consistent with the values.
#[derive(Debug, Clone)]
pub struct BridgeObject {
    pub id: ProcessorId,
    pub kind: ObjectKind,
    /// Device-facing object number, 1-based.
    pub object_id: u16,
    /// Coordinate mapping area for sound objects, 0 = unset.
    pub mapping_id: u8,
    pub direction: DirectionMode,
    pub name: String,
    values: [f32; ParamId::COUNT],
    /// Per-object dirty matrix.
    pub changes: ChangeFlags,
    /// Parameter kinds sent last tick; inbound echoes for them are dropped.
    pub in_transit: ChangeKind,
    /// Whether the object currently takes part in device telemetry.
    pub remote_active: bool,
    touched: ChangeKind,
    touch_left: u8,
}

impl BridgeObject {
    pub fn new(id: ProcessorId, kind: ObjectKind) -> Self {
        let mut values = [0.0; ParamId::COUNT];
        for p in ParamId::ALL {
            values[p.idx()] = p.default_value();
        }

        let mut obj = Self {
            id,
            kind,
            object_id: 1,
            mapping_id: if kind == ObjectKind::SoundObject { 1 } else { 0 },
            direction: DirectionMode::empty(),
            name: String::new(),
            values,
            changes: ChangeFlags::new(),
            in_transit: ChangeKind::empty(),
            remote_active: false,
            touched: ChangeKind::empty(),
            touch_left: 0,
        };
        // Defaults count as a change everyone but init gets to observe.
        obj.changes.mark(Participant::Init, ChangeKind::all());
        obj
    }

    pub fn value(&self, param: ParamId) -> f32 {
        self.values[param.idx()]
    }

    /// Set a parameter on behalf of `source`.
    ///
    /// Returns false when the normalized value is already current; no flags
    /// move in that case.
    pub fn set_value(&mut self, param: ParamId, value: f32, source: Participant) -> bool {
        let v = param.normalize(value);
        if self.values[param.idx()] == v {
            return false;
        }
        self.values[param.idx()] = v;
        self.changes.mark(source, param.change_kind());
        true
    }

    pub fn set_object_id(&mut self, object_id: u16, source: Participant) -> bool {
        let clamped = object_id.clamp(1, MAX_OBJECT_ID);
        if self.object_id == clamped {
            return false;
        }
        self.object_id = clamped;
        self.changes.mark(source, ChangeKind::OBJECT_ID);
        true
    }

    pub fn set_mapping_id(&mut self, mapping_id: u8, source: Participant) -> bool {
        let clamped = mapping_id.min(MAX_MAPPING_ID);
        if self.mapping_id == clamped {
            return false;
        }
        self.mapping_id = clamped;
        self.changes.mark(source, ChangeKind::MAPPING_ID);
        true
    }

    pub fn set_direction(&mut self, direction: DirectionMode, source: Participant) -> bool {
        if self.direction == direction {
            return false;
        }
        self.direction = direction;
        self.changes.mark(source, ChangeKind::DIRECTION_MODE);
        true
    }

    pub fn set_name(&mut self, name: &str, source: Participant) -> bool {
        if self.name == name {
            return false;
        }
        self.name = name.to_string();
        self.changes.mark(source, ChangeKind::NAME);
        true
    }

    /// Mark parameter kinds as under an active touch gesture.
    pub fn touch(&mut self, kinds: ChangeKind) {
        self.touched |= kinds & ChangeKind::PARAMS;
        self.touch_left = GESTURE_DECAY_TICKS;
    }

    pub fn is_touched(&self, param: ParamId) -> bool {
        self.touched.intersects(param.change_kind())
    }

    /// Per-tick upkeep: decay the touch gesture.
    ///
    /// Runs every tick regardless of dirty state.
    pub fn tick(&mut self) {
        if self.touch_left > 0 {
            self.touch_left -= 1;
            if self.touch_left == 0 {
                self.touched = ChangeKind::empty();
            }
        }
    }

    /// Recompute telemetry participation from the direction mode.
    ///
    /// Returns true when the activation state flipped.
    pub fn refresh_remote_active(&mut self) -> bool {
        let active = self.direction.contains(DirectionMode::RX);
        if active == self.remote_active {
            return false;
        }
        self.remote_active = active;
        true
    }
}
