//! Change-flag matrix shared by every participant of the bridge.
//!
//! Each participant (host, UI pages, remote protocol) owns one bitmask word.
//! Writers mark the kinds they changed into everyone else's word; readers
//! consume their own word with read-and-clear semantics.

use bitflags::bitflags;

bitflags! {
    /// Categories of state a participant can change or observe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChangeKind: u16 {
        const POSITION       = 1 << 0;
        const REVERB_SEND    = 1 << 1;
        const SPREAD         = 1 << 2;
        const DELAY_MODE     = 1 << 3;
        const GAIN           = 1 << 4;
        const MUTE           = 1 << 5;
        const LEVEL          = 1 << 6;
        const NAME           = 1 << 7;
        const OBJECT_ID      = 1 << 8;
        const MAPPING_ID     = 1 << 9;
        const DIRECTION_MODE = 1 << 10;
        const OBJECT_COUNT   = 1 << 11;
        const DEVICE_CONFIG  = 1 << 12;
        const TAB_PAGE       = 1 << 13;
        const SELECTION      = 1 << 14;

        /// Value-carrying parameter kinds.
        const PARAMS = Self::POSITION.bits()
            | Self::REVERB_SEND.bits()
            | Self::SPREAD.bits()
            | Self::DELAY_MODE.bits()
            | Self::GAIN.bits()
            | Self::MUTE.bits()
            | Self::LEVEL.bits();

        /// Addressing configuration of an object.
        const ADDRESSING = Self::OBJECT_ID.bits()
            | Self::MAPPING_ID.bits()
            | Self::DIRECTION_MODE.bits();
    }
}

/// Everyone who reads or writes bridge state.
///
/// `Init` is a pseudo-participant used for default assignment during
/// construction; nothing ever reads its word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Participant {
    Host,
    TablePage,
    SurfacePage,
    SliderPage,
    SettingsPage,
    Protocol,
    Init,
}

impl Participant {
    pub const COUNT: usize = 7;

    pub const ALL: [Participant; Self::COUNT] = [
        Participant::Host,
        Participant::TablePage,
        Participant::SurfacePage,
        Participant::SliderPage,
        Participant::SettingsPage,
        Participant::Protocol,
        Participant::Init,
    ];

    fn idx(self) -> usize {
        self as usize
    }
}

/// One dirty word per participant.
///
/// The matrix itself is not synchronized; it lives behind the single
/// engine mutex together with the object collections.
#[derive(Debug, Clone)]
pub struct ChangeFlags {
    words: [ChangeKind; Participant::COUNT],
}

impl ChangeFlags {
    pub fn new() -> Self {
        Self {
            words: [ChangeKind::empty(); Participant::COUNT],
        }
    }

    /// Record that `source` changed `kinds`.
    ///
    /// ORs the kinds into every word except the source's own. A mark from
    /// the protocol participant additionally clears the protocol's own word
    /// for those kinds, so an inbound remote value never reads as pending
    /// outbound traffic.
    pub fn mark(&mut self, source: Participant, kinds: ChangeKind) {
        for p in Participant::ALL {
            if p != source {
                self.words[p.idx()] |= kinds;
            }
        }
        if source == Participant::Protocol {
            self.words[Participant::Protocol.idx()] &= !kinds;
        }
    }

    /// Does `participant` have any of `kinds` pending? Non-destructive.
    pub fn is_changed(&self, participant: Participant, kinds: ChangeKind) -> bool {
        self.words[participant.idx()].intersects(kinds)
    }

    /// Consume the pending subset of `kinds` for `participant`.
    ///
    /// Returns the kinds that were set; those bits are cleared, the rest of
    /// the word is untouched.
    pub fn pop(&mut self, participant: Participant, kinds: ChangeKind) -> ChangeKind {
        let hits = self.words[participant.idx()] & kinds;
        self.words[participant.idx()] &= !hits;
        hits
    }

    /// Clear `kinds` for `participant` without reading them.
    pub fn clear(&mut self, participant: Participant, kinds: ChangeKind) {
        self.words[participant.idx()] &= !kinds;
    }

    /// Current word for `participant`, for diagnostics.
    pub fn word(&self, participant: Participant) -> ChangeKind {
        self.words[participant.idx()]
    }
}

impl Default for ChangeFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_skips_the_source() {
        let mut flags = ChangeFlags::new();
        flags.mark(Participant::Host, ChangeKind::GAIN);

        assert!(!flags.is_changed(Participant::Host, ChangeKind::GAIN));
        assert!(flags.is_changed(Participant::TablePage, ChangeKind::GAIN));
        assert!(flags.is_changed(Participant::Protocol, ChangeKind::GAIN));
    }

    #[test]
    fn protocol_mark_clears_its_own_word() {
        let mut flags = ChangeFlags::new();

        // A local edit leaves the protocol word dirty...
        flags.mark(Participant::Host, ChangeKind::POSITION);
        assert!(flags.is_changed(Participant::Protocol, ChangeKind::POSITION));

        // ...until a remote value for the same kind arrives.
        flags.mark(Participant::Protocol, ChangeKind::POSITION);
        assert!(!flags.is_changed(Participant::Protocol, ChangeKind::POSITION));
        assert!(flags.is_changed(Participant::Host, ChangeKind::POSITION));
    }

    #[test]
    fn pop_is_read_and_clear() {
        let mut flags = ChangeFlags::new();
        flags.mark(Participant::Host, ChangeKind::MUTE | ChangeKind::GAIN);

        let hits = flags.pop(Participant::SliderPage, ChangeKind::MUTE);
        assert_eq!(hits, ChangeKind::MUTE);

        // Popped bits are gone, untouched bits stay.
        assert_eq!(
            flags.pop(Participant::SliderPage, ChangeKind::MUTE),
            ChangeKind::empty()
        );
        assert!(flags.is_changed(Participant::SliderPage, ChangeKind::GAIN));
    }

    #[test]
    fn repeated_marks_pop_once() {
        let mut flags = ChangeFlags::new();
        flags.mark(Participant::Host, ChangeKind::SPREAD);
        flags.mark(Participant::Host, ChangeKind::SPREAD);
        flags.mark(Participant::SurfacePage, ChangeKind::SPREAD);

        let hits = flags.pop(Participant::Protocol, ChangeKind::PARAMS);
        assert_eq!(hits, ChangeKind::SPREAD);
        assert_eq!(
            flags.pop(Participant::Protocol, ChangeKind::PARAMS),
            ChangeKind::empty()
        );
    }

    #[test]
    fn init_marks_everyone_else() {
        let mut flags = ChangeFlags::new();
        flags.mark(Participant::Init, ChangeKind::all());

        for p in Participant::ALL {
            if p == Participant::Init {
                assert_eq!(flags.word(p), ChangeKind::empty());
            } else {
                assert_eq!(flags.word(p), ChangeKind::all());
            }
        }
    }
}
