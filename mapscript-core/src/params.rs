/// How a flexible-literal call argument is rendered beyond a bare integer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArgumentKind {
    /// Index into the unit string table naming a dialogue label.
    Dialogue,
    /// Ordinal in the item table, rendered as `<Name>`.
    Item,
    /// Ordinal in the map table, rendered as `<Name>`.
    Map,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct ArgumentSlot {
    pub routine: &'static str,
    pub index: usize,
    pub kind: ArgumentKind,
}

// Fixed per routine name and 0-based parameter index. Any argument not
// listed here is a plain integer.
pub(crate) const ARGUMENT_SLOTS: &[ArgumentSlot] = &[
    ArgumentSlot {
        routine: "Message",
        index: 0,
        kind: ArgumentKind::Dialogue,
    },
    ArgumentSlot {
        routine: "Talk",
        index: 0,
        kind: ArgumentKind::Dialogue,
    },
    ArgumentSlot {
        routine: "Ask",
        index: 0,
        kind: ArgumentKind::Dialogue,
    },
    ArgumentSlot {
        routine: "Ask",
        index: 1,
        kind: ArgumentKind::Dialogue,
    },
    ArgumentSlot {
        routine: "Ask",
        index: 2,
        kind: ArgumentKind::Dialogue,
    },
    ArgumentSlot {
        routine: "ShopMessage",
        index: 1,
        kind: ArgumentKind::Dialogue,
    },
    ArgumentSlot {
        routine: "GiveItem",
        index: 0,
        kind: ArgumentKind::Item,
    },
    ArgumentSlot {
        routine: "TakeItem",
        index: 0,
        kind: ArgumentKind::Item,
    },
    ArgumentSlot {
        routine: "HasItem",
        index: 0,
        kind: ArgumentKind::Item,
    },
    ArgumentSlot {
        routine: "ItemCount",
        index: 0,
        kind: ArgumentKind::Item,
    },
    ArgumentSlot {
        routine: "SetChest",
        index: 1,
        kind: ArgumentKind::Item,
    },
    ArgumentSlot {
        routine: "ShopMessage",
        index: 0,
        kind: ArgumentKind::Item,
    },
    ArgumentSlot {
        routine: "Warp",
        index: 0,
        kind: ArgumentKind::Map,
    },
    ArgumentSlot {
        routine: "WarpTo",
        index: 0,
        kind: ArgumentKind::Map,
    },
    ArgumentSlot {
        routine: "SetReturnMap",
        index: 0,
        kind: ArgumentKind::Map,
    },
    ArgumentSlot {
        routine: "IsMapVisited",
        index: 0,
        kind: ArgumentKind::Map,
    },
];

pub(crate) fn argument_kind(routine: &str, index: usize) -> Option<ArgumentKind> {
    ARGUMENT_SLOTS
        .iter()
        .find(|slot| slot.routine == routine && slot.index == index)
        .map(|slot| slot.kind)
}
