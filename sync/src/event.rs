use bitflags::bitflags;

use crate::{
    types::{ObjectLocalId, VarId},
    var::VarValue,
};

bitflags! {
    /// Classes of variable-change events. Listeners subscribe with a mask
    /// and receive only the batches whose flag intersects it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetEventFlag: u32 {
        /// Ordinary intra-tick change.
        const CHANGE = 1 << 0;
        /// Value installed by reconciliation.
        const SYNC_RECOVER = 1 << 1;
        /// Full-reset branch of reconciliation.
        const SYNC_RESET = 1 << 2;
        /// Value observed while resimulating a queued input.
        const SYNC_REWIND = 1 << 3;
        /// Value still different from its pre-sync value once a sync batch
        /// has completed.
        const END_SYNC = 1 << 4;

        const SYNC_ALL = Self::SYNC_RECOVER.bits()
            | Self::SYNC_RESET.bits()
            | Self::SYNC_REWIND.bits();
        const DEFAULT = Self::CHANGE.bits() | Self::END_SYNC.bits();
        const ALWAYS = Self::CHANGE.bits()
            | Self::SYNC_ALL.bits()
            | Self::END_SYNC.bits();
    }
}

/// One watched `(object, variable)` pair of a listener. `old_set` tracks
/// whether the current batch recorded an old value for this slot.
pub(crate) struct WatchingVar {
    pub object: ObjectLocalId,
    pub var: VarId,
    pub old_set: bool,
}

/// A multi-object, multi-variable change watcher. Fires at most once per
/// batch, at flush time, with the old values of its watched variables in
/// watched order.
pub(crate) struct ChangesListener {
    pub callback: Box<dyn FnMut(&[VarValue])>,
    pub flags: NetEventFlag,
    /// `true` outside a batch; cleared when one of the watched vars records
    /// a change, set back when the listener fires.
    pub emitted: bool,
    pub watching: Vec<WatchingVar>,
    pub old_values: Vec<VarValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_intersect_as_expected() {
        assert!(NetEventFlag::DEFAULT.intersects(NetEventFlag::CHANGE));
        assert!(!NetEventFlag::DEFAULT.intersects(NetEventFlag::SYNC_RECOVER));
        assert!(NetEventFlag::SYNC_ALL
            .intersects(NetEventFlag::SYNC_RECOVER | NetEventFlag::SYNC_REWIND));
        assert!(NetEventFlag::ALWAYS.contains(NetEventFlag::END_SYNC));
    }
}
