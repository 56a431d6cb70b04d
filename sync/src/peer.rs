use crate::types::{ObjectNetId, SyncGroupId, GLOBAL_SYNC_GROUP_ID};

/// Per remote peer bookkeeping held by the server.
#[derive(Debug, Clone)]
pub struct PeerData {
    /// When `false` the peer is parked outside every sync group and receives
    /// nothing until re-enabled.
    pub enabled: bool,
    /// Net id of the object whose controller this peer commands, if any.
    pub controller_id: ObjectNetId,
    pub sync_group_id: SyncGroupId,
    /// Forces the next snapshot to be emitted regardless of the state timer.
    pub force_notify_snapshot: bool,
    /// The next emitted snapshot for this peer must be a full one.
    pub need_full_snapshot: bool,
}

impl Default for PeerData {
    fn default() -> Self {
        Self {
            enabled: true,
            controller_id: ObjectNetId::NONE,
            sync_group_id: GLOBAL_SYNC_GROUP_ID,
            force_notify_snapshot: false,
            need_full_snapshot: true,
        }
    }
}
