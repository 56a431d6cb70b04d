use thiserror::Error;

use crate::types::{ObjectLocalId, SyncGroupId};

/// Errors surfaced synchronously by configuration APIs. State is unchanged
/// when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Object local id {0:?} is not registered")]
    UnknownObject(ObjectLocalId),

    #[error("Variable `{name}` is not registered on object {object:?}")]
    UnknownVariable { object: ObjectLocalId, name: String },

    #[error("Sync group {0:?} does not exist")]
    UnknownSyncGroup(SyncGroupId),

    #[error("The global sync group cannot be modified; create a new group")]
    GlobalGroupImmutable,

    #[error("Peer {0} is not connected")]
    UnknownPeer(i32),

    #[error("This operation is only available on the {0}")]
    WrongRole(&'static str),

    #[error("Listener registration is all-or-nothing: {reason}")]
    InvalidListener { reason: String },
}

/// Errors hit while parsing network payloads. The current operation aborts
/// and no partial state is committed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(&'static str),

    #[error("Malformed input batch: {0}")]
    MalformedInputBatch(&'static str),

    #[error("Malformed deferred-sync packet: {0}")]
    MalformedDeferredPacket(&'static str),

    #[error(transparent)]
    Serde(#[from] resim_serde::SerdeErr),
}
