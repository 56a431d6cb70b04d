/// Identifier of a connected peer, as reported by the transport.
pub type PeerId = i32;

/// Identifier of one simulation step's input frame. Monotonically increasing
/// per controller. `INPUT_ID_NONE` is the wire encoding of "no input".
pub type InputId = u32;

pub const INPUT_ID_NONE: InputId = u32::MAX;

macro_rules! index_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            pub const NONE: $name = $name(u32::MAX);

            pub fn index(self) -> usize {
                self.0 as usize
            }

            pub fn is_none(self) -> bool {
                self == Self::NONE
            }
        }
    };
}

index_id!(
    /// Process-local object id: dense, stable for the lifetime of the
    /// process, never transmitted.
    ObjectLocalId
);

index_id!(
    /// Network object id: assigned by the server, transmitted on the wire.
    /// A client may temporarily lack one until a full snapshot arrives.
    ObjectNetId
);

index_id!(
    /// Variable slot id. Within one object these form a contiguous
    /// `[0..n)` range; slots are disabled, never removed.
    VarId
);

index_id!(
    /// Id of a sync group on the server.
    SyncGroupId
);

index_id!(
    /// Handle to a registered change listener.
    ListenerHandle
);

index_id!(
    /// Handle to a registered process function.
    ProcessHandler
);

/// The global sync group: every registered object is implicitly a member and
/// its membership is not user-mutable.
pub const GLOBAL_SYNC_GROUP_ID: SyncGroupId = SyncGroupId(0);

/// Opaque handle into the host application's object model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    pub const NONE: ObjectHandle = ObjectHandle(u64::MAX);
}
