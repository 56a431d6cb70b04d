//! # Resim
//! Client-server scene state synchronization for real-time multi-peer
//! simulations: player inputs ship upstream, incremental world snapshots
//! ship downstream, and clients repair divergence through a deterministic
//! rewind-and-resimulate loop.
//!
//! The [`SceneSynchronizer`] is the sole root: it owns the object/variable
//! registry, selects the server/client/no-net role from the host's
//! [`NetworkInterface`], and reads and writes the simulated objects through
//! the host's [`SynchronizerManager`]. Determinism is a requirement on the
//! host simulation, not a feature this crate provides.

mod client_sync;
mod controller;
mod error;
mod event;
mod interface;
mod no_net_sync;
mod object;
mod peer;
mod processor;
mod registration;
mod scene;
mod server_sync;
mod snapshot;
mod sync_group;
mod synchronizer;
mod types;
mod var;

pub use controller::{
    decode_input_batch, encode_input_batch, ControllerConfig, FrameInput, NetController,
    StatisticalRingBuffer,
};
pub use error::{ConfigError, ProtocolError};
pub use event::NetEventFlag;
pub use interface::{
    ControllerManager, ControllerSetup, NetworkInterface, RpcChannel, SynchronizerManager,
};
pub use object::{ObjectData, VarDescriptor};
pub use peer::PeerData;
pub use processor::ProcessPhase;
pub use registration::ObjectSetup;
pub use server_sync::RelevancyContext;
pub use snapshot::{CompareOutcome, ObjectDivergence, Snapshot};
pub use sync_group::{Change, DeferredObjectInfo, RealtimeObjectInfo, SyncGroup};
pub use synchronizer::{SceneSynchronizer, SyncEvents};
pub use types::{
    InputId, ListenerHandle, ObjectHandle, ObjectLocalId, ObjectNetId, PeerId, ProcessHandler,
    SyncGroupId, VarId, GLOBAL_SYNC_GROUP_ID, INPUT_ID_NONE,
};
pub use var::{NameAndVar, VarValue};
